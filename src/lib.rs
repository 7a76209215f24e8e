#![deny(dead_code)]
#![deny(unused_imports)]

//! Evaluation, differentiation, point inversion, and least-squares fitting
//! of NURBS curves and surfaces with clamped knot vectors over the `[0, 1]`
//! parameter domain. All entry points are batched: they take arrays of
//! parameters or targets and fan the per-point work out across a thread
//! pool.

pub mod basis;
pub mod curve;
pub mod error;
pub mod fit;
pub mod inversion;
mod linalg;
pub mod surface;

pub use curve::NurbsCurve;
pub use error::{ConstraintKind, NurbsError, Result};
pub use inversion::InversionConfig;
pub use surface::NurbsSurface;
