//! Bridge layer between `ndarray` and `faer` for the dense linear solves in
//! the least-squares fit. Views are borrowed without copying whenever the
//! memory layout allows it.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef};
use ndarray::{Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cannot LU-factor a non-square matrix with {rows} rows and {cols} columns.")]
    NotSquare { rows: usize, cols: usize },
    #[error("LU factorization is numerically singular at pivot {pivot}.")]
    SingularFactor { pivot: usize },
}

/// Convert a faer matrix reference back into an ndarray array.
fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// A faer-compatible view of an ndarray matrix. Standard (row-major) and
/// transposed (column-major) layouts are borrowed in place; any other
/// stride pattern is copied into an owned matrix.
struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = if let Some(slice) = array.as_slice_memory_order() {
            if array.is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else if array.t().is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        } else {
            let (rows, cols) = array.dim();
            FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
        };
        Self { storage }
    }

    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

/// An LU factorization that can be reused across several right-hand sides.
pub struct FaerLuFactor {
    factor: solvers::PartialPivLu<f64>,
}

impl FaerLuFactor {
    /// Solve `A * X = B` for a matrix of right-hand-side columns.
    pub fn solve_mat<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64> {
        let view = FaerArrayView::new(rhs);
        let solution = self.factor.solve(view.as_ref());
        mat_to_array(solution.as_ref())
    }
}

/// LU factorization with partial pivoting for square ndarray matrices.
pub trait FaerLu {
    fn lu(&self) -> Result<FaerLuFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerLu for ArrayBase<S, Ix2> {
    fn lu(&self) -> Result<FaerLuFactor, FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        let view = FaerArrayView::new(self);
        let factor = view.as_ref().partial_piv_lu();

        // Partial-pivot LU never fails outright; a singular system shows up
        // as a (near-)zero diagonal in U. Catch it here so callers get an
        // error instead of a solution full of infinities.
        let u = factor.U();
        let mut largest = 0.0f64;
        for i in 0..rows {
            largest = largest.max(u[(i, i)].abs());
        }
        let threshold = largest * f64::EPSILON * rows as f64;
        for i in 0..rows {
            if u[(i, i)].abs() <= threshold {
                return Err(FaerLinalgError::SingularFactor { pivot: i });
            }
        }
        Ok(FaerLuFactor { factor })
    }
}
