use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NurbsError>;

/// One reason an eager pre-evaluation constraint check failed.
///
/// These checks run before every evaluation, derivative, normal, inversion,
/// and approximation call, so an entity whose backing arrays were mutated into
/// an invalid state is rejected before any computation touches it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintKind {
    #[error("Control point weight at flat index {index} is {value}, but every weight must be positive and finite.")]
    NonPositiveWeight { index: usize, value: f64 },

    #[error("Points carry {found} coordinates each, but {expected} are required here.")]
    WrongDimension { expected: usize, found: usize },

    #[error("The {axis} knot vector must repeat 0 for its first {multiplicity} entries and 1 for its last {multiplicity} entries.")]
    UnclampedKnots {
        axis: &'static str,
        multiplicity: usize,
    },

    #[error("The {axis} knot vector decreases at index {index}.")]
    UnsortedKnots { axis: &'static str, index: usize },

    #[error("Parameter arrays disagree in length: {expected} vs. {found}.")]
    ShapeMismatch { expected: usize, found: usize },
}

/// A comprehensive error type for all operations in this crate.
#[derive(Error, Debug)]
pub enum NurbsError {
    /// Constructor, allocation, or solver arguments violate a sizing
    /// invariant, e.g. too few control points for the requested degree.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An entity failed its eager pre-evaluation checks.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(#[from] ConstraintKind),

    /// Point inversion exhausted its iteration budget with unresolved
    /// points. Recoverable by relaxing the solver parameters, not a
    /// programming defect.
    #[error(
        "Convergence failed for {unconverged} of {total} points after {max_iters} iterations; \
         try to increase `num_samples`, `max_iters`, `distance_tolerance`, or `cosine_tolerance`."
    )]
    NoConvergence {
        unconverged: usize,
        total: usize,
        max_iters: usize,
    },

    /// Surface approximation cannot use one axis of the sample grid: every
    /// line along it collapses to a single point, or the normal equations
    /// built from it are singular.
    #[error("Degenerate input: the {axis}-direction sample lines have no usable chord lengths or yield a singular fitting system.")]
    DegenerateInput { axis: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_kind_converts_into_nurbs_error() {
        let kind = ConstraintKind::NonPositiveWeight {
            index: 3,
            value: -1.0,
        };
        match NurbsError::from(kind) {
            NurbsError::ConstraintViolation(ConstraintKind::NonPositiveWeight {
                index,
                value,
            }) => {
                assert_eq!(index, 3);
                assert_eq!(value, -1.0);
            }
            other => panic!("Expected ConstraintViolation, got {other:?}"),
        }
    }

    #[test]
    fn test_no_convergence_message_names_the_solver_parameters() {
        let err = NurbsError::NoConvergence {
            unconverged: 2,
            total: 5,
            max_iters: 100,
        };
        let message = err.to_string();
        assert!(message.contains("2 of 5"));
        assert!(message.contains("num_samples"));
        assert!(message.contains("max_iters"));
    }
}
