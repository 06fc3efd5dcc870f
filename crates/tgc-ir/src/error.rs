//! Error kinds for graph construction, operators, and passes.

use thiserror::Error;

/// Errors raised by operators, graph mutations, and passes.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A shape could not be constructed.
    #[error(transparent)]
    Shape(#[from] tgc_shape::ShapeError),

    /// Inputs violated an operator's shape preconditions.
    #[error("shape mismatch in {op}: {reason}")]
    ShapeMismatch {
        /// Operator name.
        op: String,
        /// What went wrong.
        reason: String,
    },

    /// An operator without `compute` was asked to execute.
    #[error("operator {op} is not computable")]
    NotComputable {
        /// Operator name.
        op: String,
    },

    /// A mutation would break the DAG or its topological order.
    #[error("bad graph: {0}")]
    BadGraph(String),

    /// Lookup by name for a parameter that does not exist.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// A type-erased operator was accessed as the wrong concrete type.
    #[error("bad operator cast to {expected}")]
    BadCast {
        /// The requested concrete type.
        expected: &'static str,
    },

    /// A pass post-condition was violated. Fatal; indicates a bug.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl Error {
    /// Shorthand for [`Error::ShapeMismatch`].
    pub fn shape_mismatch(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            op: op.into(),
            reason: reason.into(),
        }
    }
}
