//! flashop error types

use crate::dtype::DType;

/// flashop result type
pub type Result<T> = std::result::Result<T, Error>;

/// flashop errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tensor extents are incompatible with each other or with the BSND layout
    #[error("shape mismatch: {reason}")]
    ShapeMismatch {
        /// Description of the incompatibility
        reason: String,
    },

    /// Element type not accepted by the operator or the backend
    #[error("unsupported dtype {dtype}: {reason}")]
    UnsupportedDType {
        /// The rejected dtype
        dtype: DType,
        /// Why it was rejected
        reason: String,
    },

    /// The backend rejected the plan configuration
    #[error("backend planning failed: {reason}")]
    BackendPlanningError {
        /// Description reported by the backend
        reason: String,
    },

    /// Caller workspace smaller than the size published at creation
    #[error("insufficient workspace: required {required} bytes, provided {provided}")]
    InsufficientWorkspace {
        /// Bytes the descriptor needs
        required: usize,
        /// Bytes the caller passed
        provided: usize,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Failure surfaced by the backend while binding or launching a plan
    #[error("backend execution failed: {reason}")]
    BackendExecutionError {
        /// Description reported by the backend
        reason: String,
    },
}

impl Error {
    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            reason: reason.into(),
        }
    }

    pub(crate) fn planning(reason: impl Into<String>) -> Self {
        Error::BackendPlanningError {
            reason: reason.into(),
        }
    }

    pub(crate) fn execution(reason: impl Into<String>) -> Self {
        Error::BackendExecutionError {
            reason: reason.into(),
        }
    }
}
