//! Engine error taxonomy.

use thiserror::Error;

use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::{DataId, TensorId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors.
    #[error("cannot find registered kernel '{kernel}' for backend '{backend}'")]
    KernelNotFound { kernel: String, backend: String },
    #[error("backend '{0}' not found in registry")]
    BackendNotFound(String),
    #[error(
        "backend '{0}' has not yet been initialized; await ready() or set_backend() before running kernels"
    )]
    BackendNotReady(String),
    #[error("could not initialize any backends, all backend initializations failed")]
    NoBackendAvailable,
    #[error("variable with name '{0}' was already registered")]
    DuplicateVariable(String),
    #[error("end_scope called with no open scope")]
    ScopeUnderflow,
    #[error("rank {rank} exceeds the supported maximum of {max}")]
    RankTooLarge { rank: usize, max: usize },

    // Leak detection.
    #[error("backend '{backend}' has an internal memory leak ({leaked} data ids) after running '{kernel}'")]
    MemoryLeak {
        backend: String,
        kernel: String,
        leaked: usize,
    },

    // Autodiff connectivity and gradient validation.
    #[error(
        "cannot compute gradient of y=f(x) with respect to x; make sure f encloses all operations that lead from x to y"
    )]
    NoGradientPath,
    #[error("cannot compute gradient: gradient function not found for '{kernel}'")]
    GradientFunctionMissing { kernel: String },
    #[error("cannot backprop through input '{input}' of '{kernel}'; available gradients: {available:?}")]
    MissingGradient {
        kernel: String,
        input: String,
        available: Vec<String>,
    },
    #[error("gradient of input '{input}' of '{kernel}' must have float32 dtype, but has {dtype}")]
    GradientDType {
        kernel: String,
        input: String,
        dtype: DType,
    },
    #[error("gradient of input '{input}' of '{kernel}' has shape {grad}, which does not match the input shape {input_shape}")]
    GradientShape {
        kernel: String,
        input: String,
        grad: Shape,
        input_shape: Shape,
    },
    #[error("cannot assign {found_dtype} {found_shape} to variable '{name}' of {dtype} {shape}")]
    AssignMismatch {
        name: String,
        dtype: DType,
        shape: Shape,
        found_dtype: DType,
        found_shape: Shape,
    },

    // Handle lifetime.
    #[error("data id {0:?} not found; it was disposed or never created")]
    DataNotFound(DataId),
    #[error("tensor {0:?} is disposed")]
    TensorDisposed(TensorId),

    // Backend contract.
    #[error("'{method}' is not implemented for backend '{backend}'")]
    NotImplemented { backend: String, method: &'static str },
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub fn not_implemented(backend: &str, method: &'static str) -> Error {
    Error::NotImplemented {
        backend: backend.to_string(),
        method,
    }
}

pub fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidArgument(msg.into())
}
