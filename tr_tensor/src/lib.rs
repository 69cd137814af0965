//! # tr_tensor - Backend-Agnostic Tensor Execution Engine
//!
//! This crate provides the core of a tensor runtime with pluggable compute
//! backends: tensor handles decoupled from backend storage, scope-based
//! reclamation, a kernel registry, priority-ordered backend selection and a
//! gradient tape for reverse-mode differentiation.
//!
//! ## Overview
//!
//! The core abstractions are:
//! - [`Engine`] - owns every registry, the scope stack, the tape and the variables
//! - [`Backend`] - storage contract implemented by compute backends
//! - [`Tensor`] and [`Variable`] - handles into backend-resident data
//! - [`KernelConfig`] / [`GradConfig`] - forward kernels and their gradients
//! - [`TensorContainer`] - values whose tensors survive a [`Engine::tidy`] scope
//!
//! ## Example
//!
//! ```ignore
//! use tr_tensor::prelude::*;
//!
//! let mut engine = Engine::new();
//! tr_backend_cpu::register_cpu_backend(&mut engine, 1);
//!
//! let a = engine.make_tensor(TensorValues::F32(vec![1.0, 2.0, 3.0]), [3], DType::Float32)?;
//! let b = engine.tidy(|e| e.run_kernel("Add", &named([("a", &a), ("b", &a)]), &Attrs::new()))?;
//! assert_eq!(engine.read_f32(&b)?, vec![2.0, 4.0, 6.0]);
//! ```

pub mod autodiff;
pub mod backend;
pub mod backend_registry;
pub mod config;
pub mod data_store;
pub mod dtype;
pub mod engine;
pub mod error;
mod execute;
pub mod kernel_names;
pub mod kernel_registry;
pub mod profiler;
pub mod scope;
mod selector;
pub mod shape;
pub mod tape;
pub mod tensor;
mod variables;

pub use autodiff::{CustomGradOutput, GradientsResult, VariableGrads};
pub use backend::{wall_time, Backend, BackendFactory, BackendInit, BackendMemory};
pub use backend_registry::BackendState;
pub use config::EngineConfig;
pub use dtype::{DType, TensorValues};
pub use engine::Engine;
pub use error::{Error, Result};
pub use kernel_registry::{
    attr, attrs, input, AttrValue, Attrs, GradConfig, GradFunc, GradMap, GradProducer,
    KernelArgs, KernelConfig, KernelFunc,
};
pub use profiler::{KernelProfile, MemoryInfo, ProfileInfo, TimingInfo};
pub use scope::TensorContainer;
pub use shape::{Shape, Strides, MAX_RANK};
pub use tensor::{named, DataId, NamedTensorMap, Tensor, TensorId, TensorInfo, Variable};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::autodiff::{CustomGradOutput, GradientsResult, VariableGrads};
    pub use crate::backend::{Backend, BackendInit};
    pub use crate::config::EngineConfig;
    pub use crate::dtype::{DType, TensorValues};
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::kernel_registry::{attrs, AttrValue, Attrs, GradConfig, KernelConfig};
    pub use crate::scope::TensorContainer;
    pub use crate::shape::Shape;
    pub use crate::tensor::{named, NamedTensorMap, Tensor, Variable};
}
