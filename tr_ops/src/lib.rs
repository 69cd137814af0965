//! # tr_ops - Operators for the tr_tensor engine
//!
//! Thin, backend-independent wrappers over [`Engine::run_kernel`] for the core
//! kernel set, plus the gradient definitions that make them differentiable:
//!
//! - **Creation**: `tensor`, `scalar`, `fill`, `zeros`, `ones`, `zeros_like`, `ones_like`
//! - **Arithmetic**: `add`, `sub`, `mul`, `neg`, `square` (with broadcasting)
//! - **Reduction**: `sum`
//! - **Transform**: `reshape`, `cast`, `clone`
//!
//! ## Example
//!
//! ```ignore
//! use tr_tensor::prelude::*;
//!
//! let mut engine = Engine::new();
//! tr_backend_cpu::register_cpu_backend(&mut engine, 1);
//! tr_ops::register_gradients(&mut engine);
//!
//! let x = tr_ops::scalar(&mut engine, 3.0)?;
//! let result = engine.gradients(|e| tr_ops::square(e, &x), &[x.clone()], None, false)?;
//! // d(x^2)/dx = 2x = 6
//! ```

pub mod arithmetic;
pub mod creation;
pub mod finite_diff;
pub mod gradients;
pub mod reduction;
pub mod transform;

pub use arithmetic::{add, mul, neg, square, sub};
pub use creation::{fill, ones, ones_like, scalar, tensor, tensor_i32, zeros, zeros_like};
pub use finite_diff::{max_grad_error, numerical_gradient};
pub use gradients::register_gradients;
pub use reduction::sum;
pub use transform::{cast, clone, reshape};

// Re-export the engine crate for convenience
pub use tr_tensor;
