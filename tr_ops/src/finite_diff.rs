//! Finite difference utilities for gradient verification.
//!
//! Provides numerical gradients of engine computations for checking the
//! registered gradient functions.

use tr_tensor::prelude::*;

use crate::{sum, tensor};

/// Central finite-difference gradient of `sum(f(x))` with respect to every
/// element of `x`, in row-major order.
///
/// Each probe runs inside its own tidy scope, so nothing `f` allocates
/// survives the call.
///
/// # Example
/// ```ignore
/// // f(x) = x^2, df/dx = 2x
/// let x = tr_ops::tensor(&mut engine, &[3.0, -1.0], [2])?;
/// let grads = numerical_gradient(&mut engine, |e, x| tr_ops::square(e, x), &x, 1e-2)?;
/// assert!(max_grad_error(&grads, &[6.0, -2.0]) < 1e-3);
/// ```
pub fn numerical_gradient<F>(engine: &mut Engine, f: F, x: &Tensor, eps: f32) -> Result<Vec<f32>>
where
    F: Fn(&mut Engine, &Tensor) -> Result<Tensor>,
{
    let point = engine.read_f32(x)?;
    let mut grads = Vec::with_capacity(point.len());
    let mut perturbed = point.clone();

    for i in 0..point.len() {
        perturbed[i] = point[i] + eps;
        let f_plus = evaluate(engine, &f, &perturbed, x.shape())?;

        perturbed[i] = point[i] - eps;
        let f_minus = evaluate(engine, &f, &perturbed, x.shape())?;

        perturbed[i] = point[i];
        grads.push((f_plus - f_minus) / (2.0 * eps));
    }

    Ok(grads)
}

fn evaluate<F>(engine: &mut Engine, f: &F, values: &[f32], shape: &Shape) -> Result<f32>
where
    F: Fn(&mut Engine, &Tensor) -> Result<Tensor>,
{
    let total = engine.tidy(|e| {
        let probe = tensor(e, values, shape)?;
        let y = f(e, &probe)?;
        sum(e, &y, None, false)
    })?;
    let value = engine.read_f32(&total);
    engine.dispose_tensor(&total)?;
    value?
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidArgument("sum produced no value".into()))
}

/// Maximum absolute difference between two gradient vectors.
pub fn max_grad_error(grad1: &[f32], grad2: &[f32]) -> f32 {
    debug_assert_eq!(grad1.len(), grad2.len());
    grad1
        .iter()
        .zip(grad2.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mul, register_gradients, square};
    use tr_backend_cpu::register_cpu_backend;

    fn engine() -> Engine {
        let mut engine = Engine::new();
        register_cpu_backend(&mut engine, 1);
        register_gradients(&mut engine);
        engine
    }

    #[test]
    fn test_numerical_gradient_quadratic() {
        let mut engine = engine();
        let x = tensor(&mut engine, &[3.0, -1.0, 0.5], [3]).unwrap();

        let grads = numerical_gradient(&mut engine, |e, x| square(e, x), &x, 1e-2).unwrap();
        assert!(max_grad_error(&grads, &[6.0, -2.0, 1.0]) < 1e-2);
    }

    #[test]
    fn test_probes_do_not_leak() {
        let mut engine = engine();
        let x = tensor(&mut engine, &[1.0, 2.0], [2]).unwrap();
        let before = engine.num_tensors();

        numerical_gradient(&mut engine, |e, x| mul(e, x, x), &x, 1e-2).unwrap();
        assert_eq!(engine.num_tensors(), before);
    }

    #[test]
    fn test_max_grad_error() {
        let err = max_grad_error(&[1.0, 2.0, 3.0], &[1.1, 2.0, 2.8]);
        assert!((err - 0.2).abs() < 1e-5);
    }
}
