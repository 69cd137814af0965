//! Elementwise arithmetic with numpy-style broadcasting.

use tr_tensor::kernel_names::{ADD, MUL, NEG, SQUARE, SUB};
use tr_tensor::prelude::*;

fn binary(engine: &mut Engine, kernel: &str, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    engine.run_kernel(kernel, &named([("a", a), ("b", b)]), &Attrs::new())
}

fn unary(engine: &mut Engine, kernel: &str, x: &Tensor) -> Result<Tensor> {
    engine.run_kernel(kernel, &named([("x", x)]), &Attrs::new())
}

pub fn add(engine: &mut Engine, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(engine, ADD, a, b)
}

pub fn sub(engine: &mut Engine, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(engine, SUB, a, b)
}

pub fn mul(engine: &mut Engine, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(engine, MUL, a, b)
}

pub fn neg(engine: &mut Engine, x: &Tensor) -> Result<Tensor> {
    unary(engine, NEG, x)
}

pub fn square(engine: &mut Engine, x: &Tensor) -> Result<Tensor> {
    unary(engine, SQUARE, x)
}
