//! Tensor constructors.

use tr_tensor::kernel_names::{FILL, ONES_LIKE, ZEROS_LIKE};
use tr_tensor::prelude::*;

/// Float32 tensor from `data` laid out row-major in `shape`.
pub fn tensor(engine: &mut Engine, data: &[f32], shape: impl Into<Shape>) -> Result<Tensor> {
    engine.make_tensor(TensorValues::F32(data.to_vec()), shape, DType::Float32)
}

pub fn tensor_i32(engine: &mut Engine, data: &[i32], shape: impl Into<Shape>) -> Result<Tensor> {
    engine.make_tensor(TensorValues::I32(data.to_vec()), shape, DType::Int32)
}

/// Rank-0 float32 tensor.
pub fn scalar(engine: &mut Engine, value: f32) -> Result<Tensor> {
    tensor(engine, &[value], Shape::scalar())
}

/// Tensor of `shape` with every element set to `value`.
pub fn fill(
    engine: &mut Engine,
    shape: impl Into<Shape>,
    value: f64,
    dtype: DType,
) -> Result<Tensor> {
    let shape = shape.into();
    engine.run_kernel(
        FILL,
        &NamedTensorMap::new(),
        &attrs([
            ("shape", AttrValue::Shape(shape.dims().to_vec())),
            ("value", AttrValue::Float(value)),
            ("dtype", AttrValue::DType(dtype)),
        ]),
    )
}

pub fn zeros(engine: &mut Engine, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
    fill(engine, shape, 0.0, dtype)
}

pub fn ones(engine: &mut Engine, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
    fill(engine, shape, 1.0, dtype)
}

/// Zeros with the shape and dtype of `x`.
pub fn zeros_like(engine: &mut Engine, x: &Tensor) -> Result<Tensor> {
    engine.run_kernel(ZEROS_LIKE, &named([("x", x)]), &Attrs::new())
}

/// Ones with the shape and dtype of `x`.
pub fn ones_like(engine: &mut Engine, x: &Tensor) -> Result<Tensor> {
    engine.run_kernel(ONES_LIKE, &named([("x", x)]), &Attrs::new())
}
