//! Shape and dtype transforms. These alias the input's data where possible.

use tr_tensor::kernel_names::{CAST, RESHAPE};
use tr_tensor::prelude::*;

/// View `x` with a new shape holding the same number of elements.
pub fn reshape(engine: &mut Engine, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
    let shape = shape.into();
    engine.run_kernel(
        RESHAPE,
        &named([("x", x)]),
        &attrs([("shape", AttrValue::Shape(shape.dims().to_vec()))]),
    )
}

pub fn cast(engine: &mut Engine, x: &Tensor, dtype: DType) -> Result<Tensor> {
    engine.run_kernel(
        CAST,
        &named([("x", x)]),
        &attrs([("dtype", AttrValue::DType(dtype))]),
    )
}

/// New handle sharing `x`'s data.
pub fn clone(engine: &mut Engine, x: &Tensor) -> Result<Tensor> {
    engine.clone_tensor(x)
}
