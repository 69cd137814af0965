//! Reductions.

use tr_tensor::kernel_names::SUM;
use tr_tensor::prelude::*;

/// Sum over `axes` (every axis when `None`). Negative axes count from the end.
/// Bool and int32 inputs sum to int32.
pub fn sum(
    engine: &mut Engine,
    x: &Tensor,
    axes: Option<&[i64]>,
    keep_dims: bool,
) -> Result<Tensor> {
    let mut sum_attrs = attrs([("keep_dims", AttrValue::Bool(keep_dims))]);
    if let Some(axes) = axes {
        sum_attrs.insert("axes".to_string(), AttrValue::Ints(axes.to_vec()));
    }
    engine.run_kernel(SUM, &named([("x", x)]), &sum_attrs)
}
