//! Gradient definitions for the core kernels.
//!
//! Each config maps the output gradient `dy` (plus saved tensors) to one lazy
//! producer per kernel input. Broadcast inputs get `dy` summed back down to
//! their own shape.

use log::debug;
use tr_tensor::kernel_names::{
    ADD, CAST, MUL, NEG, ONES_LIKE, RESHAPE, SQUARE, SUB, SUM, ZEROS_LIKE,
};
use tr_tensor::prelude::*;
use tr_tensor::{GradMap, GradProducer};

use crate::{cast, clone, mul, neg, ones, reshape, scalar, sum, zeros_like};

/// Register gradients for every kernel in the core set.
pub fn register_gradients(engine: &mut Engine) {
    let configs = [
        add_grad(),
        sub_grad(),
        mul_grad(),
        neg_grad(),
        square_grad(),
        cast_grad(),
        sum_grad(),
        reshape_grad(),
        zeros_like_grad(ZEROS_LIKE),
        zeros_like_grad(ONES_LIKE),
    ];
    let count = configs.len();
    for config in configs {
        engine.register_gradient(config);
    }
    debug!("registered {count} gradient configs");
}

fn grad_map<const N: usize>(entries: [(&str, GradProducer); N]) -> GradMap {
    entries
        .into_iter()
        .map(|(name, producer)| (name.to_string(), producer))
        .collect()
}

fn output_grad(kernel: &str, dys: &[Tensor]) -> Result<Tensor> {
    dys.first()
        .cloned()
        .ok_or_else(|| {
            Error::InvalidArgument(format!("{kernel} gradient expects one output gradient"))
        })
}

fn saved_tensor(kernel: &str, saved: &[Tensor], index: usize) -> Result<Tensor> {
    saved
        .get(index)
        .cloned()
        .ok_or_else(|| {
            Error::InvalidArgument(format!("{kernel} gradient is missing saved tensor {index}"))
        })
}

/// Sum `dy` over the axes broadcasting added to `shape`, then restore `shape`.
pub fn reduce_to_shape(engine: &mut Engine, dy: &Tensor, shape: &Shape) -> Result<Tensor> {
    if dy.shape() == shape {
        return Ok(dy.clone());
    }
    let axes: Vec<i64> = shape
        .reduction_axes_from(dy.shape())
        .into_iter()
        .map(|ax| ax as i64)
        .collect();
    let reduced = sum(engine, dy, Some(axes.as_slice()), false)?;
    reshape(engine, &reduced, shape)
}

fn as_float(engine: &mut Engine, t: &Tensor) -> Result<Tensor> {
    if t.dtype() == DType::Float32 {
        Ok(t.clone())
    } else {
        cast(engine, t, DType::Float32)
    }
}

fn add_grad() -> GradConfig {
    GradConfig::new(ADD, |dys, saved, _attrs| {
        let dy = output_grad(ADD, dys)?;
        let a = saved_tensor(ADD, saved, 0)?;
        let b = saved_tensor(ADD, saved, 1)?;
        let dy_b = dy.clone();
        Ok(grad_map([
            (
                "a",
                Box::new(move |e: &mut Engine| reduce_to_shape(e, &dy, a.shape())) as GradProducer,
            ),
            ("b", Box::new(move |e: &mut Engine| reduce_to_shape(e, &dy_b, b.shape()))),
        ]))
    })
    .save_inputs(&["a", "b"])
}

fn sub_grad() -> GradConfig {
    GradConfig::new(SUB, |dys, saved, _attrs| {
        let dy = output_grad(SUB, dys)?;
        let a = saved_tensor(SUB, saved, 0)?;
        let b = saved_tensor(SUB, saved, 1)?;
        let dy_b = dy.clone();
        Ok(grad_map([
            (
                "a",
                Box::new(move |e: &mut Engine| reduce_to_shape(e, &dy, a.shape())) as GradProducer,
            ),
            (
                "b",
                Box::new(move |e: &mut Engine| {
                    let reduced = reduce_to_shape(e, &dy_b, b.shape())?;
                    neg(e, &reduced)
                }),
            ),
        ]))
    })
    .save_inputs(&["a", "b"])
}

fn mul_grad() -> GradConfig {
    GradConfig::new(MUL, |dys, saved, _attrs| {
        let dy = output_grad(MUL, dys)?;
        let a = saved_tensor(MUL, saved, 0)?;
        let b = saved_tensor(MUL, saved, 1)?;
        let (dy_b, a_b, b_b) = (dy.clone(), a.clone(), b.clone());
        Ok(grad_map([
            (
                "a",
                Box::new(move |e: &mut Engine| {
                    let b = as_float(e, &b)?;
                    let da = mul(e, &dy, &b)?;
                    reduce_to_shape(e, &da, a.shape())
                }) as GradProducer,
            ),
            (
                "b",
                Box::new(move |e: &mut Engine| {
                    let a = as_float(e, &a_b)?;
                    let db = mul(e, &dy_b, &a)?;
                    reduce_to_shape(e, &db, b_b.shape())
                }),
            ),
        ]))
    })
    .save_inputs(&["a", "b"])
}

fn neg_grad() -> GradConfig {
    GradConfig::new(NEG, |dys, _saved, _attrs| {
        let dy = output_grad(NEG, dys)?;
        Ok(grad_map([(
            "x",
            Box::new(move |e: &mut Engine| neg(e, &dy)) as GradProducer,
        )]))
    })
}

fn square_grad() -> GradConfig {
    GradConfig::new(SQUARE, |dys, saved, _attrs| {
        let dy = output_grad(SQUARE, dys)?;
        let x = saved_tensor(SQUARE, saved, 0)?;
        Ok(grad_map([(
            "x",
            Box::new(move |e: &mut Engine| {
                // d(x^2)/dx = 2x
                let x = as_float(e, &x)?;
                let two = scalar(e, 2.0)?;
                let two_x = mul(e, &x, &two)?;
                mul(e, &dy, &two_x)
            }) as GradProducer,
        )]))
    })
    .save_inputs(&["x"])
}

fn cast_grad() -> GradConfig {
    GradConfig::new(CAST, |dys, _saved, _attrs| {
        let dy = output_grad(CAST, dys)?;
        Ok(grad_map([(
            "x",
            Box::new(move |e: &mut Engine| clone(e, &dy)) as GradProducer,
        )]))
    })
}

/// Shape of `x` with the summed axes kept as size 1.
fn kept_dims_shape(x_shape: &Shape, attrs: &Attrs) -> Result<Shape> {
    let ndim = x_shape.ndim() as i64;
    let mut dims = x_shape.dims().to_vec();
    match attrs.get("axes") {
        Some(AttrValue::Ints(axes)) => {
            for &ax in axes {
                let ax = if ax < 0 { ax + ndim } else { ax };
                let slot = usize::try_from(ax)
                    .ok()
                    .and_then(|ax| dims.get_mut(ax))
                    .ok_or_else(|| Error::InvalidArgument(format!("invalid axis {ax}")))?;
                *slot = 1;
            }
        }
        _ => dims.iter_mut().for_each(|d| *d = 1),
    }
    Ok(Shape::new(dims))
}

fn sum_grad() -> GradConfig {
    GradConfig::new(SUM, |dys, saved, attrs| {
        let dy = output_grad(SUM, dys)?;
        let x = saved_tensor(SUM, saved, 0)?;
        let expanded = kept_dims_shape(x.shape(), attrs)?;
        Ok(grad_map([(
            "x",
            Box::new(move |e: &mut Engine| {
                let dy = reshape(e, &dy, expanded)?;
                let spread = ones(e, x.shape().clone(), DType::Float32)?;
                mul(e, &dy, &spread)
            }) as GradProducer,
        )]))
    })
    .save_inputs(&["x"])
}

fn reshape_grad() -> GradConfig {
    GradConfig::new(RESHAPE, |dys, saved, _attrs| {
        let dy = output_grad(RESHAPE, dys)?;
        let x = saved_tensor(RESHAPE, saved, 0)?;
        Ok(grad_map([(
            "x",
            Box::new(move |e: &mut Engine| reshape(e, &dy, x.shape().clone())) as GradProducer,
        )]))
    })
    .save_inputs(&["x"])
}

/// `ZerosLike` and `OnesLike` outputs do not depend on the input values.
fn zeros_like_grad(kernel: &'static str) -> GradConfig {
    GradConfig::new(kernel, move |dys, _saved, _attrs| {
        let dy = output_grad(kernel, dys)?;
        Ok(grad_map([(
            "x",
            Box::new(move |e: &mut Engine| zeros_like(e, &dy)) as GradProducer,
        )]))
    })
}
