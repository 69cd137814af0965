//! CPU implementations of the core kernel set.
//!
//! Float32 kernels compute in f32 and Int32 kernels in i32 with wrapping
//! overflow. Other dtypes go through f32 and are converted back.

use log::debug;
use tr_tensor::kernel_names::{
    ADD, CAST, FILL, IDENTITY, MUL, NEG, ONES_LIKE, RESHAPE, SQUARE, SUB, SUM, ZEROS_LIKE,
};
use tr_tensor::prelude::*;
use tr_tensor::{attr, input, KernelArgs, TensorInfo};

use crate::ops::{binary_op_broadcast, reduce_sum};
use crate::CpuBackend;

type CpuKernel = fn(KernelArgs<'_>) -> Result<Vec<TensorInfo>>;

/// Register every CPU kernel for the backend registered as `backend_name`.
pub fn register_cpu_kernels(engine: &mut Engine, backend_name: &str) {
    let kernels: [(&str, CpuKernel); 12] = [
        (ADD, add),
        (SUB, sub),
        (MUL, mul),
        (NEG, neg),
        (SQUARE, square),
        (CAST, cast),
        (IDENTITY, identity),
        (FILL, fill),
        (ZEROS_LIKE, zeros_like),
        (ONES_LIKE, ones_like),
        (SUM, sum),
        (RESHAPE, reshape),
    ];
    for (kernel_name, func) in kernels {
        engine.register_kernel(KernelConfig::new(kernel_name, backend_name, func));
    }
    debug!("registered {} cpu kernels for '{backend_name}'", kernels.len());
}

fn cpu(backend: &mut dyn Backend) -> Result<&mut CpuBackend> {
    let name = backend.name().to_string();
    backend
        .as_any_mut()
        .downcast_mut::<CpuBackend>()
        .ok_or_else(|| Error::Backend(format!("backend '{name}' is not a CPU backend")))
}

fn unsupported(kernel: &str, dtype: DType) -> Error {
    Error::InvalidArgument(format!("{kernel} does not support {dtype} tensors"))
}

fn check_numeric(kernel: &str, t: &Tensor) -> Result<()> {
    match t.dtype() {
        DType::Float32 | DType::Int32 => Ok(()),
        other => Err(unsupported(kernel, other)),
    }
}

/// Convert f32 results back to `dtype`.
fn from_f32(data: Vec<f32>, dtype: DType) -> TensorValues {
    match dtype {
        DType::Int32 => TensorValues::I32(data.into_iter().map(|v| v.round() as i32).collect()),
        DType::Bool => TensorValues::Bool(data.into_iter().map(|v| v != 0.0).collect()),
        DType::Complex64 => {
            TensorValues::Complex64(data.into_iter().flat_map(|re| [re, 0.0]).collect())
        }
        _ => TensorValues::F32(data),
    }
}

/// Elementwise operation with one implementation per numeric dtype.
struct NumericOp<const N: usize> {
    float: fn([f32; N]) -> f32,
    int: fn([i32; N]) -> i32,
}

fn binary(kernel: &str, args: KernelArgs<'_>, op: NumericOp<2>) -> Result<Vec<TensorInfo>> {
    let a = input(args.inputs, "a")?;
    let b = input(args.inputs, "b")?;
    check_numeric(kernel, a)?;
    if a.dtype() != b.dtype() {
        return Err(Error::InvalidArgument(format!(
            "{kernel} requires matching dtypes, got {} and {}",
            a.dtype(),
            b.dtype()
        )));
    }
    let cpu = cpu(args.backend)?;
    let (values, shape) = match (cpu.values(a)?, cpu.values(b)?) {
        (TensorValues::I32(x), TensorValues::I32(y)) => {
            let (data, shape) =
                binary_op_broadcast(x, a.shape(), y, b.shape(), |x, y| (op.int)([x, y]))?;
            (TensorValues::I32(data), shape)
        }
        _ => {
            let (data, shape) = binary_op_broadcast(
                &cpu.f32_values(a)?,
                a.shape(),
                &cpu.f32_values(b)?,
                b.shape(),
                |x, y| (op.float)([x, y]),
            )?;
            (from_f32(data, a.dtype()), shape)
        }
    };
    Ok(vec![cpu.write_values(values, shape)?])
}

fn unary(kernel: &str, args: KernelArgs<'_>, op: NumericOp<1>) -> Result<Vec<TensorInfo>> {
    let x = input(args.inputs, "x")?;
    check_numeric(kernel, x)?;
    let cpu = cpu(args.backend)?;
    let values = match cpu.values(x)? {
        TensorValues::I32(v) => TensorValues::I32(v.iter().map(|&v| (op.int)([v])).collect()),
        _ => {
            let data = cpu.f32_values(x)?.into_iter().map(|v| (op.float)([v])).collect();
            from_f32(data, x.dtype())
        }
    };
    Ok(vec![cpu.write_values(values, x.shape().clone())?])
}

fn add(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let op: NumericOp<2> = NumericOp {
        float: |[a, b]| a + b,
        int: |[a, b]| a.wrapping_add(b),
    };
    binary(ADD, args, op)
}

fn sub(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let op: NumericOp<2> = NumericOp {
        float: |[a, b]| a - b,
        int: |[a, b]| a.wrapping_sub(b),
    };
    binary(SUB, args, op)
}

fn mul(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let op: NumericOp<2> = NumericOp {
        float: |[a, b]| a * b,
        int: |[a, b]| a.wrapping_mul(b),
    };
    binary(MUL, args, op)
}

fn neg(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let op: NumericOp<1> = NumericOp {
        float: |[x]| -x,
        int: |[x]| x.wrapping_neg(),
    };
    unary(NEG, args, op)
}

fn square(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let op: NumericOp<1> = NumericOp {
        float: |[x]| x * x,
        int: |[x]| x.wrapping_mul(x),
    };
    unary(SQUARE, args, op)
}

fn cast(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let x = input(args.inputs, "x")?;
    let dtype = attr(args.attrs, "dtype")?
        .as_dtype()
        .ok_or_else(|| Error::InvalidArgument("Cast expects a dtype attribute".into()))?;
    let cpu = cpu(args.backend)?;
    if dtype == x.dtype() {
        return Ok(vec![cpu.alias(x, x.shape().clone())?]);
    }
    let values = match (cpu.values(x)?, dtype) {
        (TensorValues::Strings(_), _) | (_, DType::String) => {
            return Err(Error::InvalidArgument(format!(
                "cannot cast {} to {dtype}",
                x.dtype()
            )))
        }
        // Complex to real keeps the real part.
        (TensorValues::Complex64(v), _) => {
            from_f32(v.chunks(2).map(|pair| pair[0]).collect(), dtype)
        }
        (other, _) => from_f32(other.to_f32_vec()?, dtype),
    };
    Ok(vec![cpu.write_values(values, x.shape().clone())?])
}

fn identity(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let x = input(args.inputs, "x")?;
    let cpu = cpu(args.backend)?;
    Ok(vec![cpu.alias(x, x.shape().clone())?])
}

fn reshape(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let x = input(args.inputs, "x")?;
    let shape = attr(args.attrs, "shape")?
        .as_shape()
        .map(Shape::from)
        .ok_or_else(|| Error::InvalidArgument("Reshape expects a shape attribute".into()))?;
    if shape.numel() != x.numel() {
        return Err(Error::InvalidArgument(format!(
            "cannot reshape {} to {shape}",
            x.shape()
        )));
    }
    let cpu = cpu(args.backend)?;
    Ok(vec![cpu.alias(x, shape)?])
}

fn fill(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let shape = attr(args.attrs, "shape")?
        .as_shape()
        .map(Shape::from)
        .ok_or_else(|| Error::InvalidArgument("Fill expects a shape attribute".into()))?;
    let value = attr(args.attrs, "value")?
        .as_float()
        .ok_or_else(|| Error::InvalidArgument("Fill expects a numeric value attribute".into()))?;
    let dtype = args
        .attrs
        .get("dtype")
        .and_then(AttrValue::as_dtype)
        .unwrap_or(DType::Float32);
    if dtype == DType::String {
        return Err(unsupported(FILL, dtype));
    }
    let cpu = cpu(args.backend)?;
    let values = from_f32(vec![value as f32; shape.numel()], dtype);
    Ok(vec![cpu.write_values(values, shape)?])
}

fn zeros_like(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let x = input(args.inputs, "x")?;
    let cpu = cpu(args.backend)?;
    let values = TensorValues::zeros(x.dtype(), x.numel());
    Ok(vec![cpu.write_values(values, x.shape().clone())?])
}

fn ones_like(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let x = input(args.inputs, "x")?;
    if x.dtype() == DType::String {
        return Err(unsupported(ONES_LIKE, x.dtype()));
    }
    let cpu = cpu(args.backend)?;
    let values = from_f32(vec![1.0; x.numel()], x.dtype());
    Ok(vec![cpu.write_values(values, x.shape().clone())?])
}

fn sum(args: KernelArgs<'_>) -> Result<Vec<TensorInfo>> {
    let x = input(args.inputs, "x")?;
    let axes: Option<Vec<usize>> = match args.attrs.get("axes") {
        Some(AttrValue::Ints(axes)) => Some(
            axes.iter()
                .map(|&ax| {
                    let ax = if ax < 0 { ax + x.ndim() as i64 } else { ax };
                    usize::try_from(ax)
                        .map_err(|_| Error::InvalidArgument(format!("invalid axis {ax}")))
                })
                .collect::<Result<_>>()?,
        ),
        _ => None,
    };
    let keep_dims = args
        .attrs
        .get("keep_dims")
        .and_then(AttrValue::as_bool)
        .unwrap_or(false);
    let cpu = cpu(args.backend)?;
    let axes = axes.as_deref();
    let (values, shape) = match cpu.values(x)? {
        TensorValues::F32(v) => {
            let (data, shape) = reduce_sum(v, x.shape(), axes, keep_dims)?;
            (TensorValues::F32(data), shape)
        }
        TensorValues::I32(v) => {
            let (data, shape) = reduce_sum(v, x.shape(), axes, keep_dims)?;
            (TensorValues::I32(data), shape)
        }
        TensorValues::Bool(v) => {
            let counts: Vec<i32> = v.iter().map(|&b| i32::from(b)).collect();
            let (data, shape) = reduce_sum(&counts, x.shape(), axes, keep_dims)?;
            (TensorValues::I32(data), shape)
        }
        _ => return Err(unsupported(SUM, x.dtype())),
    };
    Ok(vec![cpu.write_values(values, shape)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_cpu_backend;
    use tr_tensor::attrs;

    fn engine() -> Engine {
        let mut engine = Engine::new();
        register_cpu_backend(&mut engine, 1);
        engine
    }

    fn tensor(engine: &mut Engine, data: Vec<f32>, shape: &[usize]) -> Tensor {
        engine
            .make_tensor(TensorValues::F32(data), shape, DType::Float32)
            .unwrap()
    }

    #[test]
    fn test_binary_kernels_broadcast() {
        let mut engine = engine();
        let a = tensor(&mut engine, vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = tensor(&mut engine, vec![10.0, 20.0], &[2]);
        let inputs = named([("a", &a), ("b", &b)]);

        let sum = engine.run_kernel(ADD, &inputs, &Attrs::new()).unwrap();
        assert_eq!(engine.read_f32(&sum).unwrap(), vec![11.0, 22.0, 13.0, 24.0]);
        let diff = engine.run_kernel(SUB, &inputs, &Attrs::new()).unwrap();
        assert_eq!(engine.read_f32(&diff).unwrap(), vec![-9.0, -18.0, -7.0, -16.0]);
        let prod = engine.run_kernel(MUL, &inputs, &Attrs::new()).unwrap();
        assert_eq!(engine.read_f32(&prod).unwrap(), vec![10.0, 40.0, 30.0, 80.0]);
    }

    #[test]
    fn test_aliasing_kernels_share_data() {
        let mut engine = engine();
        let x = tensor(&mut engine, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let y = engine
            .run_kernel(
                RESHAPE,
                &named([("x", &x)]),
                &attrs([("shape", AttrValue::Shape(vec![3, 2]))]),
            )
            .unwrap();
        assert_eq!(y.data_id(), x.data_id());
        assert_eq!(y.shape(), &Shape::from([3, 2]));
        assert_eq!(engine.num_data_buffers(), 1);

        let z = engine.clone_tensor(&x).unwrap();
        assert_eq!(z.data_id(), x.data_id());
        assert_eq!(engine.find_backend("cpu").unwrap().ref_count(x.data_id()), 3);
    }

    #[test]
    fn test_cast_and_sum() {
        let mut engine = engine();
        let x = tensor(&mut engine, vec![1.6, -2.2, 0.0], &[3]);
        let as_int = engine
            .run_kernel(
                CAST,
                &named([("x", &x)]),
                &attrs([("dtype", AttrValue::DType(DType::Int32))]),
            )
            .unwrap();
        assert_eq!(engine.read_sync(&as_int).unwrap(), TensorValues::I32(vec![2, -2, 0]));

        let as_bool = engine
            .run_kernel(
                CAST,
                &named([("x", &x)]),
                &attrs([("dtype", AttrValue::DType(DType::Bool))]),
            )
            .unwrap();
        let count = engine.run_kernel(SUM, &named([("x", &as_bool)]), &Attrs::new()).unwrap();
        assert_eq!(count.dtype(), DType::Int32);
        assert_eq!(engine.read_sync(&count).unwrap(), TensorValues::I32(vec![2]));
    }

    #[test]
    fn test_fill_and_likes() {
        let mut engine = engine();
        let filled = engine
            .run_kernel(
                FILL,
                &NamedTensorMap::new(),
                &attrs([("shape", AttrValue::Shape(vec![2])), ("value", AttrValue::Float(2.5))]),
            )
            .unwrap();
        assert_eq!(engine.read_f32(&filled).unwrap(), vec![2.5, 2.5]);

        let ones = engine.run_kernel(ONES_LIKE, &named([("x", &filled)]), &Attrs::new()).unwrap();
        let zeros = engine.run_kernel(ZEROS_LIKE, &named([("x", &filled)]), &Attrs::new()).unwrap();
        assert_eq!(engine.read_f32(&ones).unwrap(), vec![1.0, 1.0]);
        assert_eq!(engine.read_f32(&zeros).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_int32_arithmetic_is_exact() {
        let mut engine = engine();
        let big = (1 << 24) + 1;
        let a = engine
            .make_tensor(TensorValues::I32(vec![big, -3]), [2], DType::Int32)
            .unwrap();
        let zero = engine
            .make_tensor(TensorValues::I32(vec![0]), [1], DType::Int32)
            .unwrap();

        let sum = engine
            .run_kernel(ADD, &named([("a", &a), ("b", &zero)]), &Attrs::new())
            .unwrap();
        assert_eq!(engine.read_sync(&sum).unwrap(), TensorValues::I32(vec![big, -3]));
        let neg = engine.run_kernel(NEG, &named([("x", &a)]), &Attrs::new()).unwrap();
        assert_eq!(engine.read_sync(&neg).unwrap(), TensorValues::I32(vec![-big, 3]));
        let total = engine.run_kernel(SUM, &named([("x", &a)]), &Attrs::new()).unwrap();
        assert_eq!(engine.read_sync(&total).unwrap(), TensorValues::I32(vec![big - 3]));
    }

    #[test]
    fn test_mismatched_dtypes_are_rejected() {
        let mut engine = engine();
        let a = tensor(&mut engine, vec![1.0], &[1]);
        let b = engine
            .make_tensor(TensorValues::I32(vec![1]), [1], DType::Int32)
            .unwrap();
        let err = engine
            .run_kernel(ADD, &named([("a", &a), ("b", &b)]), &Attrs::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
