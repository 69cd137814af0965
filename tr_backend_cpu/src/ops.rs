//! Dense array helpers shared by the CPU kernels.

use std::ops::AddAssign;

use tr_tensor::{Error, Result, Shape};

/// Iterator over all multi-dimensional indices of a shape, row-major.
pub(crate) struct TensorIndices<'a> {
    shape: &'a Shape,
    current: Vec<usize>,
    done: bool,
}

impl<'a> TensorIndices<'a> {
    pub(crate) fn new(shape: &'a Shape) -> Self {
        TensorIndices {
            shape,
            current: vec![0; shape.ndim()],
            // A scalar yields one empty index; an empty shape yields nothing.
            done: shape.ndim() > 0 && shape.numel() == 0,
        }
    }
}

impl Iterator for TensorIndices<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.current.clone();
        if self.shape.ndim() == 0 {
            self.done = true;
            return Some(result);
        }

        // Odometer increment, rightmost axis first.
        let mut i = self.shape.ndim() - 1;
        loop {
            self.current[i] += 1;
            if self.current[i] < self.shape.dim(i) {
                break;
            }
            self.current[i] = 0;
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
        }
        Some(result)
    }
}

/// Expand `data` of `shape` to `target` by repeating size-1 and missing axes.
pub(crate) fn broadcast_to<T: Copy>(data: &[T], shape: &Shape, target: &Shape) -> Vec<T> {
    if shape == target {
        return data.to_vec();
    }
    let offset = target.ndim() - shape.ndim();
    let strides = shape.contiguous_strides();
    let mut out = Vec::with_capacity(target.numel());
    for out_idx in TensorIndices::new(target) {
        let in_idx: Vec<usize> = (0..shape.ndim())
            .map(|i| if shape.dim(i) == 1 { 0 } else { out_idx[offset + i] })
            .collect();
        let in_flat = if in_idx.is_empty() { 0 } else { strides.index(&in_idx) };
        out.push(data[in_flat]);
    }
    out
}

/// Elementwise `op` over two broadcast-compatible arrays.
pub(crate) fn binary_op_broadcast<T, F>(
    a: &[T],
    a_shape: &Shape,
    b: &[T],
    b_shape: &Shape,
    op: F,
) -> Result<(Vec<T>, Shape)>
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    let out_shape = a_shape.broadcast_with(b_shape).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "shapes {a_shape} and {b_shape} are not broadcast compatible"
        ))
    })?;
    let a = broadcast_to(a, a_shape, &out_shape);
    let b = broadcast_to(b, b_shape, &out_shape);
    let data = a.iter().zip(b.iter()).map(|(&x, &y)| op(x, y)).collect();
    Ok((data, out_shape))
}

/// Sum over `axes` (all axes when `None`).
pub(crate) fn reduce_sum<T>(
    data: &[T],
    shape: &Shape,
    axes: Option<&[usize]>,
    keep_dims: bool,
) -> Result<(Vec<T>, Shape)>
where
    T: Copy + Default + AddAssign,
{
    let ndim = shape.ndim();
    let reduce_axes: Vec<usize> = axes
        .map(<[usize]>::to_vec)
        .unwrap_or_else(|| (0..ndim).collect());
    if let Some(&bad) = reduce_axes.iter().find(|&&ax| ax >= ndim) {
        return Err(Error::InvalidArgument(format!(
            "axis {bad} is out of range for rank {ndim}"
        )));
    }

    let out_dims: Vec<usize> = (0..ndim)
        .filter_map(|i| match (reduce_axes.contains(&i), keep_dims) {
            (true, true) => Some(1),
            (true, false) => None,
            (false, _) => Some(shape.dim(i)),
        })
        .collect();
    let out_shape = Shape::new(out_dims);
    let out_strides = out_shape.contiguous_strides();
    let in_strides = shape.contiguous_strides();

    let mut out = vec![T::default(); out_shape.numel()];
    for in_idx in TensorIndices::new(shape) {
        let out_idx: Vec<usize> = (0..ndim)
            .filter_map(|i| match (reduce_axes.contains(&i), keep_dims) {
                (true, true) => Some(0),
                (true, false) => None,
                (false, _) => Some(in_idx[i]),
            })
            .collect();
        let in_flat = if in_idx.is_empty() { 0 } else { in_strides.index(&in_idx) };
        let out_flat = if out_idx.is_empty() { 0 } else { out_strides.index(&out_idx) };
        out[out_flat] += data[in_flat];
    }
    Ok((out, out_shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices() {
        let shape = Shape::from([2, 2]);
        let all: Vec<Vec<usize>> = TensorIndices::new(&shape).collect();
        assert_eq!(all, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);

        let scalar = Shape::scalar();
        assert_eq!(TensorIndices::new(&scalar).count(), 1);
        let empty = Shape::from([3, 0]);
        assert_eq!(TensorIndices::new(&empty).count(), 0);
    }

    #[test]
    fn test_broadcasting() {
        let (out, shape) = binary_op_broadcast(
            &[1.0, 2.0, 3.0],
            &Shape::from([3]),
            &[10.0],
            &Shape::scalar(),
            |a, b| a + b,
        )
        .unwrap();
        assert_eq!(shape, Shape::from([3]));
        assert_eq!(out, vec![11.0, 12.0, 13.0]);

        let (out, _) = binary_op_broadcast(
            &[1.0, 2.0, 3.0, 4.0],
            &Shape::from([2, 2]),
            &[10.0, 20.0],
            &Shape::from([2]),
            |a, b| a + b,
        )
        .unwrap();
        assert_eq!(out, vec![11.0, 22.0, 13.0, 24.0]);

        let mismatched =
            binary_op_broadcast(&[0.0; 2], &Shape::from([2]), &[0.0; 3], &Shape::from([3]), |a, _| a);
        assert!(mismatched.is_err());
    }

    #[test]
    fn test_sum_reduction() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let shape = Shape::from([2, 3]);

        let (total, s) = reduce_sum(&data, &shape, None, false).unwrap();
        assert!(s.is_scalar());
        assert_eq!(total, vec![21.0]);

        let (sum0, s) = reduce_sum(&data, &shape, Some([0].as_slice()), false).unwrap();
        assert_eq!(s, Shape::from([3]));
        assert_eq!(sum0, vec![5.0, 7.0, 9.0]);

        let (sum1, s) = reduce_sum(&data, &shape, Some([1].as_slice()), true).unwrap();
        assert_eq!(s, Shape::from([2, 1]));
        assert_eq!(sum1, vec![6.0, 15.0]);

        assert!(reduce_sum(&data, &shape, Some([2].as_slice()), false).is_err());
    }

    #[test]
    fn test_integer_reduction_is_exact() {
        let big = 1 << 24;
        let (total, _) = reduce_sum(&[big, 1, 0], &Shape::from([3]), None, false).unwrap();
        assert_eq!(total, vec![big + 1]);
    }
}
