//! Element types and host-side tensor values.

use std::fmt;

use crate::error::{invalid, Result};

/// The closed set of element types a tensor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Int32,
    Bool,
    Complex64,
    String,
}

impl DType {
    /// Bytes per element for fixed-width dtypes. Strings have no fixed width.
    pub fn bytes_per_element(self) -> Option<usize> {
        match self {
            DType::Float32 | DType::Int32 => Some(4),
            DType::Bool => Some(1),
            DType::Complex64 => Some(8),
            DType::String => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
            DType::Bool => "bool",
            DType::Complex64 => "complex64",
            DType::String => "string",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat host-side contents of a tensor, as written to and read from a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValues {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
    /// Interleaved `[re0, im0, re1, im1, ...]`.
    Complex64(Vec<f32>),
    /// Encoded bytes per element.
    Strings(Vec<Vec<u8>>),
}

impl TensorValues {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValues::F32(_) => DType::Float32,
            TensorValues::I32(_) => DType::Int32,
            TensorValues::Bool(_) => DType::Bool,
            TensorValues::Complex64(_) => DType::Complex64,
            TensorValues::Strings(_) => DType::String,
        }
    }

    /// Number of logical elements.
    pub fn len(&self) -> usize {
        match self {
            TensorValues::F32(v) => v.len(),
            TensorValues::I32(v) => v.len(),
            TensorValues::Bool(v) => v.len(),
            TensorValues::Complex64(v) => v.len() / 2,
            TensorValues::Strings(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage footprint in bytes. String tensors count their encoded bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            TensorValues::Strings(v) => v.iter().map(Vec::len).sum(),
            other => other.len() * other.dtype().bytes_per_element().unwrap_or(0),
        }
    }

    /// Zero-filled values of `len` elements.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Float32 => TensorValues::F32(vec![0.0; len]),
            DType::Int32 => TensorValues::I32(vec![0; len]),
            DType::Bool => TensorValues::Bool(vec![false; len]),
            DType::Complex64 => TensorValues::Complex64(vec![0.0; len * 2]),
            DType::String => TensorValues::Strings(vec![Vec::new(); len]),
        }
    }

    pub fn from_strings<S: AsRef<str>>(values: &[S]) -> Self {
        TensorValues::Strings(values.iter().map(|s| s.as_ref().as_bytes().to_vec()).collect())
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorValues::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric contents widened to f32. Fails for complex and string values.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self {
            TensorValues::F32(v) => Ok(v.clone()),
            TensorValues::I32(v) => Ok(v.iter().map(|&x| x as f32).collect()),
            TensorValues::Bool(v) => Ok(v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect()),
            other => Err(invalid(format!(
                "{} values have no real-valued view",
                other.dtype()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_lengths_and_bytes() {
        let c = TensorValues::Complex64(vec![1.0, 0.0, 2.0, -1.0]);
        assert_eq!(c.len(), 2);
        assert_eq!(c.byte_size(), 16);

        let s = TensorValues::from_strings(&["ab", "cde"]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.byte_size(), 5);
        assert_eq!(s.dtype(), DType::String);
    }

    #[test]
    fn test_widening() {
        let b = TensorValues::Bool(vec![true, false]);
        assert_eq!(b.to_f32_vec().unwrap(), vec![1.0, 0.0]);
        assert!(TensorValues::from_strings(&["x"]).to_f32_vec().is_err());
    }

    #[test]
    fn test_zeros() {
        assert_eq!(TensorValues::zeros(DType::Int32, 3), TensorValues::I32(vec![0, 0, 0]));
        assert_eq!(TensorValues::zeros(DType::Complex64, 1).len(), 1);
    }
}
