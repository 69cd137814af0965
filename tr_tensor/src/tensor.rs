//! Tensor handles: logical array values decoupled from backend storage.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dtype::DType;
use crate::shape::Shape;

/// Global counters for tensor and data identities. Ids are never reused.
static TENSOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
static DATA_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a tensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl TensorId {
    pub(crate) fn next() -> Self {
        TensorId(TENSOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque key into the data store and a backend's storage.
///
/// Backends mint new ids with [`DataId::next`] when they write fresh storage;
/// an id keeps its identity when the data moves between backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(u64);

impl DataId {
    pub fn next() -> Self {
        DataId(DATA_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// What a kernel hands back: storage identity plus layout, not yet a tracked tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub data_id: DataId,
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorInfo {
    pub fn new(data_id: DataId, shape: impl Into<Shape>, dtype: DType) -> Self {
        TensorInfo {
            data_id,
            shape: shape.into(),
            dtype,
        }
    }
}

/// A tracked tensor handle. Cloning the handle does not create an alias; use
/// `Engine::clone_tensor` for that.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    id: TensorId,
    data_id: DataId,
    shape: Shape,
    dtype: DType,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id.0)
            .field("data_id", &self.data_id.0)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Tensor {
    pub(crate) fn new(id: TensorId, data_id: DataId, shape: Shape, dtype: DType) -> Self {
        Tensor {
            id,
            data_id,
            shape,
            dtype,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn data_id(&self) -> DataId {
        self.data_id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    pub fn info(&self) -> TensorInfo {
        TensorInfo::new(self.data_id, self.shape.clone(), self.dtype)
    }

    pub(crate) fn rebind(&mut self, data_id: DataId) {
        self.data_id = data_id;
    }
}

/// A named, mutable binding to tensor storage that survives scope exit.
///
/// The variable keeps its tensor id across `Engine::assign`; only the bound
/// data id changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    trainable: bool,
    pub(crate) tensor: Tensor,
}

impl Variable {
    pub(crate) fn new(name: String, trainable: bool, tensor: Tensor) -> Self {
        Variable {
            name,
            trainable,
            tensor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn shape(&self) -> &Shape {
        self.tensor.shape()
    }

    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }
}

impl AsRef<Tensor> for Variable {
    fn as_ref(&self) -> &Tensor {
        &self.tensor
    }
}

/// Kernel inputs keyed by input name (`"a"`, `"b"`, `"x"`, ...).
pub type NamedTensorMap = BTreeMap<String, Tensor>;

/// Build a [`NamedTensorMap`] from `(name, tensor)` pairs.
pub fn named<'a, I>(pairs: I) -> NamedTensorMap
where
    I: IntoIterator<Item = (&'a str, &'a Tensor)>,
{
    pairs
        .into_iter()
        .map(|(name, t)| (name.to_string(), t.clone()))
        .collect()
}
