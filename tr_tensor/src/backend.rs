//! Backend trait - the storage contract every compute backend satisfies.
//!
//! The engine never touches tensor bytes itself: it asks the owning backend to
//! write, read, move and free them. Kernels reach backend-specific state by
//! downcasting through [`Backend::as_any_mut`].

use std::any::Any;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;

use crate::dtype::{DType, TensorValues};
use crate::error::{not_implemented, Result};
use crate::shape::Shape;
use crate::tensor::DataId;

/// Memory report of a single backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendMemory {
    pub num_bytes: usize,
    pub num_data_buffers: usize,
    /// Set when the byte count is an estimate.
    pub unreliable: bool,
    pub reasons: Vec<String>,
}

/// Backend contract.
///
/// Only `name`, `num_data_ids`, `ref_count` and the `Any` accessors are
/// required. Every other method defaults to a [`crate::Error::NotImplemented`]
/// failure so callers can detect unsupported capabilities.
pub trait Backend: Any {
    /// Human-readable backend identifier (e.g. `"cpu"`).
    fn name(&self) -> &str;

    /// Read values back, possibly suspending.
    fn read(&self, data_id: DataId) -> LocalBoxFuture<'_, Result<TensorValues>> {
        let values = self.read_sync(data_id);
        Box::pin(async move { values })
    }

    /// Read values back without suspending.
    fn read_sync(&self, _data_id: DataId) -> Result<TensorValues> {
        Err(not_implemented(self.name(), "read_sync"))
    }

    /// Store values and return a fresh data id with reference count one.
    fn write(&mut self, _values: TensorValues, _shape: &Shape, _dtype: DType) -> Result<DataId> {
        Err(not_implemented(self.name(), "write"))
    }

    /// Release one reference to `data_id` (all of them when `force`).
    /// Returns true once the storage is actually freed.
    fn dispose_data(&mut self, _data_id: DataId, _force: bool) -> Result<bool> {
        Err(not_implemented(self.name(), "dispose_data"))
    }

    /// Adopt data that is moving in from another backend under its existing id.
    fn move_data(
        &mut self,
        _data_id: DataId,
        _values: TensorValues,
        _shape: &Shape,
        _dtype: DType,
        _ref_count: usize,
    ) -> Result<()> {
        Err(not_implemented(self.name(), "move_data"))
    }

    fn memory(&self) -> Result<BackendMemory> {
        Err(not_implemented(self.name(), "memory"))
    }

    /// Number of live data ids held by this backend.
    fn num_data_ids(&self) -> usize;

    /// Reference count of `data_id`, zero when the backend does not hold it.
    fn ref_count(&self, data_id: DataId) -> usize;

    fn inc_ref(&mut self, _data_id: DataId) -> Result<()> {
        Err(not_implemented(self.name(), "inc_ref"))
    }

    /// Time a unit of work that runs against this backend.
    fn time(&mut self, _f: &mut dyn FnMut(&mut dyn Backend)) -> Result<Duration> {
        Err(not_implemented(self.name(), "time"))
    }

    /// 16 or 32.
    fn float_precision(&self) -> u8 {
        32
    }

    fn epsilon(&self) -> f32 {
        if self.float_precision() == 32 {
            1e-7
        } else {
            1e-4
        }
    }

    /// Release every resource; called when the backend is removed or the engine resets.
    fn dispose(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Wall-clock timing for backends without a device timer.
pub fn wall_time(backend: &mut dyn Backend, f: &mut dyn FnMut(&mut dyn Backend)) -> Duration {
    let start = Instant::now();
    f(backend);
    start.elapsed()
}

/// What a backend factory produces: an instance now, or one later.
pub enum BackendInit {
    Ready(Box<dyn Backend>),
    Pending(LocalBoxFuture<'static, Result<Box<dyn Backend>>>),
}

impl BackendInit {
    pub fn ready(backend: impl Backend) -> Self {
        BackendInit::Ready(Box::new(backend))
    }
}

/// Creates backend instances on first use.
pub type BackendFactory = Rc<dyn Fn() -> Result<BackendInit>>;
