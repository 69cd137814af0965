//! Plain-array CPU backend for tr_tensor.
//!
//! Buffers live in a `HashMap` keyed by data id, each with its own reference
//! count. Aliasing kernels (`Identity`, `Reshape`, same-dtype `Cast`) bump the
//! count instead of copying.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use log::debug;
use tr_tensor::prelude::*;
use tr_tensor::{wall_time, BackendMemory, DataId, TensorInfo};

mod kernels;
mod ops;

pub use kernels::register_cpu_kernels;

/// Registry name used by [`register_cpu_backend`].
pub const CPU_BACKEND_NAME: &str = "cpu";

/// One stored buffer.
#[derive(Clone, Debug)]
struct CpuBuffer {
    values: TensorValues,
    ref_count: usize,
}

/// CPU backend instance.
#[derive(Debug)]
pub struct CpuBackend {
    name: String,
    buffers: HashMap<DataId, CpuBuffer>,
}

impl CpuBackend {
    pub fn new(name: &str) -> Self {
        CpuBackend {
            name: name.to_string(),
            buffers: HashMap::new(),
        }
    }

    fn buffer(&self, data_id: DataId) -> Result<&CpuBuffer> {
        self.buffers.get(&data_id).ok_or(Error::DataNotFound(data_id))
    }

    /// Stored values of `t`.
    pub fn values(&self, t: &Tensor) -> Result<&TensorValues> {
        Ok(&self.buffer(t.data_id())?.values)
    }

    /// Stored values of `t` widened to f32.
    pub fn f32_values(&self, t: &Tensor) -> Result<Vec<f32>> {
        self.values(t)?.to_f32_vec()
    }

    /// Write a fresh buffer and describe it as a kernel output.
    pub fn write_values(&mut self, values: TensorValues, shape: Shape) -> Result<TensorInfo> {
        let dtype = values.dtype();
        let data_id = self.write(values, &shape, dtype)?;
        Ok(TensorInfo::new(data_id, shape, dtype))
    }

    /// Another reference to `t`'s buffer, viewed with `shape`.
    pub fn alias(&mut self, t: &Tensor, shape: Shape) -> Result<TensorInfo> {
        self.inc_ref(t.data_id())?;
        Ok(TensorInfo::new(t.data_id(), shape, t.dtype()))
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_sync(&self, data_id: DataId) -> Result<TensorValues> {
        Ok(self.buffer(data_id)?.values.clone())
    }

    fn write(&mut self, values: TensorValues, shape: &Shape, dtype: DType) -> Result<DataId> {
        if values.dtype() != dtype {
            return Err(Error::Backend(format!(
                "cannot store {} values as {dtype}",
                values.dtype()
            )));
        }
        if values.len() != shape.numel() {
            return Err(Error::Backend(format!(
                "{} values do not fill shape {shape}",
                values.len()
            )));
        }
        let data_id = DataId::next();
        self.buffers.insert(
            data_id,
            CpuBuffer {
                values,
                ref_count: 1,
            },
        );
        Ok(data_id)
    }

    fn dispose_data(&mut self, data_id: DataId, force: bool) -> Result<bool> {
        let Some(buffer) = self.buffers.get_mut(&data_id) else {
            return Ok(true);
        };
        buffer.ref_count = buffer.ref_count.saturating_sub(1);
        if !force && buffer.ref_count > 0 {
            return Ok(false);
        }
        self.buffers.remove(&data_id);
        Ok(true)
    }

    fn move_data(
        &mut self,
        data_id: DataId,
        values: TensorValues,
        shape: &Shape,
        dtype: DType,
        ref_count: usize,
    ) -> Result<()> {
        if values.dtype() != dtype || values.len() != shape.numel() {
            return Err(Error::Backend(format!(
                "moved data {} does not match {dtype} {shape}",
                data_id.raw()
            )));
        }
        self.buffers.insert(data_id, CpuBuffer { values, ref_count });
        Ok(())
    }

    fn memory(&self) -> Result<BackendMemory> {
        Ok(BackendMemory {
            num_bytes: self.buffers.values().map(|b| b.values.byte_size()).sum(),
            num_data_buffers: self.buffers.len(),
            unreliable: false,
            reasons: Vec::new(),
        })
    }

    fn num_data_ids(&self) -> usize {
        self.buffers.len()
    }

    fn ref_count(&self, data_id: DataId) -> usize {
        self.buffers.get(&data_id).map_or(0, |b| b.ref_count)
    }

    fn inc_ref(&mut self, data_id: DataId) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(&data_id)
            .ok_or(Error::DataNotFound(data_id))?;
        buffer.ref_count += 1;
        Ok(())
    }

    fn time(&mut self, f: &mut dyn FnMut(&mut dyn Backend)) -> Result<Duration> {
        Ok(wall_time(self, f))
    }

    fn dispose(&mut self) {
        debug!("disposing {} buffers on '{}'", self.buffers.len(), self.name);
        self.buffers.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Register a CPU backend and its kernels under `name`.
pub fn register_cpu_backend_named(engine: &mut Engine, name: &str, priority: i32) -> bool {
    let backend_name: Rc<str> = Rc::from(name);
    let registered = engine.register_backend(
        name,
        move || Ok(BackendInit::ready(CpuBackend::new(&backend_name))),
        priority,
    );
    register_cpu_kernels(engine, name);
    registered
}

/// Register the CPU backend as `"cpu"`.
pub fn register_cpu_backend(engine: &mut Engine, priority: i32) -> bool {
    register_cpu_backend_named(engine, CPU_BACKEND_NAME, priority)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_counting() {
        let mut cpu = CpuBackend::new("cpu");
        let id = cpu
            .write(TensorValues::F32(vec![1.0, 2.0]), &Shape::from([2]), DType::Float32)
            .unwrap();
        cpu.inc_ref(id).unwrap();
        assert_eq!(cpu.ref_count(id), 2);

        assert!(!cpu.dispose_data(id, false).unwrap());
        assert_eq!(cpu.num_data_ids(), 1);
        assert!(cpu.dispose_data(id, false).unwrap());
        assert_eq!(cpu.num_data_ids(), 0);
        assert_eq!(cpu.ref_count(id), 0);
    }

    #[test]
    fn test_forced_dispose_and_move() {
        let mut cpu = CpuBackend::new("cpu");
        let id = cpu
            .write(TensorValues::I32(vec![7]), &Shape::scalar(), DType::Int32)
            .unwrap();
        cpu.inc_ref(id).unwrap();
        assert!(cpu.dispose_data(id, true).unwrap());

        cpu.move_data(id, TensorValues::I32(vec![7]), &Shape::scalar(), DType::Int32, 3)
            .unwrap();
        assert_eq!(cpu.ref_count(id), 3);
        assert_eq!(cpu.read_sync(id).unwrap(), TensorValues::I32(vec![7]));
    }

    #[test]
    fn test_write_rejects_bad_length() {
        let mut cpu = CpuBackend::new("cpu");
        let err = cpu
            .write(TensorValues::F32(vec![1.0]), &Shape::from([2]), DType::Float32)
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_memory_report() {
        let mut cpu = CpuBackend::new("cpu");
        cpu.write(TensorValues::F32(vec![0.0; 4]), &Shape::from([4]), DType::Float32)
            .unwrap();
        cpu.write(TensorValues::from_strings(&["abc"]), &Shape::from([1]), DType::String)
            .unwrap();
        let memory = cpu.memory().unwrap();
        assert_eq!(memory.num_bytes, 19);
        assert_eq!(memory.num_data_buffers, 2);
        assert!((cpu.epsilon() - 1e-7).abs() < f32::EPSILON);
    }
}
