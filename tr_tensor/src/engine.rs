//! The engine facade.
//!
//! One `Engine` value owns every piece of process-wide state: the kernel and
//! backend registries, the data store, the live-tensor table, the scope stack,
//! the gradient tape and the variable table. Every tensor-producing call takes
//! `&mut Engine`, so scope tracking is threaded explicitly rather than ambient.
//!
//! Kernel execution lives in `execute.rs`, backend selection in `selector.rs`,
//! gradients in `autodiff.rs` and variables in `variables.rs`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

use futures::future::LocalBoxFuture;
use log::{debug, warn};

use crate::backend::{Backend, BackendMemory};
use crate::backend_registry::BackendRegistry;
use crate::config::EngineConfig;
use crate::data_store::{DataInfo, DataStore};
use crate::dtype::{DType, TensorValues};
use crate::error::{invalid, Error, Result};
use crate::kernel_names;
use crate::kernel_registry::{
    attrs, AttrValue, GradConfig, GradMap, GradProducer, KernelConfig, KernelRegistry,
};
use crate::profiler::{MemoryInfo, ProfileInfo, TimingInfo};
use crate::scope::{ScopeStack, TensorContainer};
use crate::shape::Shape;
use crate::tape::TapeState;
use crate::tensor::{named, DataId, Tensor, TensorId, TensorInfo, Variable};

/// Engine-side record of a live tensor handle.
#[derive(Debug, Clone)]
pub(crate) struct LiveTensor {
    /// Authoritative binding; differs from a stale `Variable` copy after `assign`.
    pub data_id: DataId,
    pub dtype: DType,
    pub kept: bool,
    pub scope_id: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub num_tensors: usize,
    pub num_bytes: usize,
    pub num_string_tensors: usize,
}

/// An asynchronous backend initialisation that has not resolved yet.
pub(crate) struct PendingInit {
    pub name: String,
    pub generation: u64,
    pub future: LocalBoxFuture<'static, Result<Box<dyn Backend>>>,
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) kernels: KernelRegistry,
    pub(crate) backends: BackendRegistry,
    pub(crate) active_backend: Option<String>,
    /// Bumped whenever an in-flight initialisation must be ignored.
    pub(crate) init_generation: u64,
    pub(crate) pending_inits: Vec<PendingInit>,
    pub(crate) data: DataStore,
    pub(crate) live: HashMap<TensorId, LiveTensor>,
    pub(crate) counters: Counters,
    pub(crate) scopes: ScopeStack,
    pub(crate) tape: TapeState,
    pub(crate) variables: BTreeMap<String, Variable>,
    pub(crate) next_variable_id: usize,
    pub(crate) active_profile: Option<ProfileInfo>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// `Identity` passes the gradient straight through, as float32.
fn identity_gradient() -> GradConfig {
    GradConfig::new(kernel_names::IDENTITY, |dys, _saved, _attrs| {
        let dy = dys
            .first()
            .cloned()
            .ok_or_else(|| invalid("Identity gradient expects one output gradient"))?;
        let producer: GradProducer = Box::new(move |engine: &mut Engine| {
            engine.run_kernel(
                kernel_names::CAST,
                &named([("x", &dy)]),
                &attrs([("dtype", AttrValue::DType(DType::Float32))]),
            )
        });
        let mut grads = GradMap::new();
        grads.insert("x".to_string(), producer);
        Ok(grads)
    })
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut engine = Engine {
            config,
            kernels: KernelRegistry::new(),
            backends: BackendRegistry::new(),
            active_backend: None,
            init_generation: 0,
            pending_inits: Vec::new(),
            data: DataStore::new(),
            live: HashMap::new(),
            counters: Counters::default(),
            scopes: ScopeStack::new(),
            tape: TapeState::default(),
            variables: BTreeMap::new(),
            next_variable_id: 0,
            active_profile: None,
        };
        engine.kernels.register_gradient(identity_gradient());
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    // ---- kernel registry ----

    pub fn register_kernel(&mut self, config: KernelConfig) {
        self.kernels.register_kernel(config);
    }

    pub fn register_gradient(&mut self, config: GradConfig) {
        self.kernels.register_gradient(config);
    }

    pub fn get_kernel(&self, kernel_name: &str, backend_name: &str) -> Option<&KernelConfig> {
        self.kernels.get_kernel(kernel_name, backend_name)
    }

    pub fn get_gradient(&self, kernel_name: &str) -> Option<Rc<GradConfig>> {
        self.kernels.get_gradient(kernel_name)
    }

    pub fn get_kernels_for_backend(&self, backend_name: &str) -> Vec<&KernelConfig> {
        self.kernels.get_kernels_for_backend(backend_name)
    }

    pub fn unregister_kernel(&mut self, kernel_name: &str, backend_name: &str) -> Result<()> {
        self.kernels.unregister_kernel(kernel_name, backend_name)
    }

    pub fn unregister_gradient(&mut self, kernel_name: &str) -> Result<()> {
        self.kernels.unregister_gradient(kernel_name)
    }

    // ---- tensor creation and tracking ----

    fn check_rank(&self, shape: &Shape) -> Result<()> {
        if shape.ndim() > self.config.max_rank {
            return Err(Error::RankTooLarge {
                rank: shape.ndim(),
                max: self.config.max_rank,
            });
        }
        Ok(())
    }

    /// Write `values` to the active backend and track the result in the current scope.
    pub fn make_tensor(
        &mut self,
        values: TensorValues,
        shape: impl Into<Shape>,
        dtype: DType,
    ) -> Result<Tensor> {
        let shape = shape.into();
        self.check_rank(&shape)?;
        if values.dtype() != dtype {
            return Err(invalid(format!(
                "values of dtype {} cannot back a {dtype} tensor",
                values.dtype()
            )));
        }
        if values.len() != shape.numel() {
            return Err(invalid(format!(
                "{} values do not match shape {shape} ({} elements)",
                values.len(),
                shape.numel()
            )));
        }
        let backend_name = self.ensure_backend()?;
        let bytes = values.byte_size();
        let data_id = self.backend_mut(&backend_name)?.write(values, &shape, dtype)?;
        Ok(self.track_tensor(
            TensorId::next(),
            TensorInfo::new(data_id, shape, dtype),
            &backend_name,
            bytes,
            true,
        ))
    }

    /// Wrap storage a kernel produced on `backend_name` (the active backend by default).
    pub fn make_tensor_from_tensor_info(
        &mut self,
        info: TensorInfo,
        backend_name: Option<&str>,
    ) -> Result<Tensor> {
        self.check_rank(&info.shape)?;
        let backend_name = match backend_name {
            Some(name) => name.to_string(),
            None => self.ensure_backend()?,
        };
        let bytes = match info.dtype.bytes_per_element() {
            Some(per_element) => info.shape.numel() * per_element,
            // Strings are sized by their encoded bytes, known only to the backend.
            None if !self.data.has(info.data_id) => self
                .backend_mut(&backend_name)?
                .read_sync(info.data_id)?
                .byte_size(),
            None => 0,
        };
        Ok(self.track_tensor(TensorId::next(), info, &backend_name, bytes, true))
    }

    /// Register a handle. `bytes` is only counted when the data id is new.
    pub(crate) fn track_tensor(
        &mut self,
        id: TensorId,
        info: TensorInfo,
        backend_name: &str,
        bytes: usize,
        scoped: bool,
    ) -> Tensor {
        self.counters.num_tensors += 1;
        if info.dtype == DType::String {
            self.counters.num_string_tensors += 1;
        }
        if !self.data.has(info.data_id) {
            self.counters.num_bytes += bytes;
            self.data.set(
                info.data_id,
                DataInfo {
                    backend: backend_name.to_string(),
                    dtype: info.dtype,
                    shape: info.shape.clone(),
                    bytes,
                },
            );
        }
        let scope_id = if scoped { self.scopes.track(id) } else { None };
        self.live.insert(
            id,
            LiveTensor {
                data_id: info.data_id,
                dtype: info.dtype,
                kept: false,
                scope_id,
            },
        );
        Tensor::new(id, info.data_id, info.shape, info.dtype)
    }

    /// A copy of `t` bound to its current storage.
    pub(crate) fn refresh(&self, t: &Tensor) -> Result<Tensor> {
        let record = self.live.get(&t.id()).ok_or(Error::TensorDisposed(t.id()))?;
        let mut current = t.clone();
        current.rebind(record.data_id);
        Ok(current)
    }

    pub fn is_disposed(&self, t: &Tensor) -> bool {
        !self.live.contains_key(&t.id())
    }

    /// True when `t` is tracked by the innermost scope and not kept.
    pub(crate) fn owned_by_active_scope(&self, t: &Tensor) -> bool {
        let Some(scope) = self.scopes.active() else {
            return false;
        };
        self.live
            .get(&t.id())
            .map_or(false, |r| !r.kept && r.scope_id == Some(scope.id))
    }

    /// Exempt `t` from scope-end disposal.
    pub fn keep(&mut self, t: &Tensor) -> Tensor {
        if let Some(record) = self.live.get_mut(&t.id()) {
            record.kept = true;
        }
        t.clone()
    }

    /// Release one alias. Disposing an already-disposed handle is a no-op.
    pub fn dispose_tensor(&mut self, t: &Tensor) -> Result<()> {
        self.dispose_by_id(t.id())
    }

    /// Dispose every tensor in `container`; variables are unregistered as well.
    pub fn dispose<C: TensorContainer + ?Sized>(&mut self, container: &C) -> Result<()> {
        for t in container.tensors() {
            let variable = self
                .variables
                .values()
                .find(|v| v.tensor().id() == t.id())
                .map(|v| v.name().to_string());
            match variable {
                Some(name) => self.dispose_variable(&name)?,
                None => self.dispose_by_id(t.id())?,
            }
        }
        Ok(())
    }

    pub(crate) fn dispose_by_id(&mut self, id: TensorId) -> Result<()> {
        let Some(record) = self.live.remove(&id) else {
            return Ok(());
        };
        self.counters.num_tensors -= 1;
        if record.dtype == DType::String {
            self.counters.num_string_tensors -= 1;
        }
        self.release_data(record.data_id)
    }

    /// Drop one reference to `data_id` on its owner, forgetting it once freed.
    fn release_data(&mut self, data_id: DataId) -> Result<()> {
        let Ok(info) = self.data.get(data_id) else {
            // Owner was removed and its entries purged.
            return Ok(());
        };
        let owner = info.backend.clone();
        let bytes = info.bytes;
        let freed = match self.backends.instance_mut(&owner) {
            Some(backend) => backend.dispose_data(data_id, false)?,
            None => true,
        };
        if freed {
            self.data.delete(data_id);
            self.counters.num_bytes = self.counters.num_bytes.saturating_sub(bytes);
        }
        Ok(())
    }

    // ---- scopes ----

    pub fn start_scope(&mut self, name: Option<&str>) {
        let id = self.scopes.start(name);
        debug!("start scope {id} '{}'", self.scopes.active_name());
    }

    /// Close the innermost scope. Tracked tensors that are neither kept nor
    /// part of `result` are disposed; result tensors owned by the closing
    /// scope move to the enclosing one.
    pub fn end_scope<C: TensorContainer + ?Sized>(&mut self, result: &C) -> Result<()> {
        let returned = result.tensors();
        let returned_ids: HashSet<TensorId> = returned.iter().map(Tensor::id).collect();
        let scope = self.scopes.end()?;

        let mut disposed = 0;
        for id in &scope.track {
            let Some(record) = self.live.get(id) else {
                continue;
            };
            if record.kept || returned_ids.contains(id) {
                continue;
            }
            self.dispose_by_id(*id)?;
            disposed += 1;
        }

        for t in &returned {
            let owned_by_scope = self
                .live
                .get(&t.id())
                .map_or(false, |r| !r.kept && r.scope_id == Some(scope.id));
            if owned_by_scope {
                let parent = self.scopes.track(t.id());
                if let Some(record) = self.live.get_mut(&t.id()) {
                    record.scope_id = parent;
                }
            }
        }
        debug!(
            "end scope {} '{}': disposed {disposed} of {} tracked tensors",
            scope.id,
            scope.name,
            scope.track.len()
        );
        Ok(())
    }

    /// Run `f` in a fresh scope; everything it creates except its result is
    /// disposed afterwards, also when `f` fails.
    pub fn tidy<T, F>(&mut self, f: F) -> Result<T>
    where
        T: TensorContainer,
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        self.run_scoped(None, f)
    }

    pub fn tidy_named<T, F>(&mut self, name: &str, f: F) -> Result<T>
    where
        T: TensorContainer,
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        self.run_scoped(Some(name), f)
    }

    fn run_scoped<T, F>(&mut self, name: Option<&str>, f: F) -> Result<T>
    where
        T: TensorContainer,
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        self.start_scope(name);
        match f(self) {
            Ok(value) => {
                self.end_scope(&value)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(cleanup) = self.end_scope(&()) {
                    warn!("failed to close scope after error: {cleanup}");
                }
                Err(err)
            }
        }
    }

    // ---- reads ----

    fn owner_of(&self, t: &Tensor) -> Result<(DataId, &dyn Backend)> {
        let data_id = self.refresh(t)?.data_id();
        let owner = &self.data.get(data_id)?.backend;
        let backend = self
            .backends
            .instance(owner)
            .ok_or_else(|| Error::BackendNotFound(owner.clone()))?;
        Ok((data_id, backend))
    }

    /// Read values from the backend owning the data.
    pub fn read_sync(&self, t: &Tensor) -> Result<TensorValues> {
        let (data_id, backend) = self.owner_of(t)?;
        backend.read_sync(data_id)
    }

    pub async fn read(&self, t: &Tensor) -> Result<TensorValues> {
        let (data_id, backend) = self.owner_of(t)?;
        backend.read(data_id).await
    }

    /// Numeric values widened to f32.
    pub fn read_f32(&self, t: &Tensor) -> Result<Vec<f32>> {
        self.read_sync(t)?.to_f32_vec()
    }

    // ---- counters and reports ----

    pub fn num_tensors(&self) -> usize {
        self.counters.num_tensors
    }

    pub fn num_data_buffers(&self) -> usize {
        self.data.num_data_buffers()
    }

    pub fn num_bytes(&self) -> usize {
        self.counters.num_bytes
    }

    /// Whether `data_id` still has an entry in the data store.
    pub fn has_data(&self, data_id: DataId) -> bool {
        self.data.has(data_id)
    }

    pub fn memory(&mut self) -> Result<MemoryInfo> {
        let name = self.ensure_backend()?;
        let backend_memory = match self.backend_mut(&name)?.memory() {
            Ok(memory) => memory,
            Err(Error::NotImplemented { .. }) => BackendMemory {
                unreliable: true,
                reasons: vec![format!("backend '{name}' does not report memory")],
                ..Default::default()
            },
            Err(err) => return Err(err),
        };
        let mut info = MemoryInfo {
            num_tensors: self.counters.num_tensors,
            num_data_buffers: self.data.num_data_buffers(),
            num_bytes: self.counters.num_bytes,
            num_string_tensors: self.counters.num_string_tensors,
            unreliable: backend_memory.unreliable,
            reasons: backend_memory.reasons.clone(),
            backend: backend_memory,
        };
        if info.num_string_tensors > 0 {
            info.unreliable = true;
            info.reasons
                .push("memory usage by string tensors is approximate".to_string());
        }
        Ok(info)
    }

    /// Run `f` while recording every kernel it executes.
    pub fn profile<T, F>(&mut self, f: F) -> Result<(T, ProfileInfo)>
    where
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        let outer = self.active_profile.replace(ProfileInfo::default());
        let start_bytes = self.counters.num_bytes;
        let start_tensors = self.counters.num_tensors;

        let result = f(self);

        let mut info = std::mem::replace(&mut self.active_profile, outer).unwrap_or_default();
        if let Some(outer) = self.active_profile.as_mut() {
            outer.kernels.extend(info.kernels.iter().cloned());
        }
        let value = result?;
        info.new_bytes = self.counters.num_bytes as i64 - start_bytes as i64;
        info.new_tensors = self.counters.num_tensors as i64 - start_tensors as i64;
        info.finish(start_bytes);
        Ok((value, info))
    }

    /// Wall time of `f`, plus the kernel time reported by the backend.
    pub fn time<T, F>(&mut self, f: F) -> Result<(T, TimingInfo)>
    where
        F: FnOnce(&mut Engine) -> Result<T>,
    {
        let start = Instant::now();
        let (value, info) = self.profile(f)?;
        let timing = TimingInfo {
            wall_time: start.elapsed(),
            kernel_time: info.kernel_time(),
        };
        Ok((value, timing))
    }

    /// Drop all engine state and backend instances. Registered factories and
    /// kernels survive; in-flight backend initialisations are invalidated.
    pub fn reset(&mut self) {
        self.init_generation += 1;
        if let Err(err) = self.dispose_variables() {
            warn!("failed to dispose variables during reset: {err}");
        }
        for name in self.backends.instance_names() {
            self.teardown_backend(&name);
        }
        self.active_backend = None;
        self.pending_inits.clear();
        self.data.clear();
        self.live.clear();
        self.counters = Counters::default();
        self.scopes.clear();
        self.tape = TapeState::default();
        self.variables.clear();
        self.next_variable_id = 0;
        self.active_profile = None;
        debug!("engine reset");
    }
}
