//! Backend registration and selection.
//!
//! Backends are tried in descending priority. A factory that fails is logged
//! and skipped; a factory returning [`BackendInit::Pending`] parks selection
//! until `ready()` or `set_backend()` awaits it. Each pending initialisation
//! carries the generation current when it started, and a result arriving
//! after the generation moved on is discarded.

use log::{debug, warn};

use crate::backend::{Backend, BackendFactory, BackendInit};
use crate::backend_registry::BackendState;
use crate::engine::{Engine, PendingInit};
use crate::error::{Error, Result};
use crate::kernel_registry::{BackendHook, KernelConfig};

enum InitOutcome {
    Ready,
    Pending,
    Failed,
}

impl Engine {
    /// Register a backend factory under `name`. Returns false, keeping the
    /// existing factory, if the name is taken.
    pub fn register_backend<F>(&mut self, name: &str, factory: F, priority: i32) -> bool
    where
        F: Fn() -> Result<BackendInit> + 'static,
    {
        self.backends.register(name, std::rc::Rc::new(factory), priority)
    }

    /// Registered names, highest priority first.
    pub fn registry_backend_names(&self) -> Vec<String> {
        self.backends.sorted_names()
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.active_backend.as_deref()
    }

    pub fn backend_state(&self, name: &str) -> Option<BackendState> {
        self.backends.state(name)
    }

    /// The initialised instance registered under `name`, if any.
    pub fn find_backend(&self, name: &str) -> Option<&dyn Backend> {
        self.backends.instance(name)
    }

    pub fn find_backend_mut(&mut self, name: &str) -> Option<&mut dyn Backend> {
        self.backends.instance_mut(name)
    }

    pub fn find_backend_factory(&self, name: &str) -> Option<BackendFactory> {
        self.backends.factory(name)
    }

    /// The active backend, selecting the best available one on first use.
    pub fn backend(&mut self) -> Result<&mut dyn Backend> {
        let name = self.ensure_backend()?;
        self.backend_mut(&name)
    }

    pub(crate) fn backend_mut(&mut self, name: &str) -> Result<&mut dyn Backend> {
        self.backends
            .instance_mut(name)
            .ok_or_else(|| Error::BackendNotFound(name.to_string()))
    }

    fn current_pending(&self) -> Option<&PendingInit> {
        self.pending_inits
            .iter()
            .rev()
            .find(|p| p.generation == self.init_generation)
    }

    /// Name of the active backend, synchronously selecting one if needed.
    pub(crate) fn ensure_backend(&mut self) -> Result<String> {
        if let Some(pending) = self.current_pending() {
            return Err(Error::BackendNotReady(pending.name.clone()));
        }
        if let Some(name) = &self.active_backend {
            return Ok(name.clone());
        }
        for name in self.backends.sorted_names() {
            if self.backends.state(&name) == Some(BackendState::Failed) {
                continue;
            }
            match self.initialize_backend(&name) {
                InitOutcome::Ready => {
                    self.select_backend(&name);
                    return Ok(name);
                }
                InitOutcome::Pending => return Err(Error::BackendNotReady(name)),
                InitOutcome::Failed => continue,
            }
        }
        Err(Error::NoBackendAvailable)
    }

    fn initialize_backend(&mut self, name: &str) -> InitOutcome {
        if self.backends.has_instance(name) {
            return InitOutcome::Ready;
        }
        let Some(factory) = self.backends.factory(name) else {
            return InitOutcome::Failed;
        };
        match factory() {
            Ok(BackendInit::Ready(backend)) => {
                self.install_backend(name, backend);
                InitOutcome::Ready
            }
            Ok(BackendInit::Pending(future)) => {
                self.init_generation += 1;
                self.backends.set_state(name, BackendState::Initializing);
                self.pending_inits.push(PendingInit {
                    name: name.to_string(),
                    generation: self.init_generation,
                    future,
                });
                debug!("backend '{name}' is initializing asynchronously");
                InitOutcome::Pending
            }
            Err(err) => {
                warn!("initialization of backend '{name}' failed: {err}");
                self.backends.set_state(name, BackendState::Failed);
                InitOutcome::Failed
            }
        }
    }

    fn kernel_hooks(
        &self,
        name: &str,
        pick: impl Fn(&KernelConfig) -> Option<BackendHook>,
    ) -> Vec<BackendHook> {
        self.kernels
            .get_kernels_for_backend(name)
            .into_iter()
            .filter_map(pick)
            .collect()
    }

    fn install_backend(&mut self, name: &str, mut backend: Box<dyn Backend>) {
        for hook in self.kernel_hooks(name, |k| k.setup_func.clone()) {
            hook(backend.as_mut());
        }
        if let Some(mut previous) = self.backends.install(name, backend) {
            previous.dispose();
        }
    }

    /// Run kernel dispose hooks and release the instance registered as `name`.
    pub(crate) fn teardown_backend(&mut self, name: &str) {
        let hooks = self.kernel_hooks(name, |k| k.dispose_func.clone());
        if let Some(mut instance) = self.backends.take_instance(name) {
            for hook in hooks {
                hook(instance.as_mut());
            }
            instance.dispose();
        }
    }

    fn select_backend(&mut self, name: &str) {
        if self.active_backend.as_deref() != Some(name) {
            debug!("selected backend '{name}'");
        }
        self.active_backend = Some(name.to_string());
    }

    /// Await every parked initialisation. Current ones install their backend;
    /// stale ones are disposed without touching the selection.
    async fn resolve_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending_inits);
        for init in pending {
            let result = init.future.await;
            if init.generation < self.init_generation {
                debug!("ignoring stale initialization of backend '{}'", init.name);
                if let Ok(mut backend) = result {
                    backend.dispose();
                }
                if !self.backends.has_instance(&init.name) {
                    self.backends.set_state(&init.name, BackendState::Registered);
                }
                continue;
            }
            match result {
                Ok(backend) => self.install_backend(&init.name, backend),
                Err(err) => {
                    warn!("initialization of backend '{}' failed: {err}", init.name);
                    self.backends.set_state(&init.name, BackendState::Failed);
                }
            }
        }
    }

    /// Resolve pending initialisation and make sure some backend is active.
    pub async fn ready(&mut self) -> Result<()> {
        self.resolve_pending().await;
        if self.active_backend.is_some() {
            return Ok(());
        }
        for name in self.backends.sorted_names() {
            if self.backends.state(&name) == Some(BackendState::Failed) {
                continue;
            }
            match self.initialize_backend(&name) {
                InitOutcome::Ready => {
                    self.select_backend(&name);
                    return Ok(());
                }
                InitOutcome::Pending => {
                    self.resolve_pending().await;
                    if self.backends.has_instance(&name) {
                        self.select_backend(&name);
                        return Ok(());
                    }
                }
                InitOutcome::Failed => continue,
            }
        }
        Err(Error::NoBackendAvailable)
    }

    /// Make `name` the active backend, initialising it if needed. Any other
    /// initialisation still in flight is invalidated. Returns false if the
    /// backend failed to initialise.
    pub async fn set_backend(&mut self, name: &str) -> Result<bool> {
        if !self.backends.is_registered(name) {
            return Err(Error::BackendNotFound(name.to_string()));
        }
        self.init_generation += 1;
        if !self.backends.has_instance(name) {
            self.backends.set_state(name, BackendState::Registered);
            match self.initialize_backend(name) {
                InitOutcome::Ready => {}
                InitOutcome::Pending => {
                    self.resolve_pending().await;
                    if !self.backends.has_instance(name) {
                        return Ok(false);
                    }
                }
                InitOutcome::Failed => return Ok(false),
            }
        }
        self.select_backend(name);
        Ok(true)
    }

    /// Tear down and unregister `name`. Data it owned is forgotten; removing
    /// the active backend clears the selection.
    pub fn remove_backend(&mut self, name: &str) {
        self.teardown_backend(name);
        if self.pending_inits.iter().any(|p| p.name == name) {
            self.init_generation += 1;
            self.pending_inits.retain(|p| p.name != name);
        }
        self.backends.unregister(name);
        let (purged, bytes) = self.data.purge_backend(name);
        self.counters.num_bytes = self.counters.num_bytes.saturating_sub(bytes);
        if purged > 0 {
            debug!("forgot {purged} data ids ({bytes} bytes) owned by removed backend '{name}'");
        }
        if self.active_backend.as_deref() == Some(name) {
            self.active_backend = None;
        }
    }
}
