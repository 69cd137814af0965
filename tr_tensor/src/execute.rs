//! Kernel execution: dispatch, data migration, leak checks, profiling and
//! tape recording.

use std::time::Duration;

use log::{debug, trace};

use crate::backend::{wall_time, Backend};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::kernel_names;
use crate::kernel_registry::{Attrs, KernelArgs, KernelFunc};
use crate::profiler::KernelProfile;
use crate::tape::{Backward, TapeNode};
use crate::tensor::{named, DataId, NamedTensorMap, Tensor, TensorInfo};

impl Engine {
    /// Run a single-output kernel on the active backend.
    pub fn run_kernel(
        &mut self,
        kernel_name: &str,
        inputs: &NamedTensorMap,
        attrs: &Attrs,
    ) -> Result<Tensor> {
        self.run_kernel_multi(kernel_name, inputs, attrs)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Backend(format!("kernel '{kernel_name}' returned no outputs")))
    }

    /// Run a kernel on the active backend and track its outputs in the current scope.
    pub fn run_kernel_multi(
        &mut self,
        kernel_name: &str,
        inputs: &NamedTensorMap,
        attrs: &Attrs,
    ) -> Result<Vec<Tensor>> {
        let backend_name = self.ensure_backend()?;
        let kernel = self
            .kernels
            .get_kernel(kernel_name, &backend_name)
            .map(|config| config.kernel_func.clone())
            .ok_or_else(|| Error::KernelNotFound {
                kernel: kernel_name.to_string(),
                backend: backend_name.clone(),
            })?;
        let inputs: NamedTensorMap = inputs
            .iter()
            .map(|(name, t)| -> Result<(String, Tensor)> { Ok((name.clone(), self.refresh(t)?)) })
            .collect::<Result<_>>()?;
        let is_tape_on = self.tape.is_on();
        let timed = self.active_profile.is_some() || self.config.debug;
        let start_bytes = self.counters.num_bytes;
        let start_tensors = self.counters.num_tensors;

        let num_before = self.backend_mut(&backend_name)?.num_data_ids();
        let mut num_moves = 0;
        for t in inputs.values() {
            if self.move_data(&backend_name, t.data_id())? {
                num_moves += 1;
            }
        }

        trace!("run kernel '{kernel_name}' on '{backend_name}'");
        self.tape.kernel_depth += 1;
        let executed = self.execute(&kernel, &backend_name, &inputs, attrs, timed);
        self.tape.kernel_depth -= 1;
        let (infos, kernel_time) = executed?;

        if self.config.check_leaks {
            let num_after = self.backend_mut(&backend_name)?.num_data_ids();
            let leaked =
                num_after as i64 - num_before as i64 - infos.len() as i64 - num_moves as i64;
            if leaked > 0 {
                return Err(Error::MemoryLeak {
                    backend: backend_name,
                    kernel: kernel_name.to_string(),
                    leaked: leaked as usize,
                });
            }
        }

        let outputs = infos
            .into_iter()
            .map(|info| self.make_tensor_from_tensor_info(info, Some(&backend_name)))
            .collect::<Result<Vec<_>>>()?;

        if timed {
            let profile = KernelProfile {
                name: kernel_name.to_string(),
                bytes_added: self.counters.num_bytes as i64 - start_bytes as i64,
                total_bytes_snapshot: self.counters.num_bytes,
                tensors_added: self.counters.num_tensors as i64 - start_tensors as i64,
                total_tensors_snapshot: self.counters.num_tensors,
                input_shapes: inputs.values().map(|t| t.shape().clone()).collect(),
                output_shapes: outputs.iter().map(|t| t.shape().clone()).collect(),
                kernel_time,
            };
            if self.config.debug {
                debug!(
                    "{:<16} {:>12?} in {:?} out {:?}",
                    profile.name, profile.kernel_time, profile.input_shapes, profile.output_shapes
                );
            }
            if let Some(active) = self.active_profile.as_mut() {
                active.kernels.push(profile);
            }
        }

        if is_tape_on {
            self.record_kernel(kernel_name, &inputs, &outputs, attrs)?;
        }
        Ok(outputs)
    }

    fn execute(
        &mut self,
        kernel: &KernelFunc,
        backend_name: &str,
        inputs: &NamedTensorMap,
        attrs: &Attrs,
        timed: bool,
    ) -> Result<(Vec<TensorInfo>, Option<Duration>)> {
        let backend = self.backend_mut(backend_name)?;
        if !timed {
            let infos = kernel(KernelArgs {
                inputs,
                attrs,
                backend,
            })?;
            return Ok((infos, None));
        }

        let mut outcome = None;
        let mut run = |b: &mut dyn Backend| {
            outcome = Some(kernel(KernelArgs {
                inputs,
                attrs,
                backend: b,
            }));
        };
        let elapsed = match backend.time(&mut run) {
            Ok(elapsed) => elapsed,
            Err(Error::NotImplemented { .. }) => wall_time(backend, &mut run),
            Err(err) => return Err(err),
        };
        let infos = outcome.ok_or_else(|| {
            Error::Backend(format!("backend '{backend_name}' did not run the timed kernel"))
        })??;
        Ok((infos, Some(elapsed)))
    }

    /// Append a node for a kernel that just ran, saving kept clones of the
    /// tensors its registered gradient asks for.
    fn record_kernel(
        &mut self,
        kernel_name: &str,
        inputs: &NamedTensorMap,
        outputs: &[Tensor],
        attrs: &Attrs,
    ) -> Result<()> {
        let gradient = self.kernels.get_gradient(kernel_name);
        // Saved copies are recorded too, which keeps higher-order gradients
        // connected to the original inputs.
        let saved = match &gradient {
            Some(config) => {
                let to_save = config.tensors_to_save(inputs, outputs)?;
                self.keep_clones(&to_save)?
            }
            None => Vec::new(),
        };
        self.tape.push(TapeNode {
            id: 0,
            kernel_name: kernel_name.to_string(),
            inputs: inputs.clone(),
            outputs: outputs.to_vec(),
            saved,
            attrs: attrs.clone(),
            backward: gradient.map(Backward::Registered),
        });
        Ok(())
    }

    /// A new handle aliasing `t`'s data, produced by the `Identity` kernel.
    pub fn clone_tensor(&mut self, t: &Tensor) -> Result<Tensor> {
        self.run_kernel(kernel_names::IDENTITY, &named([("x", t)]), &Attrs::new())
    }

    /// Move `data_id` to `destination` if another backend owns it. Returns
    /// true when bytes actually moved.
    pub fn move_data(&mut self, destination: &str, data_id: DataId) -> Result<bool> {
        let info = self.data.get(data_id)?.clone();
        if info.backend == destination {
            return Ok(false);
        }
        let source = self
            .backends
            .instance(&info.backend)
            .ok_or_else(|| Error::BackendNotFound(info.backend.clone()))?;
        let values = source.read_sync(data_id)?;
        let ref_count = source.ref_count(data_id);

        self.backend_mut(destination)?
            .move_data(data_id, values, &info.shape, info.dtype, ref_count)?;
        if let Some(source) = self.backends.instance_mut(&info.backend) {
            source.dispose_data(data_id, true)?;
        }
        self.data.set_owner(data_id, destination)?;
        debug!(
            "moved data {} ({} bytes) from '{}' to '{destination}'",
            data_id.raw(),
            info.bytes,
            info.backend
        );
        Ok(true)
    }
}
