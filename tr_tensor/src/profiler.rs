//! Memory and kernel profiling reports.

use std::time::Duration;

use crate::backend::BackendMemory;
use crate::shape::Shape;

/// Engine-wide memory counters combined with the active backend's report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryInfo {
    pub num_tensors: usize,
    pub num_data_buffers: usize,
    pub num_bytes: usize,
    pub num_string_tensors: usize,
    /// True when any byte count is an estimate.
    pub unreliable: bool,
    pub reasons: Vec<String>,
    pub backend: BackendMemory,
}

/// One kernel invocation observed while profiling.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelProfile {
    pub name: String,
    pub bytes_added: i64,
    pub total_bytes_snapshot: usize,
    pub tensors_added: i64,
    pub total_tensors_snapshot: usize,
    pub input_shapes: Vec<Shape>,
    pub output_shapes: Vec<Shape>,
    /// `None` when the backend cannot time kernels.
    pub kernel_time: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileInfo {
    pub new_bytes: i64,
    pub new_tensors: i64,
    pub peak_bytes: usize,
    pub kernels: Vec<KernelProfile>,
    /// Distinct kernel names in first-seen order.
    pub kernel_names: Vec<String>,
}

impl ProfileInfo {
    pub(crate) fn finish(&mut self, start_bytes: usize) {
        self.peak_bytes = self
            .kernels
            .iter()
            .map(|k| k.total_bytes_snapshot)
            .fold(start_bytes, usize::max);
        self.kernel_names.clear();
        for kernel in &self.kernels {
            if !self.kernel_names.contains(&kernel.name) {
                self.kernel_names.push(kernel.name.clone());
            }
        }
    }

    /// Sum of the measured kernel times.
    pub fn kernel_time(&self) -> Duration {
        self.kernels.iter().filter_map(|k| k.kernel_time).sum()
    }
}

/// Result of `Engine::time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingInfo {
    pub wall_time: Duration,
    pub kernel_time: Duration,
}
