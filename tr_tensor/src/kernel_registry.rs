//! Kernel and gradient tables.
//!
//! Kernels are keyed by (backend, kernel name); gradients are keyed by kernel
//! name alone since a gradient is expressed in terms of other kernels and works
//! on every backend.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use log::warn;

use crate::backend::Backend;
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{invalid, Result};
use crate::tensor::{NamedTensorMap, Tensor, TensorInfo};

/// A single kernel attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Shape(Vec<usize>),
    DType(DType),
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_shape(&self) -> Option<&[usize]> {
        match self {
            AttrValue::Shape(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dtype(&self) -> Option<DType> {
        match self {
            AttrValue::DType(d) => Some(*d),
            _ => None,
        }
    }
}

/// Kernel attributes keyed by attribute name.
pub type Attrs = BTreeMap<String, AttrValue>;

/// Build [`Attrs`] from `(name, value)` pairs.
pub fn attrs<'a, I>(pairs: I) -> Attrs
where
    I: IntoIterator<Item = (&'a str, AttrValue)>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Look up a required input by name.
pub fn input<'a>(inputs: &'a NamedTensorMap, name: &str) -> Result<&'a Tensor> {
    inputs
        .get(name)
        .ok_or_else(|| invalid(format!("missing kernel input '{name}'")))
}

/// Look up a required attribute by name.
pub fn attr<'a>(attrs: &'a Attrs, name: &str) -> Result<&'a AttrValue> {
    attrs
        .get(name)
        .ok_or_else(|| invalid(format!("missing kernel attribute '{name}'")))
}

/// Everything a kernel sees while it runs.
pub struct KernelArgs<'a> {
    pub inputs: &'a NamedTensorMap,
    pub attrs: &'a Attrs,
    pub backend: &'a mut dyn Backend,
}

/// Forward function: must create outputs through the backend's own `write`
/// and must not retain the inputs.
pub type KernelFunc = Rc<dyn Fn(KernelArgs<'_>) -> Result<Vec<TensorInfo>>>;

/// Per-backend hook run when a backend instance is set up or torn down.
pub type BackendHook = Rc<dyn Fn(&mut dyn Backend)>;

/// Deferred gradient for one input; only invoked if the gradient is needed.
pub type GradProducer = Box<dyn FnOnce(&mut Engine) -> Result<Tensor>>;

/// Input name -> gradient producer.
pub type GradMap = BTreeMap<String, GradProducer>;

/// `(dys, saved, attrs) -> input gradients`. `dys` holds one gradient per
/// kernel output, zero-filled where an output received none.
pub type GradFunc = Rc<dyn Fn(&[Tensor], &[Tensor], &Attrs) -> Result<GradMap>>;

#[derive(Clone)]
pub struct KernelConfig {
    pub kernel_name: String,
    pub backend_name: String,
    pub kernel_func: KernelFunc,
    pub setup_func: Option<BackendHook>,
    pub dispose_func: Option<BackendHook>,
}

impl KernelConfig {
    pub fn new<F>(kernel_name: &str, backend_name: &str, kernel_func: F) -> Self
    where
        F: Fn(KernelArgs<'_>) -> Result<Vec<TensorInfo>> + 'static,
    {
        KernelConfig {
            kernel_name: kernel_name.to_string(),
            backend_name: backend_name.to_string(),
            kernel_func: Rc::new(kernel_func),
            setup_func: None,
            dispose_func: None,
        }
    }

    pub fn with_setup(mut self, hook: impl Fn(&mut dyn Backend) + 'static) -> Self {
        self.setup_func = Some(Rc::new(hook));
        self
    }

    pub fn with_dispose(mut self, hook: impl Fn(&mut dyn Backend) + 'static) -> Self {
        self.dispose_func = Some(Rc::new(hook));
        self
    }
}

impl fmt::Debug for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelConfig")
            .field("kernel_name", &self.kernel_name)
            .field("backend_name", &self.backend_name)
            .field("setup_func", &self.setup_func.is_some())
            .field("dispose_func", &self.dispose_func.is_some())
            .finish()
    }
}

/// Gradient definition for a kernel name.
#[derive(Clone)]
pub struct GradConfig {
    pub kernel_name: String,
    /// Inputs saved (by name, in this order) for the backward step.
    pub inputs_to_save: Vec<String>,
    /// Per-output flags selecting outputs to save after the inputs.
    pub outputs_to_save: Vec<bool>,
    /// Save every input in name order instead of `inputs_to_save`.
    pub save_all_inputs: bool,
    pub grad_func: GradFunc,
}

impl GradConfig {
    pub fn new<F>(kernel_name: &str, grad_func: F) -> Self
    where
        F: Fn(&[Tensor], &[Tensor], &Attrs) -> Result<GradMap> + 'static,
    {
        GradConfig {
            kernel_name: kernel_name.to_string(),
            inputs_to_save: Vec::new(),
            outputs_to_save: Vec::new(),
            save_all_inputs: false,
            grad_func: Rc::new(grad_func),
        }
    }

    pub fn save_inputs(mut self, names: &[&str]) -> Self {
        self.inputs_to_save = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn save_outputs(mut self, flags: &[bool]) -> Self {
        self.outputs_to_save = flags.to_vec();
        self
    }

    pub fn save_all_inputs(mut self) -> Self {
        self.save_all_inputs = true;
        self
    }

    /// The tensors to keep for the backward step, inputs first.
    pub fn tensors_to_save(
        &self,
        inputs: &NamedTensorMap,
        outputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let mut saved = Vec::new();
        if self.save_all_inputs {
            saved.extend(inputs.values().cloned());
        } else {
            for name in &self.inputs_to_save {
                saved.push(input(inputs, name)?.clone());
            }
        }
        saved.extend(
            outputs
                .iter()
                .zip(self.outputs_to_save.iter())
                .filter(|(_, keep)| **keep)
                .map(|(t, _)| t.clone()),
        );
        Ok(saved)
    }
}

impl fmt::Debug for GradConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradConfig")
            .field("kernel_name", &self.kernel_name)
            .field("inputs_to_save", &self.inputs_to_save)
            .field("outputs_to_save", &self.outputs_to_save)
            .field("save_all_inputs", &self.save_all_inputs)
            .finish()
    }
}

/// Kernel table key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub backend: String,
    pub kernel: String,
}

impl KernelKey {
    pub fn new(backend: &str, kernel: &str) -> Self {
        KernelKey {
            backend: backend.to_string(),
            kernel: kernel.to_string(),
        }
    }
}

#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<KernelKey, KernelConfig>,
    gradients: HashMap<String, Rc<GradConfig>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel. Re-registering the same (backend, kernel) pair
    /// overwrites the previous entry.
    pub fn register_kernel(&mut self, config: KernelConfig) {
        let key = KernelKey::new(&config.backend_name, &config.kernel_name);
        if self.kernels.contains_key(&key) {
            warn!(
                "the kernel '{}' for backend '{}' is already registered",
                key.kernel, key.backend
            );
        }
        self.kernels.insert(key, config);
    }

    /// Register a gradient. A later registration for the same kernel wins.
    pub fn register_gradient(&mut self, config: GradConfig) {
        if self.gradients.contains_key(&config.kernel_name) {
            warn!("overriding the gradient for '{}'", config.kernel_name);
        }
        self.gradients.insert(config.kernel_name.clone(), Rc::new(config));
    }

    pub fn get_kernel(&self, kernel_name: &str, backend_name: &str) -> Option<&KernelConfig> {
        self.kernels.get(&KernelKey::new(backend_name, kernel_name))
    }

    pub fn get_gradient(&self, kernel_name: &str) -> Option<Rc<GradConfig>> {
        self.gradients.get(kernel_name).cloned()
    }

    /// All kernels registered for `backend_name`, sorted by kernel name.
    pub fn get_kernels_for_backend(&self, backend_name: &str) -> Vec<&KernelConfig> {
        let mut kernels: Vec<&KernelConfig> = self
            .kernels
            .iter()
            .filter(|(key, _)| key.backend == backend_name)
            .map(|(_, config)| config)
            .collect();
        kernels.sort_by(|a, b| a.kernel_name.cmp(&b.kernel_name));
        kernels
    }

    pub fn unregister_kernel(&mut self, kernel_name: &str, backend_name: &str) -> Result<()> {
        self.kernels
            .remove(&KernelKey::new(backend_name, kernel_name))
            .map(|_| ())
            .ok_or_else(|| {
                invalid(format!(
                    "the kernel '{kernel_name}' for backend '{backend_name}' is not registered"
                ))
            })
    }

    pub fn unregister_gradient(&mut self, kernel_name: &str) -> Result<()> {
        self.gradients
            .remove(kernel_name)
            .map(|_| ())
            .ok_or_else(|| invalid(format!("the gradient '{kernel_name}' is not registered")))
    }
}
