//! Reverse-mode gradients over the recorded tape.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use log::debug;

use crate::dtype::{DType, TensorValues};
use crate::engine::Engine;
use crate::error::{invalid, Error, Result};
use crate::kernel_names;
use crate::kernel_registry::Attrs;
use crate::scope::TensorContainer;
use crate::tape::{filter_nodes_x_to_y, Backward, CustomGradFunc, TapeNode};
use crate::tensor::{named, NamedTensorMap, Tensor, TensorId, Variable};

/// Value of `f` and its gradients with respect to each requested input.
#[derive(Debug, Clone)]
pub struct GradientsResult {
    pub value: Tensor,
    /// `None` where the input is not connected to the value.
    pub grads: Vec<Option<Tensor>>,
}

impl TensorContainer for GradientsResult {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(&self.value);
        self.grads.visit_tensors(f);
    }
}

/// Result of [`Engine::variable_grads`]: gradients keyed by variable name.
#[derive(Debug, Clone)]
pub struct VariableGrads {
    pub value: Tensor,
    pub grads: BTreeMap<String, Tensor>,
}

impl TensorContainer for VariableGrads {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(&self.value);
        self.grads.visit_tensors(f);
    }
}

/// What the forward function of [`Engine::custom_grad`] returns.
pub struct CustomGradOutput {
    pub value: Tensor,
    /// Tensors handed to the gradient function as `saved`.
    pub saved: Vec<Tensor>,
    pub grad_func: CustomGradFunc,
}

impl CustomGradOutput {
    pub fn new<G>(value: Tensor, grad_func: G) -> Self
    where
        G: Fn(&mut Engine, &[Tensor], &[Tensor]) -> Result<Vec<Tensor>> + 'static,
    {
        CustomGradOutput {
            value,
            saved: Vec::new(),
            grad_func: Rc::new(grad_func),
        }
    }

    pub fn save(mut self, tensors: &[Tensor]) -> Self {
        self.saved.extend(tensors.iter().cloned());
        self
    }
}

/// Only `value` leaves the forward scope; saved tensors are replaced by kept
/// clones before the scope closes.
impl TensorContainer for CustomGradOutput {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(&self.value);
    }
}

impl Engine {
    /// True while `gradients()` is recording and no kernel is mid-execution.
    pub fn is_tape_on(&self) -> bool {
        self.tape.is_on()
    }

    /// Number of nodes on the active tape.
    pub fn tape_len(&self) -> usize {
        self.tape.len()
    }

    pub(crate) fn start_tape(&mut self) {
        self.tape.start();
    }

    pub(crate) fn end_tape(&mut self) {
        self.tape.end();
    }

    /// Gradients of `y = f()` with respect to `xs`, seeded with `dy` (ones
    /// shaped like `y` when omitted).
    ///
    /// Fails with [`Error::NoGradientPath`] when no recorded kernel connects
    /// any of `xs` to `y`, unless `allow_no_gradients` is set; unconnected
    /// inputs then get `None`.
    pub fn gradients<F>(
        &mut self,
        f: F,
        xs: &[Tensor],
        dy: Option<&Tensor>,
        allow_no_gradients: bool,
    ) -> Result<GradientsResult>
    where
        F: FnOnce(&mut Engine) -> Result<Tensor>,
    {
        if xs.is_empty() {
            return Err(invalid("gradients() received an empty list of xs"));
        }
        if let Some(dy) = dy {
            if dy.dtype() != DType::Float32 {
                return Err(invalid(format!(
                    "dy must have float32 dtype, but has {}",
                    dy.dtype()
                )));
            }
        }

        self.start_tape();
        let forward = self.tidy_named("forward", |engine| {
            let y = f(engine)?;
            let created = engine.owned_by_active_scope(&y);
            Ok((y, created))
        });
        self.end_tape();
        let (y, y_created) = match forward {
            Ok(forward) => forward,
            Err(err) => {
                self.drain_tape_if_idle()?;
                return Err(err);
            }
        };

        let filtered = match &self.tape.active_tape {
            Some(tape) => filter_nodes_x_to_y(tape, xs, &y),
            None => Vec::new(),
        };
        if filtered.is_empty() && !allow_no_gradients {
            self.drain_tape_if_idle()?;
            self.discard_value(&y, y_created)?;
            return Err(Error::NoGradientPath);
        }

        let seed = dy.cloned();
        let backward = self.tidy_named("backward", |engine| {
            let mut accumulated: HashMap<TensorId, Tensor> = HashMap::new();
            let initial = match &seed {
                Some(dy) => engine.refresh(dy)?,
                None => engine.make_tensor(
                    TensorValues::F32(vec![1.0; y.numel()]),
                    y.shape().clone(),
                    DType::Float32,
                )?,
            };
            accumulated.insert(y.id(), initial);
            let protected = seed.as_ref().map(Tensor::id);
            engine.backpropagate(&filtered, &mut accumulated, protected)?;
            Ok(xs
                .iter()
                .map(|x| accumulated.get(&x.id()).cloned())
                .collect::<Vec<_>>())
        });
        let drained = self.drain_tape_if_idle();
        let grads = match backward {
            Ok(grads) => grads,
            Err(err) => {
                self.discard_value(&y, y_created)?;
                return Err(err);
            }
        };
        drained?;
        Ok(GradientsResult { value: y, grads })
    }

    /// Dispose a failed call's forward value unless it predates the call.
    fn discard_value(&mut self, y: &Tensor, created: bool) -> Result<()> {
        if created {
            self.dispose_tensor(y)?;
        }
        Ok(())
    }

    /// Dispose saved tensors and drop the tape once no `gradients()` is open.
    fn drain_tape_if_idle(&mut self) -> Result<()> {
        if self.tape.gradient_depth > 0 {
            return Ok(());
        }
        let Some(tape) = self.tape.active_tape.take() else {
            return Ok(());
        };
        for node in &tape {
            for t in &node.saved {
                self.dispose_tensor(t)?;
            }
        }
        Ok(())
    }

    /// Walk `tape` in reverse, accumulating gradients per tensor id.
    fn backpropagate(
        &mut self,
        tape: &[TapeNode],
        accumulated: &mut HashMap<TensorId, Tensor>,
        protected: Option<TensorId>,
    ) -> Result<()> {
        for node in tape.iter().rev() {
            let mut dys = Vec::with_capacity(node.outputs.len());
            for output in &node.outputs {
                let dy = match accumulated.get(&output.id()) {
                    Some(grad) => grad.clone(),
                    None => self.make_tensor(
                        TensorValues::zeros(output.dtype(), output.numel()),
                        output.shape().clone(),
                        output.dtype(),
                    )?,
                };
                dys.push(dy);
            }

            let backward = node
                .backward
                .clone()
                .ok_or_else(|| Error::GradientFunctionMissing {
                    kernel: node.kernel_name.clone(),
                })?;
            match backward {
                Backward::Registered(config) => {
                    let mut producers = (config.grad_func)(&dys, &node.saved, &node.attrs)?;
                    let available: Vec<String> = producers.keys().cloned().collect();
                    for (input_name, x) in &node.inputs {
                        let producer = producers.remove(input_name).ok_or_else(|| {
                            Error::MissingGradient {
                                kernel: node.kernel_name.clone(),
                                input: input_name.clone(),
                                available: available.clone(),
                            }
                        })?;
                        let dx = self.tidy(producer)?;
                        self.accumulate(node, input_name, x, dx, accumulated, protected)?;
                    }
                }
                Backward::Custom(grad_func) => {
                    let saved = &node.saved;
                    let grads = self.tidy(|engine| grad_func(engine, &dys, saved))?;
                    for (input_name, x) in &node.inputs {
                        let dx = input_name
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| grads.get(i))
                            .cloned()
                            .ok_or_else(|| Error::MissingGradient {
                                kernel: node.kernel_name.clone(),
                                input: input_name.clone(),
                                available: (0..grads.len()).map(|i| i.to_string()).collect(),
                            })?;
                        self.accumulate(node, input_name, x, dx, accumulated, protected)?;
                    }
                }
            }
        }
        debug!("backpropagated through {} nodes", tape.len());
        Ok(())
    }

    fn accumulate(
        &mut self,
        node: &TapeNode,
        input_name: &str,
        x: &Tensor,
        dx: Tensor,
        accumulated: &mut HashMap<TensorId, Tensor>,
        protected: Option<TensorId>,
    ) -> Result<()> {
        if dx.dtype() != DType::Float32 {
            return Err(Error::GradientDType {
                kernel: node.kernel_name.clone(),
                input: input_name.to_string(),
                dtype: dx.dtype(),
            });
        }
        if dx.shape() != x.shape() {
            return Err(Error::GradientShape {
                kernel: node.kernel_name.clone(),
                input: input_name.to_string(),
                grad: dx.shape().clone(),
                input_shape: x.shape().clone(),
            });
        }

        // Each accumulator entry must own its handle, since superseded
        // entries are disposed.
        let shared = Some(dx.id()) == protected
            || accumulated.values().any(|g| g.id() == dx.id())
            || self.live.get(&dx.id()).map_or(false, |r| r.kept);
        let dx = if shared { self.clone_tensor(&dx)? } else { dx };

        let sum = match accumulated.remove(&x.id()) {
            None => dx,
            Some(current) => {
                let sum = self.run_kernel(
                    kernel_names::ADD,
                    &named([("a", &current), ("b", &dx)]),
                    &Attrs::new(),
                )?;
                if Some(current.id()) != protected {
                    self.dispose_tensor(&current)?;
                }
                sum
            }
        };
        accumulated.insert(x.id(), sum);
        Ok(())
    }

    /// Record `f` as a single tape node whose backward step is the gradient
    /// function `f` returns. Kernels run inside `f` are not recorded.
    pub fn custom_grad<F>(&mut self, inputs: &[Tensor], f: F) -> Result<Tensor>
    where
        F: FnOnce(&mut Engine, &[Tensor]) -> Result<CustomGradOutput>,
    {
        let inputs = inputs
            .iter()
            .map(|t| self.refresh(t))
            .collect::<Result<Vec<_>>>()?;
        let is_tape_on = self.tape.is_on();

        self.tape.kernel_depth += 1;
        let forward = self.tidy_named("customGrad", |engine| {
            let mut output = f(engine, &inputs)?;
            output.saved = if is_tape_on {
                engine.keep_clones(&output.saved)?
            } else {
                Vec::new()
            };
            Ok(output)
        });
        self.tape.kernel_depth -= 1;
        let output = forward?;

        if is_tape_on {
            let inputs: NamedTensorMap = inputs
                .iter()
                .enumerate()
                .map(|(i, t)| (i.to_string(), t.clone()))
                .collect();
            self.tape.push(TapeNode {
                id: 0,
                kernel_name: "customGrad".to_string(),
                inputs,
                outputs: vec![output.value.clone()],
                saved: output.saved,
                attrs: Attrs::new(),
                backward: Some(Backward::Custom(output.grad_func.clone())),
            });
        }
        Ok(output.value)
    }

    /// Kept clones of `tensors`. On failure the clones made so far are released.
    pub(crate) fn keep_clones(&mut self, tensors: &[Tensor]) -> Result<Vec<Tensor>> {
        let mut kept = Vec::with_capacity(tensors.len());
        for t in tensors {
            match self.clone_tensor(t) {
                Ok(copy) => kept.push(self.keep(&copy)),
                Err(err) => {
                    for copy in &kept {
                        self.dispose_tensor(copy)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(kept)
    }

    /// Gradients of the scalar `f()` with respect to trainable variables:
    /// `var_list` when given, otherwise every registered trainable variable.
    pub fn variable_grads<F>(
        &mut self,
        f: F,
        var_list: Option<&[Variable]>,
    ) -> Result<VariableGrads>
    where
        F: FnOnce(&mut Engine) -> Result<Tensor>,
    {
        let candidates: Vec<Variable> = match var_list {
            Some(list) => list.to_vec(),
            None => self.variables.values().cloned().collect(),
        };
        let total = candidates.len();
        let trainable: Vec<Variable> = candidates.into_iter().filter(Variable::trainable).collect();
        if trainable.is_empty() {
            return Err(invalid(format!(
                "variable_grads() expects at least one trainable variable, but none of the {total} variables is trainable"
            )));
        }
        let xs = trainable
            .iter()
            .map(|v| self.refresh(v.tensor()))
            .collect::<Result<Vec<_>>>()?;

        let result = self.gradients(f, &xs, None, true)?;
        let failure = if result.grads.iter().all(Option::is_none) {
            Some(Error::NoGradientPath)
        } else if !result.value.is_scalar() {
            Some(invalid(format!(
                "the function passed to variable_grads() must return a scalar, but it returned a rank-{} tensor",
                result.value.ndim()
            )))
        } else {
            None
        };
        if let Some(err) = failure {
            self.dispose(&result.grads)?;
            if xs.iter().all(|x| x.id() != result.value.id()) {
                self.dispose_tensor(&result.value)?;
            }
            return Err(err);
        }
        let GradientsResult { value, grads } = result;
        let grads = trainable
            .iter()
            .zip(grads)
            .filter_map(|(v, g)| g.map(|g| (v.name().to_string(), g)))
            .collect();
        Ok(VariableGrads { value, grads })
    }
}
