//! Gradient tape: recorded kernel invocations and graph pruning.
//!
//! Nodes are appended in execution order and never mutated. Before the
//! backward walk the tape is reduced to the nodes lying on some path from the
//! requested inputs to the output.

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::engine::Engine;
use crate::error::Result;
use crate::kernel_registry::{Attrs, GradConfig};
use crate::tensor::{NamedTensorMap, Tensor, TensorId};

/// `(engine, dys, saved) -> one gradient per input`, for `Engine::custom_grad`.
pub type CustomGradFunc = Rc<dyn Fn(&mut Engine, &[Tensor], &[Tensor]) -> Result<Vec<Tensor>>>;

/// How a node turns output gradients into input gradients.
#[derive(Clone)]
pub enum Backward {
    /// The gradient registered for the node's kernel name.
    Registered(Rc<GradConfig>),
    /// A caller-supplied gradient; inputs are keyed `"0"`, `"1"`, ...
    Custom(CustomGradFunc),
}

impl fmt::Debug for Backward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backward::Registered(config) => write!(f, "Registered({})", config.kernel_name),
            Backward::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TapeNode {
    pub id: usize,
    pub kernel_name: String,
    pub inputs: NamedTensorMap,
    pub outputs: Vec<Tensor>,
    /// Kept clones handed to the gradient function.
    pub saved: Vec<Tensor>,
    pub attrs: Attrs,
    pub backward: Option<Backward>,
}

/// Nesting state of gradient recording.
#[derive(Debug, Default)]
pub struct TapeState {
    /// Number of open `gradients()` calls.
    pub gradient_depth: usize,
    /// Number of kernels currently executing.
    pub kernel_depth: usize,
    pub active_tape: Option<Vec<TapeNode>>,
    pub next_node_id: usize,
}

impl TapeState {
    /// Recording happens only inside `gradients()` and never from within a kernel.
    pub fn is_on(&self) -> bool {
        self.gradient_depth > 0 && self.kernel_depth == 0
    }

    pub fn start(&mut self) {
        self.gradient_depth += 1;
        if self.gradient_depth == 1 {
            self.active_tape = Some(Vec::new());
        }
    }

    pub fn end(&mut self) {
        self.gradient_depth = self.gradient_depth.saturating_sub(1);
    }

    pub fn push(&mut self, mut node: TapeNode) {
        if let Some(tape) = self.active_tape.as_mut() {
            node.id = self.next_node_id;
            self.next_node_id += 1;
            tape.push(node);
        }
    }

    pub fn len(&self) -> usize {
        self.active_tape.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Nodes on a path from any of `xs` to `y`, in tape order, with inputs not
/// reachable from `xs` dropped.
pub fn filter_nodes_x_to_y(tape: &[TapeNode], xs: &[Tensor], y: &Tensor) -> Vec<TapeNode> {
    // Forward pass: tensors computed from xs.
    let mut from_x: HashSet<TensorId> = xs.iter().map(Tensor::id).collect();
    let mut nodes_from_x = HashSet::new();
    for node in tape {
        if node.inputs.values().any(|input| from_x.contains(&input.id())) {
            from_x.extend(node.outputs.iter().map(Tensor::id));
            nodes_from_x.insert(node.id);
        }
    }

    // Backward pass: tensors that lead to y.
    let mut leads_to_y: HashSet<TensorId> = HashSet::from([y.id()]);
    let mut nodes_to_y = HashSet::new();
    for node in tape.iter().rev() {
        if node.outputs.iter().any(|output| leads_to_y.contains(&output.id())) {
            leads_to_y.extend(node.inputs.values().map(Tensor::id));
            nodes_to_y.insert(node.id);
        }
    }

    let filtered: Vec<TapeNode> = tape
        .iter()
        .filter(|node| nodes_from_x.contains(&node.id) && nodes_to_y.contains(&node.id))
        .map(|node| {
            let mut pruned = node.clone();
            pruned.inputs.retain(|_, input| from_x.contains(&input.id()));
            pruned
        })
        .collect();
    debug!("pruned tape from {} to {} nodes", tape.len(), filtered.len());
    filtered
}
