//! Graph simplification passes and the fixpoint pipeline that runs them.

mod fusions;
mod pattern;

#[cfg(test)]
mod tests;

use std::error::Error;
use std::fmt::{Display, Formatter};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::{Graph, MalformedGraphError, Node, NodeId, OperatorNode};
use crate::ops::eval::{eval, is_foldable};
use crate::ops::{AttrValue, Attrs, OpKind};
use crate::value::TensorValue;

pub use fusions::OperatorFusion;

/// Errors that occur while applying graph simplifications.
#[derive(Debug, PartialEq)]
pub enum OptimizeError {
    /// The graph failed a structural check while planning a rewrite.
    Graph(MalformedGraphError),
}

impl Display for OptimizeError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::Graph(err) => write!(f, "graph rewrite failed: {}", err),
        }
    }
}

impl Error for OptimizeError {}

impl From<MalformedGraphError> for OptimizeError {
    fn from(err: MalformedGraphError) -> OptimizeError {
        OptimizeError::Graph(err)
    }
}

/// Result of running one pass over a graph.
pub enum PassOutcome {
    /// The pass found nothing to rewrite; the input graph stands.
    Unchanged,

    /// The pass produced a rewritten graph. `count` is the number of
    /// rewrites applied.
    Changed { graph: Graph, count: usize },
}

/// A single graph-rewrite pass.
///
/// Passes receive the prior graph read-only and produce a replacement; they
/// never mutate their input. This keeps independent exports over one source
/// graph safely shareable.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&self, graph: &Graph) -> Result<PassOutcome, OptimizeError>;
}

/// Holds a working copy of a [`Graph`] while a pass rewrites it, and
/// compacts the result when the pass finishes.
///
/// Rewrites are expressed as value replacements, operator removals and new
/// nodes. [`finish`](GraphEditor::finish) rebuilds the arena densely in the
/// original insertion order, dropping removed operators and any values or
/// constants nothing references anymore, so that repeated runs produce
/// bit-identical graphs.
pub(crate) struct GraphEditor {
    graph: Graph,
    consumers: FxHashMap<NodeId, Vec<NodeId>>,
    removed_ops: FxHashSet<NodeId>,
}

impl GraphEditor {
    pub(crate) fn from_graph(graph: &Graph) -> GraphEditor {
        GraphEditor {
            consumers: graph.consumer_map(),
            graph: graph.clone(),
            removed_ops: FxHashSet::default(),
        }
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }

    pub(crate) fn is_removed(&self, op_id: NodeId) -> bool {
        self.removed_ops.contains(&op_id)
    }

    /// Operators that consume `value_id`, excluding removed ones.
    pub(crate) fn value_consumers(&self, value_id: NodeId) -> Vec<NodeId> {
        self.consumers
            .get(&value_id)
            .map(|ops| {
                ops.iter()
                    .copied()
                    .filter(|op_id| !self.removed_ops.contains(op_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn add_constant(&mut self, name: Option<&str>, value: TensorValue) -> NodeId {
        self.graph.add_constant(name, value)
    }

    /// Add an operator writing to existing value nodes.
    pub(crate) fn add_op(
        &mut self,
        name: Option<&str>,
        kind: OpKind,
        attrs: Attrs,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> NodeId {
        let op_id = self.graph.add_op(name, kind, attrs, inputs, outputs);
        for &input_id in inputs {
            self.consumers.entry(input_id).or_default().push(op_id);
        }
        op_id
    }

    /// Replace `old_id` with `new_id` in operator inputs and graph outputs.
    pub(crate) fn replace_value(&mut self, old_id: NodeId, new_id: NodeId) {
        let output_ids: Vec<NodeId> = self
            .graph
            .output_ids()
            .iter()
            .map(|&id| if id == old_id { new_id } else { id })
            .collect();
        self.graph.set_output_ids(&output_ids);

        let Some(consumer_ops) = self.consumers.remove(&old_id) else {
            return;
        };
        for &op_id in &consumer_ops {
            if let Some(Node::Operator(op)) = self.graph.get_node_mut(op_id) {
                op.replace_input(old_id, new_id);
            }
        }
        self.consumers
            .entry(new_id)
            .or_default()
            .extend(consumer_ops);
    }

    pub(crate) fn remove_op(&mut self, op_id: NodeId) {
        self.removed_ops.insert(op_id);
    }

    /// Compact the edited graph into a fresh arena.
    pub(crate) fn finish(self) -> Graph {
        let GraphEditor {
            graph,
            consumers: _,
            removed_ops,
        } = self;

        // Everything a surviving operator or the graph interface still
        // touches.
        let mut referenced: FxHashSet<NodeId> = graph
            .input_ids()
            .iter()
            .chain(graph.output_ids())
            .copied()
            .collect();
        for (op_id, op) in graph.operators() {
            if removed_ops.contains(&op_id) {
                continue;
            }
            referenced.extend(op.input_ids().iter().copied());
            referenced.extend(op.output_ids().iter().copied());
        }

        // First pass: assign dense new IDs in the original order.
        let mut remap: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        let mut next_id = 0u32;
        for (old_id, node) in graph.iter() {
            let keep = match node {
                Node::Operator(_) => !removed_ops.contains(&old_id),
                Node::Value(_) | Node::Constant(_) => referenced.contains(&old_id),
            };
            if keep {
                remap.insert(old_id, NodeId::from_u32(next_id));
                next_id += 1;
            }
        }

        // Second pass: rebuild the arena.
        let mut compacted = Graph::new();
        for (old_id, node) in graph.iter() {
            if !remap.contains_key(&old_id) {
                continue;
            }
            match node {
                Node::Value(value) => {
                    compacted.add_value(
                        value.name(),
                        value.dtype(),
                        value.shape().map(|dims| dims.to_vec()),
                    );
                }
                Node::Constant(constant) => {
                    compacted.add_constant(constant.name(), constant.value().clone());
                }
                Node::Operator(op) => {
                    let inputs: Vec<NodeId> =
                        op.input_ids().iter().map(|id| remap[id]).collect();
                    let outputs: Vec<NodeId> =
                        op.output_ids().iter().map(|id| remap[id]).collect();
                    compacted.add_op(op.name(), op.kind(), op.attrs().clone(), &inputs, &outputs);
                }
            }
        }

        let remap_ids =
            |ids: &[NodeId]| -> Vec<NodeId> { ids.iter().map(|id| remap[id]).collect() };
        compacted.set_input_ids(&remap_ids(graph.input_ids()));
        compacted.set_output_ids(&remap_ids(graph.output_ids()));
        compacted
    }
}

/// Ordered IDs of every operator output in the graph.
fn all_op_outputs(graph: &Graph) -> Vec<NodeId> {
    graph
        .operators()
        .flat_map(|(_, op)| op.output_ids().iter().copied())
        .collect()
}

/// Evaluate operators whose inputs are all constants and replace them with
/// the value they would compute at runtime.
pub struct ConstantFolding;

impl Pass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn run(&self, graph: &Graph) -> Result<PassOutcome, OptimizeError> {
        let plan = graph.execution_plan(graph.input_ids(), &all_op_outputs(graph))?;
        let mut editor = GraphEditor::from_graph(graph);
        let mut folded = 0;

        for op_id in plan {
            let Some(op) = editor.graph().get_node(op_id).and_then(|n| n.as_operator()) else {
                continue;
            };
            if !is_foldable(op.kind()) || op.output_ids().len() != 1 {
                continue;
            }

            let kind = op.kind();
            let attrs = op.attrs().clone();
            let input_ids = op.input_ids().to_vec();
            let output_id = op.output_ids()[0];

            let result = {
                let inputs: Option<Vec<&TensorValue>> = input_ids
                    .iter()
                    .map(|&id| editor.graph().get_constant(id).map(|c| c.value()))
                    .collect();
                let Some(inputs) = inputs else {
                    continue;
                };
                eval(kind, &attrs, &inputs)
            };

            // Evaluation failures (unsupported kind, div-by-zero, ...) leave
            // the node in place; the runtime will reproduce the condition.
            let Ok(value) = result else {
                continue;
            };

            let const_name = editor
                .graph()
                .get_node(output_id)
                .and_then(|node| node.name())
                .map(|name| name.to_string());
            let const_id = editor.add_constant(const_name.as_deref(), value);
            editor.replace_value(output_id, const_id);
            editor.remove_op(op_id);
            folded += 1;
        }

        if folded == 0 {
            Ok(PassOutcome::Unchanged)
        } else {
            Ok(PassOutcome::Changed {
                graph: editor.finish(),
                count: folded,
            })
        }
    }
}

/// Hashable identity of an operator: kind, canonical attributes and input
/// IDs. Two operators with equal keys compute the same values.
#[derive(Eq, Hash, PartialEq)]
struct OpKey {
    kind: OpKind,
    attrs: Vec<(String, AttrKey)>,
    inputs: Vec<u32>,
}

#[derive(Eq, Hash, PartialEq)]
enum AttrKey {
    Int(i64),
    // Float attributes are keyed by their bit pattern.
    Float(u32),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<u32>),
}

impl OpKey {
    fn from_op(op: &OperatorNode) -> OpKey {
        let attrs = op
            .attrs()
            .iter()
            .map(|(name, value)| {
                let key = match value {
                    AttrValue::Int(v) => AttrKey::Int(*v),
                    AttrValue::Float(v) => AttrKey::Float(v.to_bits()),
                    AttrValue::String(v) => AttrKey::Str(v.clone()),
                    AttrValue::Ints(v) => AttrKey::Ints(v.clone()),
                    AttrValue::Floats(v) => {
                        AttrKey::Floats(v.iter().map(|f| f.to_bits()).collect())
                    }
                };
                (name.to_string(), key)
            })
            .collect();
        OpKey {
            kind: op.kind(),
            attrs,
            inputs: op.input_ids().iter().map(|id| id.as_u32()).collect(),
        }
    }
}

/// Merge operators with identical kind, attributes and inputs, rewiring all
/// consumers of the duplicate onto the surviving node.
pub struct RedundantNodeElimination;

impl Pass for RedundantNodeElimination {
    fn name(&self) -> &'static str {
        "redundant-elimination"
    }

    fn run(&self, graph: &Graph) -> Result<PassOutcome, OptimizeError> {
        let plan = graph.execution_plan(graph.input_ids(), &all_op_outputs(graph))?;
        let mut editor = GraphEditor::from_graph(graph);
        let mut merged = 0;

        let mut seen: FxHashMap<OpKey, Vec<NodeId>> = FxHashMap::default();
        for op_id in plan {
            let Some(op) = editor.graph().get_node(op_id).and_then(|n| n.as_operator()) else {
                continue;
            };
            // Identity is by input node, not input value: two operators
            // reading the same IDs are interchangeable.
            let key = OpKey::from_op(op);
            let outputs = op.output_ids().to_vec();

            if let Some(survivor_outputs) = seen.get(&key) {
                let survivor_outputs = survivor_outputs.clone();
                for (dup_out, surv_out) in outputs.iter().zip(survivor_outputs) {
                    editor.replace_value(*dup_out, surv_out);
                }
                editor.remove_op(op_id);
                merged += 1;
            } else {
                seen.insert(key, outputs);
            }
        }

        if merged == 0 {
            Ok(PassOutcome::Unchanged)
        } else {
            Ok(PassOutcome::Changed {
                graph: editor.finish(),
                count: merged,
            })
        }
    }
}

/// Remove operators none of whose outputs can reach a graph output.
pub struct DeadNodeElimination;

impl Pass for DeadNodeElimination {
    fn name(&self) -> &'static str {
        "dead-elimination"
    }

    fn run(&self, graph: &Graph) -> Result<PassOutcome, OptimizeError> {
        let mut live_ops: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack: Vec<NodeId> = graph.output_ids().to_vec();
        while let Some(value_id) = stack.pop() {
            let Some((op_id, op)) = graph.source_node(value_id) else {
                continue;
            };
            if live_ops.insert(op_id) {
                stack.extend(op.input_ids().iter().copied());
            }
        }

        let dead: Vec<NodeId> = graph
            .operators()
            .filter_map(|(op_id, _)| (!live_ops.contains(&op_id)).then_some(op_id))
            .collect();
        if dead.is_empty() {
            return Ok(PassOutcome::Unchanged);
        }

        let count = dead.len();
        let mut editor = GraphEditor::from_graph(graph);
        for op_id in dead {
            editor.remove_op(op_id);
        }
        Ok(PassOutcome::Changed {
            graph: editor.finish(),
            count,
        })
    }
}

/// Per-pass rewrite counts accumulated over a pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineStats {
    /// Number of full pass-sequence iterations executed.
    pub iterations: usize,

    /// True if the last iteration made no changes (a fixpoint was reached
    /// within the iteration budget).
    pub converged: bool,

    /// Total rewrites applied per pass, in pass order.
    pub changes: Vec<(String, usize)>,
}

/// An ordered sequence of passes iterated to a fixpoint.
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
    max_iterations: usize,
}

impl Pipeline {
    /// The canonical pipeline: constant folding, redundant node
    /// elimination, operator fusion, dead node elimination.
    ///
    /// Later passes depend on earlier ones having normalized the graph, so
    /// the order is significant.
    pub fn standard(max_iterations: usize) -> Pipeline {
        Pipeline {
            passes: vec![
                Box::new(ConstantFolding),
                Box::new(RedundantNodeElimination),
                Box::new(OperatorFusion::standard()),
                Box::new(DeadNodeElimination),
            ],
            max_iterations,
        }
    }

    /// Build a pipeline from an explicit pass list.
    pub fn with_passes(passes: Vec<Box<dyn Pass>>, max_iterations: usize) -> Pipeline {
        Pipeline {
            passes,
            max_iterations,
        }
    }

    /// Run the pass sequence repeatedly until an iteration makes no
    /// changes, or the iteration budget is exhausted.
    ///
    /// Exhausting the budget is not an error; the caller inspects
    /// [`PipelineStats::converged`] and reports a warning.
    pub fn run(&self, mut graph: Graph) -> Result<(Graph, PipelineStats), OptimizeError> {
        let mut changes: Vec<(String, usize)> = self
            .passes
            .iter()
            .map(|pass| (pass.name().to_string(), 0))
            .collect();
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iterations {
            iterations += 1;
            let mut iteration_changes = 0;

            for (index, pass) in self.passes.iter().enumerate() {
                match pass.run(&graph)? {
                    PassOutcome::Unchanged => {}
                    PassOutcome::Changed {
                        graph: rewritten,
                        count,
                    } => {
                        graph = rewritten;
                        changes[index].1 += count;
                        iteration_changes += count;
                    }
                }
            }

            if iteration_changes == 0 {
                converged = true;
                break;
            }
        }

        Ok((
            graph,
            PipelineStats {
                iterations,
                converged,
                changes,
            },
        ))
    }
}
