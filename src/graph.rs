//! Arena-based intermediate representation of a computation graph.
//!
//! Nodes are stored in a single `Vec` indexed by [`NodeId`] and come in
//! three kinds: constants (weights), values (runtime inputs, outputs and
//! intermediates) and operators. Operator inputs and outputs are node IDs,
//! never owning references, which rules out reference cycles by
//! construction.

mod builder;
mod node;
mod node_id;

#[cfg(test)]
mod tests;

use std::error::Error;
use std::fmt;

// The std HashMap/HashSet provide DOS resistance. In this module hash keys
// are `NodeId`s which we allocate ourselves, so this is not a concern.
// Instead we want faster hashing.
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ops::{AttrKind, Attrs, OpKind};
use crate::value::{DataType, TensorValue};

pub use builder::GraphBuilder;
pub use node::{Constant, Dimension, Node, OperatorNode, ValueNode};
pub use node_id::NodeId;

/// Reasons why a graph violates a structural invariant.
///
/// These are raised when constructing a graph via [`GraphBuilder`] and when
/// re-validating a graph decoded from an artifact.
#[derive(Debug, PartialEq)]
pub enum MalformedGraphError {
    /// An operator was given a number of inputs outside its signature range.
    ArityMismatch {
        op: String,
        kind: OpKind,
        expected_min: usize,
        expected_max: usize,
        actual: usize,
    },

    /// An operator's output count does not match its signature.
    OutputCountMismatch {
        op: String,
        expected: usize,
        actual: usize,
    },

    /// A required attribute is missing.
    MissingAttr { op: String, attr: &'static str },

    /// An attribute is not part of the operator kind's schema.
    UnknownAttr { op: String, attr: String },

    /// An attribute has a value of the wrong type.
    AttrTypeMismatch {
        op: String,
        attr: String,
        expected: AttrKind,
    },

    /// An operator references a node ID that does not exist.
    InvalidNodeId { op: String, id: u32 },

    /// An operator consumes another operator node directly instead of a
    /// value.
    InputIsOperator { op: String, input: String },

    /// An operator output is not a value node.
    OutputNotValue { op: String, output: String },

    /// A value is produced by more than one operator.
    DuplicateProducer { value: String },

    /// A value is consumed but is not a graph input, a constant, or the
    /// output of any operator.
    DanglingValue { op: String, value: String },

    /// Adding the operator would create a cycle.
    Cycle { op: String },

    /// A graph input or output ID does not refer to a value node.
    InvalidGraphIo { id: u32 },

    /// The graph has no outputs.
    NoOutputs,
}

impl fmt::Display for MalformedGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArityMismatch {
                op,
                kind,
                expected_min,
                expected_max,
                actual,
            } => {
                if expected_min == expected_max {
                    write!(
                        f,
                        "operator \"{}\" ({}) expects {} inputs but has {}",
                        op, kind, expected_min, actual
                    )
                } else {
                    write!(
                        f,
                        "operator \"{}\" ({}) expects {}..{} inputs but has {}",
                        op, kind, expected_min, expected_max, actual
                    )
                }
            }
            Self::OutputCountMismatch {
                op,
                expected,
                actual,
            } => write!(
                f,
                "operator \"{}\" expects {} outputs but has {}",
                op, expected, actual
            ),
            Self::MissingAttr { op, attr } => {
                write!(f, "operator \"{}\" is missing attribute \"{}\"", op, attr)
            }
            Self::UnknownAttr { op, attr } => {
                write!(f, "operator \"{}\" has unknown attribute \"{}\"", op, attr)
            }
            Self::AttrTypeMismatch { op, attr, expected } => write!(
                f,
                "attribute \"{}\" of operator \"{}\" should have type {:?}",
                attr, op, expected
            ),
            Self::InvalidNodeId { op, id } => {
                write!(f, "operator \"{}\" references unknown node {}", op, id)
            }
            Self::InputIsOperator { op, input } => write!(
                f,
                "operator \"{}\" consumes operator node \"{}\" directly",
                op, input
            ),
            Self::OutputNotValue { op, output } => write!(
                f,
                "output \"{}\" of operator \"{}\" is not a value node",
                output, op
            ),
            Self::DuplicateProducer { value } => {
                write!(f, "value \"{}\" is produced by multiple operators", value)
            }
            Self::DanglingValue { op, value } => write!(
                f,
                "input \"{}\" of operator \"{}\" is not produced by any node",
                value, op
            ),
            Self::Cycle { op } => {
                write!(f, "operator \"{}\" is part of a cycle", op)
            }
            Self::InvalidGraphIo { id } => {
                write!(f, "graph input/output {} is not a value node", id)
            }
            Self::NoOutputs => write!(f, "graph has no outputs"),
        }
    }
}

impl Error for MalformedGraphError {}

/// A computation graph: operators connected through shared value IDs, plus
/// designated input and output values and embedded constants.
///
/// Graphs are constructed via [`GraphBuilder`] and treated as immutable by
/// the pipeline stages, each of which produces a new graph rather than
/// mutating its input.
#[derive(Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    input_ids: Vec<NodeId>,
    output_ids: Vec<NodeId>,

    // Map of value ID => operator node that computes it.
    producers: FxHashMap<NodeId, NodeId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Graph {
        Graph::default()
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId::from_u32((self.nodes.len() - 1) as u32)
    }

    /// Add a value node to the graph and return its ID.
    pub(crate) fn add_value(
        &mut self,
        name: Option<&str>,
        dtype: Option<DataType>,
        shape: Option<Vec<Dimension>>,
    ) -> NodeId {
        self.push(Node::Value(ValueNode::new(name, dtype, shape)))
    }

    /// Add a constant node to the graph and return its ID.
    pub(crate) fn add_constant(&mut self, name: Option<&str>, value: TensorValue) -> NodeId {
        self.push(Node::Constant(Constant::new(name, value)))
    }

    /// Add an operator node to the graph and return its ID.
    ///
    /// This performs no validation; [`GraphBuilder`] is the checked
    /// construction path.
    pub(crate) fn add_op(
        &mut self,
        name: Option<&str>,
        kind: OpKind,
        attrs: Attrs,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> NodeId {
        let op_id = self.push(Node::Operator(OperatorNode::new(
            name, kind, attrs, inputs, outputs,
        )));
        for &output_id in outputs {
            self.producers.insert(output_id, op_id);
        }
        op_id
    }

    /// Retrieve a node by ID.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.as_usize())
    }

    pub(crate) fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.as_usize())
    }

    /// Return the debug name for a node, falling back to its ID.
    pub fn node_name(&self, id: NodeId) -> String {
        self.get_node(id)
            .and_then(|node| node.name())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("[ID: {}]", id))
    }

    /// Iterate over all nodes and their IDs, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId::from_u32(i as u32), node))
    }

    /// Iterate over operator nodes and their IDs, in insertion order.
    pub fn operators(&self) -> impl Iterator<Item = (NodeId, &OperatorNode)> {
        self.iter().filter_map(|(id, node)| match node {
            Node::Operator(op) => Some((id, op)),
            _ => None,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn op_count(&self) -> usize {
        self.operators().count()
    }

    pub fn constant_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, Node::Constant(_)))
            .count()
    }

    /// Return the total number of elements in all constant nodes.
    pub fn total_params(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match node {
                Node::Constant(constant) => constant.len(),
                _ => 0,
            })
            .sum()
    }

    /// IDs of the graph's input value nodes, in order.
    pub fn input_ids(&self) -> &[NodeId] {
        &self.input_ids
    }

    /// IDs of the graph's output value nodes, in order.
    pub fn output_ids(&self) -> &[NodeId] {
        &self.output_ids
    }

    pub(crate) fn set_input_ids(&mut self, ids: &[NodeId]) {
        self.input_ids = ids.to_vec();
    }

    pub(crate) fn set_output_ids(&mut self, ids: &[NodeId]) {
        self.output_ids = ids.to_vec();
    }

    /// Return the constant node for `id`, if it is one.
    pub fn get_constant(&self, id: NodeId) -> Option<&Constant> {
        self.get_node(id).and_then(|node| node.as_constant())
    }

    /// Return the operator that produces `value_id`, if any.
    pub fn source_node(&self, value_id: NodeId) -> Option<(NodeId, &OperatorNode)> {
        let op_id = *self.producers.get(&value_id)?;
        let op = self.get_node(op_id)?.as_operator()?;
        Some((op_id, op))
    }

    /// Build a map of value ID => operator nodes that consume it.
    pub fn consumer_map(&self) -> FxHashMap<NodeId, Vec<NodeId>> {
        let mut consumers: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for (op_id, op) in self.operators() {
            for &input_id in op.input_ids() {
                consumers.entry(input_id).or_default().push(op_id);
            }
        }
        consumers
    }

    /// Compute the ordered list of operators that produce `outputs` from
    /// `inputs` and the graph's constants.
    ///
    /// The order is stable: producers come before consumers, and ties are
    /// broken by the original insertion order of the output lists, so
    /// repeated calls yield identical plans.
    pub fn execution_plan(
        &self,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> Result<Vec<NodeId>, MalformedGraphError> {
        struct Planner<'a> {
            graph: &'a Graph,
            resolved: FxHashSet<NodeId>,
            visiting: FxHashSet<NodeId>,
            scheduled: FxHashSet<NodeId>,
            plan: Vec<NodeId>,
        }

        impl Planner<'_> {
            fn visit_op(&mut self, op_id: NodeId, op: &OperatorNode) -> Result<(), MalformedGraphError> {
                if self.scheduled.contains(&op_id) {
                    return Ok(());
                }
                if !self.visiting.insert(op_id) {
                    return Err(MalformedGraphError::Cycle {
                        op: self.graph.node_name(op_id),
                    });
                }

                for &input_id in op.input_ids() {
                    if self.resolved.contains(&input_id) {
                        continue;
                    }
                    if let Some((src_id, src_op)) = self.graph.source_node(input_id) {
                        self.visit_op(src_id, src_op)?;
                    } else {
                        return Err(MalformedGraphError::DanglingValue {
                            op: self.graph.node_name(op_id),
                            value: self.graph.node_name(input_id),
                        });
                    }
                }

                self.visiting.remove(&op_id);
                self.scheduled.insert(op_id);
                self.resolved.extend(op.output_ids().iter().copied());
                self.plan.push(op_id);
                Ok(())
            }
        }

        let resolved: FxHashSet<NodeId> = inputs
            .iter()
            .copied()
            .chain(self.iter().filter_map(|(id, node)| {
                matches!(node, Node::Constant(_)).then_some(id)
            }))
            .collect();

        let mut planner = Planner {
            graph: self,
            resolved,
            visiting: FxHashSet::default(),
            scheduled: FxHashSet::default(),
            plan: Vec::new(),
        };

        for &output_id in outputs {
            if planner.resolved.contains(&output_id) {
                continue;
            }
            if let Some((op_id, op)) = self.source_node(output_id) {
                planner.visit_op(op_id, op)?;
            } else {
                return Err(MalformedGraphError::DanglingValue {
                    op: "[graph output]".to_string(),
                    value: self.node_name(output_id),
                });
            }
        }
        Ok(planner.plan)
    }

    /// Check the graph's structural invariants.
    ///
    /// Every tensor consumed by an operator must be produced by exactly one
    /// node, be a graph input, or be a registered constant; operator arities
    /// and attributes must match their signatures; and the graph must be
    /// acyclic. Graphs decoded from artifacts are re-validated this way.
    pub fn validate(&self) -> Result<(), MalformedGraphError> {
        let input_set: FxHashSet<NodeId> = self.input_ids.iter().copied().collect();

        for &io_id in self.input_ids.iter().chain(self.output_ids.iter()) {
            match self.get_node(io_id) {
                Some(Node::Value(_)) => {}
                _ => return Err(MalformedGraphError::InvalidGraphIo { id: io_id.as_u32() }),
            }
        }

        let mut produced: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        for (op_id, op) in self.operators() {
            let op_name = self.node_name(op_id);
            check_op(
                &op_name,
                op.kind(),
                op.attrs(),
                op.input_ids().len(),
                op.output_ids().len(),
            )?;

            for &input_id in op.input_ids() {
                match self.get_node(input_id) {
                    Some(Node::Value(_)) | Some(Node::Constant(_)) => {}
                    Some(Node::Operator(_)) => {
                        return Err(MalformedGraphError::InputIsOperator {
                            op: op_name.clone(),
                            input: self.node_name(input_id),
                        });
                    }
                    None => {
                        return Err(MalformedGraphError::InvalidNodeId {
                            op: op_name.clone(),
                            id: input_id.as_u32(),
                        });
                    }
                }
            }

            for &output_id in op.output_ids() {
                match self.get_node(output_id) {
                    Some(Node::Value(_)) => {}
                    Some(_) => {
                        return Err(MalformedGraphError::OutputNotValue {
                            op: op_name.clone(),
                            output: self.node_name(output_id),
                        });
                    }
                    None => {
                        return Err(MalformedGraphError::InvalidNodeId {
                            op: op_name.clone(),
                            id: output_id.as_u32(),
                        });
                    }
                }
                if produced.insert(output_id, op_id).is_some() {
                    return Err(MalformedGraphError::DuplicateProducer {
                        value: self.node_name(output_id),
                    });
                }
            }
        }

        // Every consumed value must have a source.
        for (op_id, op) in self.operators() {
            for &input_id in op.input_ids() {
                let is_value = matches!(self.get_node(input_id), Some(Node::Value(_)));
                if is_value
                    && !input_set.contains(&input_id)
                    && !produced.contains_key(&input_id)
                {
                    return Err(MalformedGraphError::DanglingValue {
                        op: self.node_name(op_id),
                        value: self.node_name(input_id),
                    });
                }
            }
        }

        // Planning the full graph detects cycles, including in parts not
        // reachable from the outputs.
        let all_op_outputs: Vec<NodeId> = self
            .operators()
            .flat_map(|(_, op)| op.output_ids().iter().copied())
            .collect();
        self.execution_plan(&self.input_ids, &all_op_outputs)?;

        Ok(())
    }
}

/// Check an operator's arity and attributes against its signature.
pub(crate) fn check_op(
    op_name: &str,
    kind: OpKind,
    attrs: &Attrs,
    input_count: usize,
    output_count: usize,
) -> Result<(), MalformedGraphError> {
    let sig = kind.signature();

    if input_count < sig.min_inputs || input_count > sig.max_inputs {
        return Err(MalformedGraphError::ArityMismatch {
            op: op_name.to_string(),
            kind,
            expected_min: sig.min_inputs,
            expected_max: sig.max_inputs,
            actual: input_count,
        });
    }
    if output_count != sig.outputs {
        return Err(MalformedGraphError::OutputCountMismatch {
            op: op_name.to_string(),
            expected: sig.outputs,
            actual: output_count,
        });
    }

    for (name, value) in attrs.iter() {
        let Some(schema) = sig.attrs.iter().find(|schema| schema.name == name) else {
            return Err(MalformedGraphError::UnknownAttr {
                op: op_name.to_string(),
                attr: name.to_string(),
            });
        };
        if value.kind() != schema.kind {
            return Err(MalformedGraphError::AttrTypeMismatch {
                op: op_name.to_string(),
                attr: name.to_string(),
                expected: schema.kind,
            });
        }
    }

    for schema in sig.attrs.iter().filter(|schema| schema.required) {
        if attrs.get(schema.name).is_none() {
            return Err(MalformedGraphError::MissingAttr {
                op: op_name.to_string(),
                attr: schema.name,
            });
        }
    }

    Ok(())
}
