use std::fmt;

use super::NodeId;
use crate::ops::{Attrs, OpKind};
use crate::value::{DataType, TensorValue};

/// Represents the size of a dimension of a runtime-provided value, such as
/// an operator input, output or intermediate value.
#[derive(Clone, PartialEq)]
pub enum Dimension {
    /// A dimension whose expected size is fixed and specified as part of the
    /// model.
    Fixed(usize),

    /// A dimension whose size is determined at runtime. The name identifies
    /// when different values share a size.
    Symbolic(String),
}

impl From<usize> for Dimension {
    fn from(val: usize) -> Dimension {
        Dimension::Fixed(val)
    }
}

impl From<String> for Dimension {
    fn from(name: String) -> Dimension {
        Dimension::Symbolic(name)
    }
}

impl<'a> From<&'a str> for Dimension {
    fn from(name: &'a str) -> Dimension {
        Dimension::Symbolic(name.into())
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "{}", size),
            Self::Symbolic(name) => write!(f, "\"{}\"", name),
        }
    }
}

/// A node in a [`Graph`](crate::Graph).
#[derive(Clone, Debug)]
pub enum Node {
    Operator(OperatorNode),
    Constant(Constant),
    Value(ValueNode),
}

impl Node {
    /// Return the debug name of this node.
    pub fn name(&self) -> Option<&str> {
        match self {
            Node::Operator(node) => node.name(),
            Node::Constant(constant) => constant.name(),
            Node::Value(node) => node.name(),
        }
    }

    /// Return the tensor shape associated with this node.
    ///
    /// For constants this is the shape of the tensor. Operator nodes have no
    /// shape. For values (eg. inputs/outputs) this is the expected shape.
    pub fn shape(&self) -> Option<Vec<Dimension>> {
        match self {
            Node::Operator(_) => None,
            Node::Constant(constant) => Some(
                constant
                    .shape()
                    .iter()
                    .copied()
                    .map(Dimension::Fixed)
                    .collect(),
            ),
            Node::Value(node) => node.shape().map(|dims| dims.to_vec()),
        }
    }

    /// Return the data type associated with this node, if known.
    pub fn dtype(&self) -> Option<DataType> {
        match self {
            Node::Operator(_) => None,
            Node::Constant(constant) => Some(constant.dtype()),
            Node::Value(node) => node.dtype(),
        }
    }

    pub fn as_operator(&self) -> Option<&OperatorNode> {
        match self {
            Node::Operator(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Node::Constant(constant) => Some(constant),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&ValueNode> {
        match self {
            Node::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// An operator instance: a kind from the closed operator set, attributes
/// validated against the kind's schema, and the IDs of its input and output
/// values.
///
/// Operator nodes are immutable once constructed; rewrite passes replace
/// them rather than mutating them.
#[derive(Clone, Debug)]
pub struct OperatorNode {
    name: Option<String>,
    kind: OpKind,
    attrs: Attrs,
    inputs: Box<[NodeId]>,
    outputs: Box<[NodeId]>,
}

impl OperatorNode {
    pub(crate) fn new(
        name: Option<&str>,
        kind: OpKind,
        attrs: Attrs,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> OperatorNode {
        OperatorNode {
            name: name.map(|s| s.to_owned()),
            kind,
            attrs,
            inputs: inputs.into(),
            outputs: outputs.into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn input_ids(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn output_ids(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Replace an input in the operator's list of inputs.
    ///
    /// Consumers outside the graph module use graph-level methods instead,
    /// which keep edge caches up to date.
    pub(crate) fn replace_input(&mut self, old_id: NodeId, new_id: NodeId) {
        for input_id in self.inputs.iter_mut() {
            if *input_id == old_id {
                *input_id = new_id;
            }
        }
    }
}

/// A placeholder for a value which is only available at runtime, such as a
/// graph input or an operator output.
#[derive(Clone, Debug)]
pub struct ValueNode {
    name: Option<String>,
    dtype: Option<DataType>,
    shape: Option<Vec<Dimension>>,
}

impl ValueNode {
    pub(crate) fn new(
        name: Option<&str>,
        dtype: Option<DataType>,
        shape: Option<Vec<Dimension>>,
    ) -> ValueNode {
        ValueNode {
            name: name.map(|s| s.to_owned()),
            dtype,
            shape,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn dtype(&self) -> Option<DataType> {
        self.dtype
    }

    pub fn shape(&self) -> Option<&[Dimension]> {
        self.shape.as_deref()
    }

    /// Return the number of dimensions, if the shape is known.
    pub fn ndim(&self) -> Option<usize> {
        self.shape.as_ref().map(|dims| dims.len())
    }

    pub(crate) fn set_shape(&mut self, shape: Vec<Dimension>) {
        self.shape = Some(shape);
    }

    pub(crate) fn set_dtype(&mut self, dtype: DataType) {
        self.dtype = Some(dtype);
    }
}

/// A constant value embedded in the graph, such as weights produced during
/// training.
#[derive(Clone, Debug)]
pub struct Constant {
    name: Option<String>,
    value: TensorValue,
}

impl Constant {
    pub(crate) fn new(name: Option<&str>, value: TensorValue) -> Constant {
        Constant {
            name: name.map(|s| s.to_owned()),
            value,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn value(&self) -> &TensorValue {
        &self.value
    }

    pub fn dtype(&self) -> DataType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Extract the value as a float scalar, if it is one.
    pub fn as_scalar_f32(&self) -> Option<f32> {
        self.value.as_scalar_f32()
    }

    /// Extract integer elements widened to i64, for scalars and vectors.
    pub fn as_i64_vec(&self) -> Option<Vec<i64>> {
        self.value.as_i64_vec()
    }
}
