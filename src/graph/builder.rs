use super::{check_op, Dimension, Graph, MalformedGraphError, Node, NodeId};
use crate::ops::{Attrs, OpKind};
use crate::value::{DataType, TensorValue};

/// Checked construction path for [`Graph`]s.
///
/// The builder appends values, constants and operators, rejecting any
/// operator whose arity or attributes do not match its kind's signature.
/// Operator inputs must already exist when the operator is added and output
/// values are created fresh, so cycles cannot be constructed.
///
/// ```
/// use graphport::{Attrs, GraphBuilder, OpKind, Tensor};
///
/// let mut builder = GraphBuilder::new();
/// let x = builder.add_value(Some("x"), None, None);
/// let two = builder.add_constant(Some("two"), Tensor::from_scalar(2.0f32));
/// let (_, doubled) = builder
///     .add_op(Some("double"), OpKind::Mul, Attrs::new(), &[x, two])
///     .unwrap();
/// builder.set_inputs(&[x]);
/// builder.set_outputs(&[doubled]);
/// let graph = builder.finish().unwrap();
/// assert_eq!(graph.op_count(), 1);
/// ```
pub struct GraphBuilder {
    graph: Graph,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder {
            graph: Graph::new(),
        }
    }

    /// Add a value node.
    ///
    /// `shape` is the expected shape of the value at runtime, or None if not
    /// known. Graph inputs handed to the shape generalizer must carry the
    /// concrete shape they were traced with.
    pub fn add_value(
        &mut self,
        name: Option<&str>,
        dtype: Option<DataType>,
        shape: Option<Vec<Dimension>>,
    ) -> NodeId {
        self.graph.add_value(name, dtype, shape)
    }

    /// Add a constant node holding `value`.
    pub fn add_constant(&mut self, name: Option<&str>, value: impl Into<TensorValue>) -> NodeId {
        self.graph.add_constant(name, value.into())
    }

    /// Add an operator node.
    ///
    /// Fresh value nodes are created for the operator's outputs. Returns the
    /// operator's ID and the ID of its first output value.
    pub fn add_op(
        &mut self,
        name: Option<&str>,
        kind: OpKind,
        attrs: Attrs,
        inputs: &[NodeId],
    ) -> Result<(NodeId, NodeId), MalformedGraphError> {
        let op_name = name.unwrap_or("");
        let sig = kind.signature();
        check_op(op_name, kind, &attrs, inputs.len(), sig.outputs)?;

        for &input_id in inputs {
            match self.graph.get_node(input_id) {
                Some(Node::Value(_)) | Some(Node::Constant(_)) => {}
                Some(Node::Operator(_)) => {
                    return Err(MalformedGraphError::InputIsOperator {
                        op: op_name.to_string(),
                        input: self.graph.node_name(input_id),
                    });
                }
                None => {
                    return Err(MalformedGraphError::InvalidNodeId {
                        op: op_name.to_string(),
                        id: input_id.as_u32(),
                    });
                }
            }
        }

        let outputs: Vec<NodeId> = (0..sig.outputs)
            .map(|i| {
                let out_name = name.map(|name| {
                    if i == 0 {
                        format!("{}_out", name)
                    } else {
                        format!("{}_out_{}", name, i)
                    }
                });
                self.graph.add_value(out_name.as_deref(), None, None)
            })
            .collect();

        let op_id = self.graph.add_op(name, kind, attrs, inputs, &outputs);
        Ok((op_id, outputs[0]))
    }

    /// Set the graph's input values, in order.
    pub fn set_inputs(&mut self, ids: &[NodeId]) {
        self.graph.set_input_ids(ids);
    }

    /// Set the graph's output values, in order.
    pub fn set_outputs(&mut self, ids: &[NodeId]) {
        self.graph.set_output_ids(ids);
    }

    /// Finish construction, validating the completed graph.
    pub fn finish(self) -> Result<Graph, MalformedGraphError> {
        if self.graph.output_ids().is_empty() {
            return Err(MalformedGraphError::NoOutputs);
        }
        self.graph.validate()?;
        Ok(self.graph)
    }
}
