//! Shape generalizer: replaces concrete traced dimensions with symbolic
//! axes and propagates them through the graph.

use std::error::Error;
use std::fmt;

use graphport_shape_inference::ops::{
    ConcatOp, ConvOp, GatherOp, PoolOp, ReshapeOp, ShapeOp, SliceOp, SqueezeOp, TransposeOp,
    UnsqueezeOp,
};
use graphport_shape_inference::{
    BinaryOp, InferCtx, InferError, InferShapes, MatMulOp, ReduceOp, SymExpr, SymTensor, UnaryOp,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::{Constant, Dimension, Graph, MalformedGraphError, Node, NodeId};
use crate::ops::{Attrs, OpKind};
use crate::value::DataType;

/// One requested dynamic axis: a graph input, an axis index within it, and
/// the symbolic name the axis should be exported under.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicAxis {
    pub input: usize,
    pub axis: usize,
    pub name: String,
}

impl DynamicAxis {
    pub fn new(input: usize, axis: usize, name: &str) -> DynamicAxis {
        DynamicAxis {
            input,
            axis,
            name: name.to_string(),
        }
    }
}

/// Which input axes to generalize.
#[derive(Clone, Debug, PartialEq)]
pub enum DynamicAxes {
    /// Generalize the leading (batch-like) axis of every input with rank
    /// >= 2. The axis of the first input is named `batch`, subsequent
    /// inputs get `batch_<i>`.
    Auto,

    /// Generalize exactly the listed axes.
    Axes(Vec<DynamicAxis>),
}

/// What to do when an operator's output shape cannot be derived
/// symbolically (data-dependent shapes).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ShapePolicy {
    /// Degrade the affected shapes to fresh anonymous symbols and attach a
    /// warning to the export report.
    #[default]
    Degrade,

    /// Fail the export.
    Strict,
}

/// Errors produced while generalizing shapes.
///
/// All of these are fatal to the export: a partially-generalized graph has
/// no well-defined meaning.
#[derive(Debug, PartialEq)]
pub enum GeneralizeError {
    /// A requested dynamic axis is algebraically forced to a fixed value
    /// elsewhere in the graph, or two derivations of the same symbol
    /// disagree.
    ConflictingAxis {
        axis: String,
        value: i64,
        op: String,
    },

    /// A configured (input, axis) pair is out of range for the graph.
    InvalidAxis { input: usize, axis: usize },

    /// A graph input has no traced shape to generalize.
    MissingInputShape { input: String },

    /// An operator's inputs can never be valid, regardless of symbol
    /// bindings.
    Inference { op: String, error: InferError },

    /// An output shape could not be derived and the policy is
    /// [`ShapePolicy::Strict`].
    UnderivableShape { op: String },

    /// The graph failed structural checks while planning.
    Graph(MalformedGraphError),
}

impl fmt::Display for GeneralizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingAxis { axis, value, op } => write!(
                f,
                "dynamic axis \"{}\" is forced to fixed size {} by operator \"{}\"",
                axis, value, op
            ),
            Self::InvalidAxis { input, axis } => write!(
                f,
                "dynamic axis ({}, {}) is out of range for the graph inputs",
                input, axis
            ),
            Self::MissingInputShape { input } => {
                write!(f, "graph input \"{}\" has no traced shape", input)
            }
            Self::Inference { op, error } => {
                write!(f, "shape inference failed at operator \"{}\": {}", op, error)
            }
            Self::UnderivableShape { op } => write!(
                f,
                "shape of operator \"{}\" output cannot be derived symbolically",
                op
            ),
            Self::Graph(err) => write!(f, "{}", err),
        }
    }
}

impl Error for GeneralizeError {}

impl From<MalformedGraphError> for GeneralizeError {
    fn from(err: MalformedGraphError) -> GeneralizeError {
        GeneralizeError::Graph(err)
    }
}

/// Rewrites a traced graph's shapes according to a [`DynamicAxes`]
/// configuration and forward-propagates the resulting symbolic shapes.
pub struct ShapeGeneralizer {
    axes: DynamicAxes,
    policy: ShapePolicy,
}

impl ShapeGeneralizer {
    pub fn new(axes: DynamicAxes, policy: ShapePolicy) -> ShapeGeneralizer {
        ShapeGeneralizer { axes, policy }
    }

    /// Generalize `graph`, returning the rewritten graph and any
    /// degraded-shape warnings.
    pub fn generalize(&self, graph: &Graph) -> Result<(Graph, Vec<String>), GeneralizeError> {
        let mut graph = graph.clone();
        let mut warnings = Vec::new();

        let axis_list = self.resolve_axes(&graph)?;
        let user_axes: FxHashSet<&str> =
            axis_list.iter().map(|axis| axis.name.as_str()).collect();

        // Seed the environment with constants and the generalized inputs.
        let mut env: FxHashMap<NodeId, SymTensor> = FxHashMap::default();
        for (id, node) in graph.iter() {
            if let Node::Constant(constant) = node {
                env.insert(id, const_sym_tensor(constant));
            }
        }
        for (index, &input_id) in graph.input_ids().iter().enumerate() {
            let value = graph
                .get_node(input_id)
                .and_then(|node| node.as_value())
                .expect("graph inputs are value nodes");
            let Some(shape) = value.shape() else {
                return Err(GeneralizeError::MissingInputShape {
                    input: graph.node_name(input_id),
                });
            };

            let mut dims: Vec<SymExpr> = shape
                .iter()
                .map(|dim| match dim {
                    Dimension::Fixed(size) => SymExpr::from(*size),
                    Dimension::Symbolic(name) => SymExpr::var(name),
                })
                .collect();
            for axis in axis_list.iter().filter(|axis| axis.input == index) {
                dims[axis.axis] = SymExpr::var(&axis.name);
            }
            env.insert(input_id, SymTensor::from_shape(dims));
        }

        // Walk operators in execution order, inferring each node's outputs
        // and collecting the symbol constraints the rules derive.
        let all_op_outputs: Vec<NodeId> = graph
            .operators()
            .flat_map(|(_, op)| op.output_ids().iter().copied())
            .collect();
        let plan = graph.execution_plan(graph.input_ids(), &all_op_outputs)?;

        let mut ctx = InferCtx::new();
        let mut bindings: FxHashMap<String, i64> = FxHashMap::default();

        for op_id in plan {
            let op = graph
                .get_node(op_id)
                .and_then(|node| node.as_operator())
                .expect("plan entries are operators");
            let op_name = graph.node_name(op_id);

            let inputs: Vec<SymTensor> = op
                .input_ids()
                .iter()
                .map(|id| env.get(id).cloned().unwrap_or_else(SymTensor::unknown))
                .collect();

            let rule = infer_rule(op.kind(), op.attrs());
            let outputs = rule
                .infer_shapes(&inputs, &mut ctx)
                .map_err(|error| GeneralizeError::Inference {
                    op: op_name.clone(),
                    error,
                })?;

            // Unify constraints derived at this node so conflicts are
            // reported against the operator that caused them.
            for constraint in ctx.constraints.drain(..) {
                if user_axes.contains(constraint.name.as_str()) {
                    return Err(GeneralizeError::ConflictingAxis {
                        axis: constraint.name,
                        value: constraint.value,
                        op: op_name.clone(),
                    });
                }
                match bindings.get(&constraint.name) {
                    Some(&bound) if bound != constraint.value => {
                        return Err(GeneralizeError::ConflictingAxis {
                            axis: constraint.name,
                            value: constraint.value,
                            op: op_name.clone(),
                        });
                    }
                    _ => {
                        bindings.insert(constraint.name, constraint.value);
                    }
                }
            }

            for (&out_id, out_sym) in op.output_ids().iter().zip(outputs) {
                if out_sym.is_unknown() {
                    match self.policy {
                        ShapePolicy::Strict => {
                            return Err(GeneralizeError::UnderivableShape { op: op_name });
                        }
                        ShapePolicy::Degrade => warnings.push(format!(
                            "shape of \"{}\" output could not be derived; exported as unknown",
                            op_name
                        )),
                    }
                }
                env.insert(out_id, out_sym.simplify());
            }
        }

        // Pinned internal symbols become fixed dimensions again.
        let rendered: Vec<(NodeId, Option<Vec<Dimension>>)> = graph
            .iter()
            .filter(|(_, node)| matches!(node, Node::Value(_)))
            .map(|(id, _)| {
                let dims = env.get(&id).map(|sym| {
                    render_dims(sym, &bindings, &mut ctx)
                });
                (id, dims)
            })
            .collect();
        for (id, dims) in rendered {
            let Some(dims) = dims else { continue };
            let dtype = output_value_dtype(&graph, id);
            if let Some(Node::Value(value)) = graph.get_node_mut(id) {
                value.set_shape(dims);
                if let Some(dtype) = dtype {
                    value.set_dtype(dtype);
                }
            }
        }

        Ok((graph, warnings))
    }

    fn resolve_axes(&self, graph: &Graph) -> Result<Vec<DynamicAxis>, GeneralizeError> {
        match &self.axes {
            DynamicAxes::Axes(axes) => {
                for axis in axes {
                    let rank = graph
                        .input_ids()
                        .get(axis.input)
                        .and_then(|&id| graph.get_node(id))
                        .and_then(|node| node.as_value())
                        .and_then(|value| value.ndim());
                    match rank {
                        Some(rank) if axis.axis < rank => {}
                        _ => {
                            return Err(GeneralizeError::InvalidAxis {
                                input: axis.input,
                                axis: axis.axis,
                            });
                        }
                    }
                }
                Ok(axes.clone())
            }
            DynamicAxes::Auto => {
                let mut axes = Vec::new();
                for (index, &input_id) in graph.input_ids().iter().enumerate() {
                    let rank = graph
                        .get_node(input_id)
                        .and_then(|node| node.as_value())
                        .and_then(|value| value.ndim());
                    if rank.unwrap_or(0) >= 2 {
                        let name = if index == 0 {
                            "batch".to_string()
                        } else {
                            format!("batch_{}", index)
                        };
                        axes.push(DynamicAxis {
                            input: index,
                            axis: 0,
                            name,
                        });
                    }
                }
                Ok(axes)
            }
        }
    }
}

/// Render a symbolic tensor into exportable dimensions, substituting pinned
/// symbols and inventing fresh names for underived dimensions.
fn render_dims(
    sym: &SymTensor,
    bindings: &FxHashMap<String, i64>,
    ctx: &mut InferCtx,
) -> Vec<Dimension> {
    let dims = match sym.dims() {
        Some(dims) => dims,
        None => {
            let rank = sym.ndim().unwrap_or(0);
            (0..rank).map(|_| ctx.syms.fresh()).collect()
        }
    };

    dims.iter()
        .map(|dim| {
            let mut dim = dim.clone();
            for (name, &value) in bindings {
                dim = dim.substitute(name, value);
            }
            match dim.simplify() {
                SymExpr::Value(v) => Dimension::Fixed(v.max(0) as usize),
                SymExpr::Var(name) => Dimension::Symbolic(name.to_string()),
                expr => Dimension::Symbolic(expr.to_string()),
            }
        })
        .collect()
}

/// Determine the element type of a value from its producing operator.
fn output_value_dtype(graph: &Graph, value_id: NodeId) -> Option<DataType> {
    let existing = graph.get_node(value_id).and_then(|node| node.dtype());
    if existing.is_some() {
        return existing;
    }

    let (_, op) = graph.source_node(value_id)?;
    match op.kind() {
        // Shape extraction always yields int64 indices.
        OpKind::Shape => Some(DataType::Int64),
        _ => op
            .input_ids()
            .iter()
            .find_map(|&id| graph.get_node(id).and_then(|node| node.dtype())),
    }
}

/// Build a symbolic tensor for a constant.
///
/// Integer scalars and vectors keep their values so that reshape targets and
/// axis lists remain visible to inference.
fn const_sym_tensor(constant: &Constant) -> SymTensor {
    if let Some(values) = constant.as_i64_vec() {
        let values: Vec<SymExpr> = values.into_iter().map(SymExpr::Value).collect();
        if constant.value().ndim() == 0 {
            return SymTensor::from_scalar(values.into_iter().next().unwrap());
        }
        return SymTensor::from_vec(values);
    }
    SymTensor::from_fixed_shape(constant.shape())
}

/// Map an operator kind and its attributes to a shape inference rule.
fn infer_rule(kind: OpKind, attrs: &Attrs) -> Box<dyn InferShapes> {
    use OpKind::*;
    match kind {
        Add => Box::new(BinaryOp::arith(|a, b| a + b)),
        Sub => Box::new(BinaryOp::arith(|a, b| a - b)),
        Mul => Box::new(BinaryOp::arith(|a, b| a * b)),
        Div => Box::new(BinaryOp::arith(|a, b| a / b)),
        Pow => Box::new(BinaryOp::plain()),
        Neg | Sqrt | Erf | Sigmoid | Relu | Tanh | Softmax | Silu | Gelu => Box::new(UnaryOp),
        MatMul | FusedMatMul => Box::new(MatMulOp),
        Reshape => Box::new(ReshapeOp),
        Transpose => Box::new(TransposeOp {
            perm: attrs.get_ints("perm").map(|perm| perm.to_vec()),
        }),
        Squeeze => Box::new(SqueezeOp {
            axes: attrs.get_ints("axes").map(|axes| axes.to_vec()),
        }),
        Unsqueeze => Box::new(UnsqueezeOp {
            axes: attrs.get_ints("axes").map(|axes| axes.to_vec()).unwrap_or_default(),
        }),
        Concat => Box::new(ConcatOp {
            axis: attrs.get_int("axis").unwrap_or(0),
        }),
        Slice => Box::new(SliceOp {
            starts: attrs.get_ints("starts").map(|v| v.to_vec()).unwrap_or_default(),
            ends: attrs.get_ints("ends").map(|v| v.to_vec()).unwrap_or_default(),
            axes: attrs.get_ints("axes").map(|v| v.to_vec()),
        }),
        Shape => Box::new(ShapeOp),
        Gather => Box::new(GatherOp {
            axis: attrs.get_int("axis").unwrap_or(0),
        }),
        ReduceMean => Box::new(ReduceOp {
            axes: attrs.get_ints("axes").map(|axes| axes.to_vec()),
            keep_dims: attrs.get_int("keepdims").unwrap_or(1) != 0,
        }),
        Conv => Box::new(ConvOp {
            strides: attrs.get_ints("strides").map(|v| v.to_vec()),
            pads: attrs.get_ints("pads").map(|v| v.to_vec()),
        }),
        MaxPool => Box::new(PoolOp {
            kernel_shape: attrs
                .get_ints("kernel_shape")
                .map(|v| v.to_vec())
                .unwrap_or_default(),
            strides: attrs.get_ints("strides").map(|v| v.to_vec()),
            pads: attrs.get_ints("pads").map(|v| v.to_vec()),
        }),
    }
}
