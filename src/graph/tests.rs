use super::{Dimension, GraphBuilder, MalformedGraphError, Node, NodeId};
use crate::ops::{AttrKind, Attrs, OpKind};
use crate::tensor::Tensor;
use crate::value::DataType;

/// Build the graph for `Relu(Conv(x, w))`, a typical small model prefix.
fn conv_relu_graph() -> super::Graph {
    let mut builder = GraphBuilder::new();
    let input = builder.add_value(
        Some("input"),
        Some(DataType::Float32),
        Some(vec![
            Dimension::Fixed(1),
            Dimension::Fixed(3),
            Dimension::Fixed(8),
            Dimension::Fixed(8),
        ]),
    );
    let weight = builder.add_constant(
        Some("weight"),
        Tensor::from_data(&[4, 3, 1, 1], vec![0.5f32; 12]),
    );
    let (_, conv_out) = builder
        .add_op(Some("conv"), OpKind::Conv, Attrs::new(), &[input, weight])
        .unwrap();
    let (_, relu_out) = builder
        .add_op(Some("relu"), OpKind::Relu, Attrs::new(), &[conv_out])
        .unwrap();
    builder.set_inputs(&[input]);
    builder.set_outputs(&[relu_out]);
    builder.finish().unwrap()
}

#[test]
fn test_build_and_traverse() {
    let graph = conv_relu_graph();
    assert_eq!(graph.op_count(), 2);
    assert_eq!(graph.constant_count(), 1);
    assert_eq!(graph.total_params(), 12);

    let plan = graph
        .execution_plan(graph.input_ids(), graph.output_ids())
        .unwrap();
    let kinds: Vec<OpKind> = plan
        .iter()
        .map(|&id| graph.get_node(id).unwrap().as_operator().unwrap().kind())
        .collect();
    assert_eq!(kinds, [OpKind::Conv, OpKind::Relu]);
}

#[test]
fn test_node_names() {
    let graph = conv_relu_graph();
    let (conv_id, _) = graph.operators().next().unwrap();
    assert_eq!(graph.node_name(conv_id), "conv");

    let missing = NodeId::from_u32(1000);
    assert_eq!(graph.node_name(missing), "[ID: 1000]");
}

#[test]
fn test_source_and_consumers() {
    let graph = conv_relu_graph();
    let output_id = graph.output_ids()[0];
    let (_, relu_op) = graph.source_node(output_id).unwrap();
    assert_eq!(relu_op.kind(), OpKind::Relu);

    let consumers = graph.consumer_map();
    let conv_out = relu_op.input_ids()[0];
    assert_eq!(consumers.get(&conv_out).map(|ops| ops.len()), Some(1));
}

#[test]
fn test_arity_mismatch_rejected() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let result = builder.add_op(Some("add"), OpKind::Add, Attrs::new(), &[x]);
    assert_eq!(
        result.err(),
        Some(MalformedGraphError::ArityMismatch {
            op: "add".to_string(),
            kind: OpKind::Add,
            expected_min: 2,
            expected_max: 2,
            actual: 1,
        })
    );
}

#[test]
fn test_attr_schema_enforced() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);

    // Required attribute missing.
    let result = builder.add_op(Some("softmax"), OpKind::Softmax, Attrs::new(), &[x]);
    assert_eq!(
        result.err(),
        Some(MalformedGraphError::MissingAttr {
            op: "softmax".to_string(),
            attr: "axis",
        })
    );

    // Attribute with the wrong type.
    let attrs = Attrs::new().with("axis", vec![1i64]);
    let result = builder.add_op(Some("softmax"), OpKind::Softmax, attrs, &[x]);
    assert_eq!(
        result.err(),
        Some(MalformedGraphError::AttrTypeMismatch {
            op: "softmax".to_string(),
            attr: "axis".to_string(),
            expected: AttrKind::Int,
        })
    );

    // Attribute not in the schema.
    let attrs = Attrs::new().with("axis", 1i64).with("beta", 2.0f32);
    let result = builder.add_op(Some("softmax"), OpKind::Softmax, attrs, &[x]);
    assert_eq!(
        result.err(),
        Some(MalformedGraphError::UnknownAttr {
            op: "softmax".to_string(),
            attr: "beta".to_string(),
        })
    );
}

#[test]
fn test_unknown_input_rejected() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let bogus = NodeId::from_u32(99);
    let result = builder.add_op(Some("add"), OpKind::Add, Attrs::new(), &[x, bogus]);
    assert_eq!(
        result.err(),
        Some(MalformedGraphError::InvalidNodeId {
            op: "add".to_string(),
            id: 99,
        })
    );
}

#[test]
fn test_operator_as_input_rejected() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let (relu_op, _) = builder
        .add_op(Some("relu"), OpKind::Relu, Attrs::new(), &[x])
        .unwrap();
    let result = builder.add_op(Some("neg"), OpKind::Neg, Attrs::new(), &[relu_op]);
    assert!(matches!(
        result,
        Err(MalformedGraphError::InputIsOperator { .. })
    ));
}

#[test]
fn test_finish_requires_outputs() {
    let mut builder = GraphBuilder::new();
    builder.add_value(Some("x"), None, None);
    assert_eq!(builder.finish().err(), Some(MalformedGraphError::NoOutputs));
}

#[test]
fn test_validate_detects_cycle() {
    // The builder cannot create cycles, but a decoded graph could; assemble
    // one through the raw interface.
    let mut graph = super::Graph::new();
    let a = graph.add_value(Some("a"), None, None);
    let b = graph.add_value(Some("b"), None, None);
    graph.add_op(Some("op1"), OpKind::Neg, Attrs::new(), &[a], &[b]);
    graph.add_op(Some("op2"), OpKind::Neg, Attrs::new(), &[b], &[a]);
    graph.set_output_ids(&[b]);

    let result = graph.validate();
    assert!(matches!(result, Err(MalformedGraphError::Cycle { .. })));
}

#[test]
fn test_validate_detects_dangling_value() {
    let mut graph = super::Graph::new();
    let orphan = graph.add_value(Some("orphan"), None, None);
    let out = graph.add_value(Some("out"), None, None);
    graph.add_op(Some("relu"), OpKind::Relu, Attrs::new(), &[orphan], &[out]);
    graph.set_output_ids(&[out]);

    let result = graph.validate();
    assert!(matches!(
        result,
        Err(MalformedGraphError::DanglingValue { .. })
    ));
}

#[test]
fn test_validate_detects_duplicate_producer() {
    let mut graph = super::Graph::new();
    let x = graph.add_value(Some("x"), None, None);
    let out = graph.add_value(Some("out"), None, None);
    graph.add_op(Some("op1"), OpKind::Neg, Attrs::new(), &[x], &[out]);
    graph.add_op(Some("op2"), OpKind::Relu, Attrs::new(), &[x], &[out]);
    graph.set_input_ids(&[x]);
    graph.set_output_ids(&[out]);

    let result = graph.validate();
    assert_eq!(
        result,
        Err(MalformedGraphError::DuplicateProducer {
            value: "out".to_string(),
        })
    );
}

#[test]
fn test_plan_order_breaks_ties_by_insertion() {
    // Two independent chains consumed by one operator: the plan must list
    // the chains in insertion order regardless of the consumer's input
    // order.
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let (_, a_out) = builder
        .add_op(Some("a"), OpKind::Relu, Attrs::new(), &[x])
        .unwrap();
    let (_, b_out) = builder
        .add_op(Some("b"), OpKind::Neg, Attrs::new(), &[x])
        .unwrap();
    let (_, sum) = builder
        .add_op(Some("sum"), OpKind::Add, Attrs::new(), &[b_out, a_out])
        .unwrap();
    builder.set_inputs(&[x]);
    builder.set_outputs(&[sum]);
    let graph = builder.finish().unwrap();

    let plan = graph
        .execution_plan(graph.input_ids(), graph.output_ids())
        .unwrap();
    let names: Vec<String> = plan.iter().map(|&id| graph.node_name(id)).collect();
    // Depth-first from the consumer's inputs: "b" is consumed first.
    assert_eq!(names, ["b", "a", "sum"]);

    // The same plan is produced on repeated runs.
    let plan_again = graph
        .execution_plan(graph.input_ids(), graph.output_ids())
        .unwrap();
    assert_eq!(plan, plan_again);
}

#[test]
fn test_node_shape_and_dtype() {
    let graph = conv_relu_graph();
    let input = graph.get_node(graph.input_ids()[0]).unwrap();
    assert_eq!(input.dtype(), Some(DataType::Float32));
    assert_eq!(
        input.shape(),
        Some(vec![
            Dimension::Fixed(1),
            Dimension::Fixed(3),
            Dimension::Fixed(8),
            Dimension::Fixed(8),
        ])
    );

    let weight = graph
        .iter()
        .find_map(|(_, node)| node.as_constant())
        .unwrap();
    assert_eq!(weight.dtype(), DataType::Float32);
    assert_eq!(weight.shape(), &[4, 3, 1, 1]);

    let (_, conv_op) = graph.operators().next().unwrap();
    let conv_node = graph.get_node(graph.source_node(conv_op.output_ids()[0]).unwrap().0);
    assert!(matches!(conv_node, Some(Node::Operator(_))));
}
