use super::{
    ConstantFolding, DeadNodeElimination, OperatorFusion, Pass, PassOutcome, Pipeline,
    RedundantNodeElimination,
};
use crate::graph::{Graph, GraphBuilder, Node, NodeId};
use crate::ops::{Attrs, OpKind};
use crate::tensor::Tensor;
use crate::value::TensorValue;

fn run_pass(pass: &dyn Pass, graph: &Graph) -> (Graph, usize) {
    match pass.run(graph).unwrap() {
        PassOutcome::Unchanged => (graph.clone(), 0),
        PassOutcome::Changed { graph, count } => (graph, count),
    }
}

fn output_op(graph: &Graph) -> (NodeId, OpKind) {
    let (op_id, op) = graph.source_node(graph.output_ids()[0]).unwrap();
    (op_id, op.kind())
}

#[test]
fn test_fold_constant_mul() {
    // 2.0 * 3.0 collapses to the constant 6.0.
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let two = builder.add_constant(Some("two"), Tensor::from_scalar(2.0f32));
    let three = builder.add_constant(Some("three"), Tensor::from_scalar(3.0f32));
    let (_, product) = builder
        .add_op(Some("mul"), OpKind::Mul, Attrs::new(), &[two, three])
        .unwrap();
    let (_, out) = builder
        .add_op(Some("add"), OpKind::Add, Attrs::new(), &[x, product])
        .unwrap();
    builder.set_inputs(&[x]);
    builder.set_outputs(&[out]);
    let graph = builder.finish().unwrap();

    let (folded, count) = run_pass(&ConstantFolding, &graph);
    assert_eq!(count, 1);
    assert_eq!(folded.op_count(), 1);

    // The add now reads a constant 6.0 in place of the mul output.
    let (_, add_op) = folded.operators().next().unwrap();
    let product_input = add_op.input_ids()[1];
    let constant = folded.get_constant(product_input).unwrap();
    assert_eq!(constant.as_scalar_f32(), Some(6.0));
    folded.validate().unwrap();
}

#[test]
fn test_fold_chain_over_iterations() {
    // Shape(const) -> Gather -> folding collapses the whole chain.
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let weights = builder.add_constant(
        Some("weights"),
        Tensor::from_data(&[4, 2], vec![0.0f32; 8]),
    );
    let (_, shape_out) = builder
        .add_op(Some("shape"), OpKind::Shape, Attrs::new(), &[weights])
        .unwrap();
    let zero = builder.add_constant(Some("zero"), Tensor::from_scalar(0i64));
    let (_, first_dim) = builder
        .add_op(
            Some("gather"),
            OpKind::Gather,
            Attrs::new().with("axis", 0i64),
            &[shape_out, zero],
        )
        .unwrap();
    let (_, out) = builder
        .add_op(Some("add"), OpKind::Add, Attrs::new(), &[x, first_dim])
        .unwrap();
    builder.set_inputs(&[x]);
    builder.set_outputs(&[out]);
    let graph = builder.finish().unwrap();

    let (folded, count) = run_pass(&ConstantFolding, &graph);
    assert_eq!(count, 2);
    assert_eq!(folded.op_count(), 1);

    let (_, add_op) = folded.operators().next().unwrap();
    let folded_input = folded.get_constant(add_op.input_ids()[1]).unwrap();
    assert_eq!(folded_input.value(), &TensorValue::from(Tensor::from_scalar(4i64)));
}

#[test]
fn test_merge_redundant_adds() {
    // Two identical Add nodes reading the same inputs merge into one, with
    // all consumers rewired.
    let mut builder = GraphBuilder::new();
    let a = builder.add_value(Some("a"), None, None);
    let b = builder.add_value(Some("b"), None, None);
    let (_, sum_1) = builder
        .add_op(Some("add_1"), OpKind::Add, Attrs::new(), &[a, b])
        .unwrap();
    let (_, sum_2) = builder
        .add_op(Some("add_2"), OpKind::Add, Attrs::new(), &[a, b])
        .unwrap();
    let (_, out) = builder
        .add_op(Some("mul"), OpKind::Mul, Attrs::new(), &[sum_1, sum_2])
        .unwrap();
    builder.set_inputs(&[a, b]);
    builder.set_outputs(&[out]);
    let graph = builder.finish().unwrap();

    let (merged, count) = run_pass(&RedundantNodeElimination, &graph);
    assert_eq!(count, 1);
    assert_eq!(merged.op_count(), 2);

    // Both mul inputs now read the surviving add's output.
    let (_, mul_op) = merged.source_node(merged.output_ids()[0]).unwrap();
    assert_eq!(mul_op.input_ids()[0], mul_op.input_ids()[1]);
    merged.validate().unwrap();
}

#[test]
fn test_different_attrs_not_merged() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let (_, soft_1) = builder
        .add_op(
            Some("soft_1"),
            OpKind::Softmax,
            Attrs::new().with("axis", -1i64),
            &[x],
        )
        .unwrap();
    let (_, soft_2) = builder
        .add_op(
            Some("soft_2"),
            OpKind::Softmax,
            Attrs::new().with("axis", 0i64),
            &[x],
        )
        .unwrap();
    let (_, out) = builder
        .add_op(Some("add"), OpKind::Add, Attrs::new(), &[soft_1, soft_2])
        .unwrap();
    builder.set_inputs(&[x]);
    builder.set_outputs(&[out]);
    let graph = builder.finish().unwrap();

    let (_, count) = run_pass(&RedundantNodeElimination, &graph);
    assert_eq!(count, 0);
}

fn silu_graph() -> Graph {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let (_, sig) = builder
        .add_op(Some("sigmoid"), OpKind::Sigmoid, Attrs::new(), &[x])
        .unwrap();
    let (_, out) = builder
        .add_op(Some("mul"), OpKind::Mul, Attrs::new(), &[x, sig])
        .unwrap();
    builder.set_inputs(&[x]);
    builder.set_outputs(&[out]);
    builder.finish().unwrap()
}

#[test]
fn test_fuse_silu() {
    let graph = silu_graph();
    let (fused, count) = run_pass(&OperatorFusion::standard(), &graph);
    assert_eq!(count, 1);
    assert_eq!(fused.op_count(), 1);
    assert_eq!(output_op(&fused).1, OpKind::Silu);
    fused.validate().unwrap();
}

#[test]
fn test_fuse_gelu() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let sqrt_2 = builder.add_constant(
        Some("sqrt_2"),
        Tensor::from_scalar(std::f32::consts::SQRT_2),
    );
    let one = builder.add_constant(Some("one"), Tensor::from_scalar(1.0f32));
    let half = builder.add_constant(Some("half"), Tensor::from_scalar(0.5f32));
    let (_, scaled) = builder
        .add_op(Some("div"), OpKind::Div, Attrs::new(), &[x, sqrt_2])
        .unwrap();
    let (_, erf) = builder
        .add_op(Some("erf"), OpKind::Erf, Attrs::new(), &[scaled])
        .unwrap();
    let (_, shifted) = builder
        .add_op(Some("add"), OpKind::Add, Attrs::new(), &[erf, one])
        .unwrap();
    let (_, gated) = builder
        .add_op(Some("mul_1"), OpKind::Mul, Attrs::new(), &[x, shifted])
        .unwrap();
    let (_, out) = builder
        .add_op(Some("mul_2"), OpKind::Mul, Attrs::new(), &[gated, half])
        .unwrap();
    builder.set_inputs(&[x]);
    builder.set_outputs(&[out]);
    let graph = builder.finish().unwrap();

    let (fused, count) = run_pass(&OperatorFusion::standard(), &graph);
    assert_eq!(count, 1);
    assert_eq!(output_op(&fused).1, OpKind::Gelu);
    // The whole decomposed subgraph is gone.
    assert_eq!(fused.op_count(), 1);
    fused.validate().unwrap();
}

#[test]
fn test_fuse_matmul_add() {
    let mut builder = GraphBuilder::new();
    let a = builder.add_value(Some("a"), None, None);
    let b = builder.add_value(Some("b"), None, None);
    let bias = builder.add_constant(Some("bias"), Tensor::from_vec(vec![1.0f32, 2.0, 3.0]));
    let (_, mm) = builder
        .add_op(Some("matmul"), OpKind::MatMul, Attrs::new(), &[a, b])
        .unwrap();
    let (_, out) = builder
        .add_op(Some("add"), OpKind::Add, Attrs::new(), &[mm, bias])
        .unwrap();
    builder.set_inputs(&[a, b]);
    builder.set_outputs(&[out]);
    let graph = builder.finish().unwrap();

    let (fused, count) = run_pass(&OperatorFusion::standard(), &graph);
    assert_eq!(count, 1);
    let (_, op) = fused.source_node(fused.output_ids()[0]).unwrap();
    assert_eq!(op.kind(), OpKind::FusedMatMul);
    assert_eq!(op.input_ids().len(), 3);
    fused.validate().unwrap();
}

#[test]
fn test_no_fusion_when_intermediate_reused() {
    // A second consumer of the sigmoid output must block the Silu fusion.
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let (_, sig) = builder
        .add_op(Some("sigmoid"), OpKind::Sigmoid, Attrs::new(), &[x])
        .unwrap();
    let (_, silu_out) = builder
        .add_op(Some("mul"), OpKind::Mul, Attrs::new(), &[x, sig])
        .unwrap();
    let (_, reused) = builder
        .add_op(Some("neg"), OpKind::Neg, Attrs::new(), &[sig])
        .unwrap();
    let (_, out) = builder
        .add_op(Some("add"), OpKind::Add, Attrs::new(), &[silu_out, reused])
        .unwrap();
    builder.set_inputs(&[x]);
    builder.set_outputs(&[out]);
    let graph = builder.finish().unwrap();

    let (_, count) = run_pass(&OperatorFusion::standard(), &graph);
    assert_eq!(count, 0);
}

#[test]
fn test_no_fusion_when_intermediate_is_graph_output() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let (_, sig) = builder
        .add_op(Some("sigmoid"), OpKind::Sigmoid, Attrs::new(), &[x])
        .unwrap();
    let (_, silu_out) = builder
        .add_op(Some("mul"), OpKind::Mul, Attrs::new(), &[x, sig])
        .unwrap();
    builder.set_inputs(&[x]);
    builder.set_outputs(&[silu_out, sig]);
    let graph = builder.finish().unwrap();

    let (_, count) = run_pass(&OperatorFusion::standard(), &graph);
    assert_eq!(count, 0);
}

#[test]
fn test_dead_node_elimination() {
    let mut builder = GraphBuilder::new();
    let x = builder.add_value(Some("x"), None, None);
    let (_, live) = builder
        .add_op(Some("live"), OpKind::Relu, Attrs::new(), &[x])
        .unwrap();
    let (_, dead_out) = builder
        .add_op(Some("dead"), OpKind::Neg, Attrs::new(), &[x])
        .unwrap();
    let (_, deader) = builder
        .add_op(Some("deader"), OpKind::Relu, Attrs::new(), &[dead_out])
        .unwrap();
    let _ = deader;
    builder.set_inputs(&[x]);
    builder.set_outputs(&[live]);
    let graph = builder.finish().unwrap();

    let (pruned, count) = run_pass(&DeadNodeElimination, &graph);
    assert_eq!(count, 2);
    assert_eq!(pruned.op_count(), 1);
    pruned.validate().unwrap();
}

#[test]
fn test_pipeline_reaches_fixpoint_and_is_idempotent() {
    let graph = silu_graph();
    let pipeline = Pipeline::standard(100);

    let (simplified, stats) = pipeline.run(graph).unwrap();
    assert!(stats.converged);
    let total: usize = stats.changes.iter().map(|(_, count)| count).sum();
    assert!(total > 0);

    // Running again on the fixpoint graph changes nothing.
    let (again, stats) = pipeline.run(simplified.clone()).unwrap();
    let total: usize = stats.changes.iter().map(|(_, count)| count).sum();
    assert_eq!(total, 0);
    assert_eq!(stats.iterations, 1);
    assert_eq!(again.op_count(), simplified.op_count());
}

#[test]
fn test_pipeline_iteration_cap() {
    let graph = silu_graph();
    // A cap of 1 is reached before convergence can be confirmed: the first
    // iteration applies the fusion, and no iteration is left to observe the
    // fixpoint.
    let pipeline = Pipeline::standard(1);
    let (simplified, stats) = pipeline.run(graph).unwrap();
    assert!(!stats.converged);
    assert_eq!(stats.iterations, 1);
    assert_eq!(simplified.op_count(), 1);
}

#[test]
fn test_pipeline_determinism() {
    let build = || {
        let mut builder = GraphBuilder::new();
        let x = builder.add_value(Some("x"), None, None);
        let two = builder.add_constant(Some("two"), Tensor::from_scalar(2.0f32));
        let three = builder.add_constant(Some("three"), Tensor::from_scalar(3.0f32));
        let (_, product) = builder
            .add_op(Some("mul"), OpKind::Mul, Attrs::new(), &[two, three])
            .unwrap();
        let (_, scaled) = builder
            .add_op(Some("scale"), OpKind::Mul, Attrs::new(), &[x, product])
            .unwrap();
        let (_, sig) = builder
            .add_op(Some("sigmoid"), OpKind::Sigmoid, Attrs::new(), &[scaled])
            .unwrap();
        let (_, out) = builder
            .add_op(Some("silu"), OpKind::Mul, Attrs::new(), &[scaled, sig])
            .unwrap();
        builder.set_inputs(&[x]);
        builder.set_outputs(&[out]);
        builder.finish().unwrap()
    };

    let pipeline = Pipeline::standard(100);
    let (first, _) = pipeline.run(build()).unwrap();
    let (second, _) = pipeline.run(build()).unwrap();

    // Node-for-node identical output, including IDs and ordering.
    assert_eq!(first.node_count(), second.node_count());
    for ((id_a, node_a), (id_b, node_b)) in first.iter().zip(second.iter()) {
        assert_eq!(id_a, id_b);
        assert_eq!(node_a.name(), node_b.name());
        match (node_a, node_b) {
            (Node::Operator(a), Node::Operator(b)) => {
                assert_eq!(a.kind(), b.kind());
                assert_eq!(a.input_ids(), b.input_ids());
                assert_eq!(a.output_ids(), b.output_ids());
            }
            (Node::Constant(a), Node::Constant(b)) => assert_eq!(a.value(), b.value()),
            (Node::Value(a), Node::Value(b)) => assert_eq!(a.shape(), b.shape()),
            _ => panic!("node kinds differ"),
        }
    }
}
