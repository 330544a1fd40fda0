//! Fusions of adjacent-node patterns into single operators.

use rustc_hash::FxHashSet;

use super::pattern::{Match, Pattern};
use super::{all_op_outputs, GraphEditor, OptimizeError, Pass, PassOutcome};
use crate::graph::{Graph, NodeId};
use crate::ops::{Attrs, OpKind};

/// A fused operator that replaces a matched subgraph.
struct Fusion {
    kind: OpKind,
    attrs: Attrs,
    inputs: Vec<NodeId>,
}

/// One entry in the fusion table: a pattern and a constructor for the
/// replacement operator.
trait FusionRule {
    /// The subgraph pattern, rooted at the subgraph's final operator.
    fn pattern(&self) -> Pattern;

    /// Build the fused operator for a successful match.
    ///
    /// Returns `None` if the match fails requirements that the pattern
    /// cannot express.
    fn maybe_fuse(&self, pat_match: &Match, graph: &Graph) -> Option<Fusion>;
}

/// Fuse `x * Sigmoid(x)` into `Silu(x)`.
struct SiluFusion;

impl FusionRule for SiluFusion {
    fn pattern(&self) -> Pattern {
        let x = Pattern::sym("x");
        Pattern::binary(
            OpKind::Mul,
            x.clone(),
            Pattern::unary(OpKind::Sigmoid, x),
        )
    }

    fn maybe_fuse(&self, pat_match: &Match, _graph: &Graph) -> Option<Fusion> {
        Some(Fusion {
            kind: OpKind::Silu,
            attrs: Attrs::new(),
            inputs: vec![pat_match.node_id("x")?],
        })
    }
}

/// Fuse `x * (Erf(x / sqrt(2)) + 1) * 0.5` into `Gelu(x)`.
///
/// The grouping matches how frameworks emit the exact GELU: the final
/// multiplication by 0.5 is applied last.
struct GeluFusion;

impl FusionRule for GeluFusion {
    fn pattern(&self) -> Pattern {
        let x = Pattern::sym("x");
        let erf = Pattern::unary(
            OpKind::Erf,
            Pattern::binary(
                OpKind::Div,
                x.clone(),
                Pattern::scalar(std::f32::consts::SQRT_2),
            ),
        );
        Pattern::binary(
            OpKind::Mul,
            Pattern::binary(
                OpKind::Mul,
                x,
                Pattern::binary(OpKind::Add, erf, Pattern::scalar(1.0)),
            ),
            Pattern::scalar(0.5),
        )
    }

    fn maybe_fuse(&self, pat_match: &Match, _graph: &Graph) -> Option<Fusion> {
        Some(Fusion {
            kind: OpKind::Gelu,
            attrs: Attrs::new(),
            inputs: vec![pat_match.node_id("x")?],
        })
    }
}

/// Fuse `MatMul(a, b) + bias` into `FusedMatMul(a, b, bias)` when the bias
/// is a constant vector.
struct MatMulAddFusion;

impl FusionRule for MatMulAddFusion {
    fn pattern(&self) -> Pattern {
        Pattern::binary(
            OpKind::Add,
            Pattern::binary(OpKind::MatMul, Pattern::sym("a"), Pattern::sym("b")),
            Pattern::const_sym("bias"),
        )
    }

    fn maybe_fuse(&self, pat_match: &Match, graph: &Graph) -> Option<Fusion> {
        let bias = pat_match.node_id("bias")?;
        let is_vector = graph
            .get_constant(bias)
            .map(|constant| constant.shape().len() == 1)
            .unwrap_or(false);
        if !is_vector {
            return None;
        }

        Some(Fusion {
            kind: OpKind::FusedMatMul,
            attrs: Attrs::new(),
            inputs: vec![
                pat_match.node_id("a")?,
                pat_match.node_id("b")?,
                bias,
            ],
        })
    }
}

/// Replace matched subgraph patterns with fused operators.
///
/// Rules are tried in order against each operator; each operator is visited
/// once per pass, so chained fusions land in later pipeline iterations.
pub struct OperatorFusion {
    rules: Vec<Box<dyn FusionRule>>,
}

impl OperatorFusion {
    /// The built-in fusion table.
    pub fn standard() -> OperatorFusion {
        OperatorFusion {
            rules: vec![
                Box::new(SiluFusion),
                Box::new(GeluFusion),
                Box::new(MatMulAddFusion),
            ],
        }
    }
}

impl Pass for OperatorFusion {
    fn name(&self) -> &'static str {
        "fusion"
    }

    fn run(&self, graph: &Graph) -> Result<PassOutcome, OptimizeError> {
        let plan = graph.execution_plan(graph.input_ids(), &all_op_outputs(graph))?;
        let mut editor = GraphEditor::from_graph(graph);
        let mut fused = 0;

        for op_id in plan {
            if editor.is_removed(op_id) {
                continue;
            }

            let matched = {
                let graph = editor.graph();
                graph
                    .get_node(op_id)
                    .and_then(|node| node.as_operator())
                    .and_then(|op| {
                        self.rules.iter().find_map(|rule| {
                            let pat_match = rule.pattern().test(op, graph)?;
                            let fusion = rule.maybe_fuse(&pat_match, graph)?;
                            Some((
                                fusion,
                                op.output_ids().to_vec(),
                                op.name().map(|name| name.to_string()),
                            ))
                        })
                    })
            };
            let Some((fusion, outputs, name)) = matched else {
                continue;
            };

            // Operators between the fusion's inputs and the matched root.
            let mut boundary = fusion.inputs.clone();
            boundary.sort();
            boundary.dedup();
            let Ok(interior) = editor.graph().execution_plan(&boundary, &outputs) else {
                continue;
            };

            // Fusing must not discard an intermediate value that anything
            // outside the subgraph still reads.
            if subgraph_output_escapes(&editor, &interior, &outputs) {
                continue;
            }

            for &interior_op in &interior {
                editor.remove_op(interior_op);
            }
            editor.add_op(
                name.as_deref(),
                fusion.kind,
                fusion.attrs,
                &fusion.inputs,
                &outputs,
            );
            fused += 1;
        }

        if fused == 0 {
            Ok(PassOutcome::Unchanged)
        } else {
            Ok(PassOutcome::Changed {
                graph: editor.finish(),
                count: fused,
            })
        }
    }
}

/// Check whether any output of the subgraph's interior operators is used
/// outside the subgraph, excluding the subgraph's own final outputs.
fn subgraph_output_escapes(
    editor: &GraphEditor,
    interior: &[NodeId],
    final_outputs: &[NodeId],
) -> bool {
    let interior_set: FxHashSet<NodeId> = interior.iter().copied().collect();
    let graph_outputs: FxHashSet<NodeId> = editor.graph().output_ids().iter().copied().collect();

    for &op_id in interior {
        let Some(op) = editor.graph().get_node(op_id).and_then(|n| n.as_operator()) else {
            continue;
        };
        for &output_id in op.output_ids() {
            if final_outputs.contains(&output_id) {
                continue;
            }
            if graph_outputs.contains(&output_id) {
                return true;
            }
            if editor
                .value_consumers(output_id)
                .iter()
                .any(|consumer| !interior_set.contains(consumer))
            {
                return true;
            }
        }
    }
    false
}
