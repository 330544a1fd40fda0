//! Declarative subgraph patterns used by the fusion pass.

use crate::graph::{Graph, Node, NodeId, OperatorNode};
use crate::ops::OpKind;

/// Tracks an association between named symbols in a pattern and the node
/// IDs they have been resolved to.
struct SymbolMap {
    // Modified only by extending and truncating, so matching can backtrack.
    symbols: Vec<(&'static str, NodeId)>,
    checkpoints: Vec<usize>,
}

impl SymbolMap {
    fn new() -> SymbolMap {
        SymbolMap {
            symbols: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    fn checkpoint(&mut self) {
        self.checkpoints.push(self.symbols.len());
    }

    fn revert(&mut self) {
        if let Some(checkpoint) = self.checkpoints.pop() {
            self.symbols.truncate(checkpoint);
        }
    }

    fn add(&mut self, name: &'static str, node_id: NodeId) {
        self.symbols.push((name, node_id));
    }

    fn find(&self, name: &str) -> Option<NodeId> {
        self.symbols
            .iter()
            .find_map(|(sym, id)| (*sym == name).then_some(*id))
    }
}

/// The result of matching a [`Pattern`] against a graph node.
pub(crate) struct Match {
    symbols: SymbolMap,
}

impl Match {
    /// Return the node ID a named symbol was resolved to.
    pub(crate) fn node_id(&self, name: &str) -> Option<NodeId> {
        self.symbols.find(name)
    }
}

/// Absolute tolerance for matching float constants against constant
/// patterns.
const CONST_TOLERANCE: f32 = 1e-4;

/// Specifies a pattern for a subgraph within a [`Graph`].
///
/// A pattern node either matches an operator of a given kind (descending
/// into the producers of its inputs), a scalar float constant, or a free
/// symbol. All occurrences of the same symbol must resolve to the same
/// graph node.
#[derive(Clone, Debug)]
pub(crate) enum Pattern {
    Operator {
        kind: OpKind,
        inputs: Vec<Pattern>,
    },
    Constant(f32),
    Symbol {
        name: &'static str,
        constant: bool,
    },
}

impl Pattern {
    pub(crate) fn unary(kind: OpKind, input: Pattern) -> Pattern {
        Pattern::Operator {
            kind,
            inputs: vec![input],
        }
    }

    pub(crate) fn binary(kind: OpKind, lhs: Pattern, rhs: Pattern) -> Pattern {
        Pattern::Operator {
            kind,
            inputs: vec![lhs, rhs],
        }
    }

    /// A pattern that matches any value or constant.
    pub(crate) fn sym(name: &'static str) -> Pattern {
        Pattern::Symbol {
            name,
            constant: false,
        }
    }

    /// A pattern that matches any constant.
    pub(crate) fn const_sym(name: &'static str) -> Pattern {
        Pattern::Symbol {
            name,
            constant: true,
        }
    }

    /// A pattern that matches a scalar float constant with the given value.
    pub(crate) fn scalar(value: f32) -> Pattern {
        Pattern::Constant(value)
    }

    /// Test whether the subgraph rooted at `op` matches this pattern.
    pub(crate) fn test(&self, op: &OperatorNode, graph: &Graph) -> Option<Match> {
        let mut symbols = SymbolMap::new();
        if self.match_op(op, graph, &mut symbols) {
            Some(Match { symbols })
        } else {
            None
        }
    }

    fn match_op(&self, op: &OperatorNode, graph: &Graph, symbols: &mut SymbolMap) -> bool {
        let Pattern::Operator { kind, inputs } = self else {
            return false;
        };
        if op.kind() != *kind || inputs.len() != op.input_ids().len() {
            return false;
        }

        // For commutative operators, try the pattern both ways around.
        if let (true, [pat_a, pat_b], [input_a, input_b]) =
            (kind.is_commutative(), &inputs[..], op.input_ids())
        {
            symbols.checkpoint();
            if pat_a.match_value(*input_a, graph, symbols)
                && pat_b.match_value(*input_b, graph, symbols)
            {
                return true;
            }
            symbols.revert();

            pat_b.match_value(*input_a, graph, symbols)
                && pat_a.match_value(*input_b, graph, symbols)
        } else {
            inputs
                .iter()
                .zip(op.input_ids())
                .all(|(pattern, &input_id)| pattern.match_value(input_id, graph, symbols))
        }
    }

    fn match_value(&self, value_id: NodeId, graph: &Graph, symbols: &mut SymbolMap) -> bool {
        match (self, graph.get_node(value_id)) {
            // An operator pattern matches a value produced by a matching
            // operator.
            (Pattern::Operator { .. }, Some(Node::Value(_))) => {
                let Some((_, source_op)) = graph.source_node(value_id) else {
                    return false;
                };
                self.match_op(source_op, graph, symbols)
            }
            (Pattern::Constant(expected), Some(Node::Constant(constant))) => constant
                .as_scalar_f32()
                .is_some_and(|value| (value - expected).abs() <= CONST_TOLERANCE),
            (Pattern::Symbol { name, constant }, Some(node)) => {
                match node {
                    Node::Constant(_) => {}
                    Node::Value(_) if !constant => {}
                    _ => return false,
                }

                // A symbol seen before must resolve to the same node.
                if let Some(resolved) = symbols.find(name) {
                    resolved == value_id
                } else {
                    symbols.add(name, value_id);
                    true
                }
            }
            _ => false,
        }
    }
}
