//! graphport is a model graph export and simplification engine.
//!
//! It takes a trained, in-memory computation graph, handed over by a
//! model-loading collaborator as a populated [`Graph`], and turns it into a
//! self-describing, versioned, portable artifact. Along the way it can:
//!
//! - **Generalize shapes**: replace the concrete dimensions a model was
//!   traced with by named symbolic axes (eg. turn `[1, 3, 640, 640]` into
//!   `["batch", 3, 640, 640]`), propagating the symbols through every
//!   operator so the exported graph is valid for all input sizes.
//! - **Simplify**: run a fixpoint pipeline of rewrite passes (constant
//!   folding, redundant-node elimination, operator fusion, dead-node
//!   elimination) that preserves numeric semantics while shrinking the
//!   graph.
//! - **Encode**: serialize the result into a `.gport` binary container or a
//!   JSON interchange document, both carrying the schema version, operator
//!   set version, constant data and symbolic axis names verbatim.
//!
//! The basic workflow:
//!
//! ```no_run
//! use graphport::{
//!     Attrs, DynamicAxes, DynamicAxis, ExportConfig, Exporter, GraphBuilder, OpKind, Tensor,
//! };
//!
//! // A collaborator hands over a populated graph. Here we build a tiny one.
//! let mut builder = GraphBuilder::new();
//! let x = builder.add_value(Some("x"), None, None);
//! let two = builder.add_constant(Some("two"), Tensor::from_scalar(2.0f32));
//! let (_, y) = builder.add_op(Some("scale"), OpKind::Mul, Attrs::new(), &[x, two])?;
//! builder.set_inputs(&[x]);
//! builder.set_outputs(&[y]);
//! let graph = builder.finish()?;
//!
//! let config = ExportConfig {
//!     dynamic_axes: Some(DynamicAxes::Axes(vec![DynamicAxis::new(0, 0, "batch")])),
//!     ..ExportConfig::default()
//! };
//! let report = Exporter::new(config).export(&graph, "model.gport".as_ref())?;
//! println!("exported {} operators", report.nodes_after);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Exports are pure until the final write: every stage treats its input
//! graph as immutable and produces a new graph, so independent export
//! requests over one source graph can run in parallel (see
//! [`export_all`]).

pub mod encode;
pub mod generalize;
mod graph;
pub mod ops;
pub mod optimize;
mod tensor;
mod value;

mod export;

pub use encode::{decode, encode, DecodeError, DecodedModel, EncodeError, TargetFormat};
pub use export::{export_all, ExportConfig, ExportError, ExportJob, ExportReport, Exporter};
pub use generalize::{DynamicAxes, DynamicAxis, ShapeGeneralizer, ShapePolicy};
pub use graph::{
    Constant, Dimension, Graph, GraphBuilder, MalformedGraphError, Node, NodeId, OperatorNode,
    ValueNode,
};
pub use ops::{AttrValue, Attrs, OpKind};
pub use tensor::Tensor;
pub use value::{DataType, TensorValue};
