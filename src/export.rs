//! The export orchestrator: generalize, simplify, encode, verify, write.

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::encode::{self, DecodedModel, EncodeError, TargetFormat, DEFAULT_OPSET};
use crate::generalize::{DynamicAxes, GeneralizeError, ShapeGeneralizer, ShapePolicy};
use crate::graph::{Graph, MalformedGraphError, Node};
use crate::optimize::{OptimizeError, Pipeline};

/// Options controlling one export request.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    /// Input axes to generalize, or `None` to export with the traced
    /// (fully fixed) shapes.
    pub dynamic_axes: Option<DynamicAxes>,

    /// Whether to run the simplification pipeline.
    pub simplify: bool,

    /// Iteration budget for the simplification fixpoint loop.
    pub max_fixpoint_iterations: usize,

    /// Container format to emit.
    pub target_format: TargetFormat,

    /// Operator-set version to emit.
    pub opset_version: u32,

    /// Behavior when an output shape cannot be derived symbolically.
    pub shape_policy: ShapePolicy,
}

impl Default for ExportConfig {
    fn default() -> ExportConfig {
        ExportConfig {
            dynamic_axes: None,
            simplify: true,
            max_fixpoint_iterations: 100,
            target_format: TargetFormat::Binary,
            opset_version: DEFAULT_OPSET,
            shape_policy: ShapePolicy::Degrade,
        }
    }
}

/// Structured summary of a completed export.
#[derive(Clone, Debug, Serialize)]
pub struct ExportReport {
    /// Operator count before simplification.
    pub nodes_before: usize,

    /// Operator count in the exported graph.
    pub nodes_after: usize,

    /// Rewrites applied per pass, in pass order.
    pub pass_changes: Vec<(String, usize)>,

    /// Simplification iterations executed.
    pub fixpoint_iterations: usize,

    /// Total parameter count of the exported graph.
    pub parameters: usize,

    /// Size of the serialized artifact in bytes.
    pub artifact_bytes: usize,

    /// Non-fatal conditions encountered (degraded shapes, fixpoint budget
    /// exhaustion).
    pub warnings: Vec<String>,
}

/// Errors that abort an export. Each maps to one stage of the pipeline.
#[derive(Debug)]
pub enum ExportError {
    /// The input graph violates a structural invariant.
    MalformedGraph(MalformedGraphError),

    /// Shape generalization failed; the user must adjust the dynamic-axis
    /// configuration.
    DynamicAxes(GeneralizeError),

    /// A simplification pass failed.
    Optimize(OptimizeError),

    /// The target format cannot represent the graph.
    Encode(EncodeError),

    /// The encoded artifact did not survive the round-trip check.
    Verify(String),

    /// Writing the artifact to storage failed. No partial artifact is left
    /// behind.
    Io(std::io::Error),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedGraph(err) => write!(f, "graph validation failed: {}", err),
            Self::DynamicAxes(err) => write!(f, "shape generalization failed: {}", err),
            Self::Optimize(err) => write!(f, "simplification failed: {}", err),
            Self::Encode(err) => write!(f, "encoding failed: {}", err),
            Self::Verify(msg) => write!(f, "artifact verification failed: {}", msg),
            Self::Io(err) => write!(f, "writing artifact failed: {}", err),
        }
    }
}

impl Error for ExportError {}

impl From<MalformedGraphError> for ExportError {
    fn from(err: MalformedGraphError) -> ExportError {
        ExportError::MalformedGraph(err)
    }
}

impl From<GeneralizeError> for ExportError {
    fn from(err: GeneralizeError) -> ExportError {
        ExportError::DynamicAxes(err)
    }
}

impl From<OptimizeError> for ExportError {
    fn from(err: OptimizeError) -> ExportError {
        ExportError::Optimize(err)
    }
}

impl From<EncodeError> for ExportError {
    fn from(err: EncodeError) -> ExportError {
        ExportError::Encode(err)
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> ExportError {
        ExportError::Io(err)
    }
}

/// An export destination paired with its configuration, for batch exports.
pub struct ExportJob {
    pub config: ExportConfig,
    pub dest: PathBuf,
}

/// Runs export requests: sequences the shape generalizer, the
/// simplification pipeline and the format encoder, verifies the artifact by
/// decoding it back, and writes it to storage atomically.
pub struct Exporter {
    config: ExportConfig,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Exporter {
        Exporter { config }
    }

    /// Run the export pipeline and return the artifact bytes and report.
    ///
    /// This is the pure part of an export: no I/O happens here, which is
    /// what allows independent configurations to run in parallel over one
    /// shared source graph.
    pub fn export_to_vec(&self, graph: &Graph) -> Result<(Vec<u8>, ExportReport), ExportError> {
        graph.validate()?;
        let nodes_before = graph.op_count();
        let mut warnings = Vec::new();

        let graph = match &self.config.dynamic_axes {
            Some(axes) => {
                let generalizer =
                    ShapeGeneralizer::new(axes.clone(), self.config.shape_policy);
                let (graph, shape_warnings) = generalizer.generalize(graph)?;
                info!(
                    warnings = shape_warnings.len(),
                    "generalized input shapes"
                );
                warnings.extend(shape_warnings);
                graph
            }
            None => graph.clone(),
        };

        let (graph, pass_changes, fixpoint_iterations) = if self.config.simplify {
            let pipeline = Pipeline::standard(self.config.max_fixpoint_iterations);
            let (graph, stats) = pipeline.run(graph)?;
            if !stats.converged {
                warnings.push(format!(
                    "simplification stopped after {} iterations without reaching a fixpoint",
                    stats.iterations
                ));
                warn!(
                    iterations = stats.iterations,
                    "fixpoint not reached; exporting last stable graph"
                );
            }
            for (pass, count) in &stats.changes {
                debug!(pass = pass.as_str(), count = *count, "pass rewrites");
            }
            (graph, stats.changes, stats.iterations)
        } else {
            (graph, Vec::new(), 0)
        };

        let nodes_after = graph.op_count();
        info!(nodes_before, nodes_after, "simplified graph");

        let artifact = encode::encode(
            &graph,
            self.config.target_format,
            self.config.opset_version,
        )?;

        // Decode the artifact and check it reproduces the graph before
        // declaring success.
        let decoded = encode::decode(&artifact)
            .map_err(|err| ExportError::Verify(err.to_string()))?;
        verify_round_trip(&graph, &decoded)?;

        let report = ExportReport {
            nodes_before,
            nodes_after,
            pass_changes,
            fixpoint_iterations,
            parameters: graph.total_params(),
            artifact_bytes: artifact.len(),
            warnings,
        };
        Ok((artifact, report))
    }

    /// Export `graph` to `dest`.
    ///
    /// The artifact is written to a temporary sibling path and renamed into
    /// place only after the pipeline and verification succeed, so a failed
    /// export never leaves a partial artifact at `dest`.
    pub fn export(&self, graph: &Graph, dest: &Path) -> Result<ExportReport, ExportError> {
        let (artifact, report) = self.export_to_vec(graph)?;

        let file_name = dest
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "model".to_string());
        let tmp_path = dest.with_file_name(format!("{}.tmp", file_name));

        if let Err(err) = fs::write(&tmp_path, &artifact).and_then(|_| fs::rename(&tmp_path, dest))
        {
            // Leave nothing behind on failure.
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        info!(
            dest = %dest.display(),
            bytes = report.artifact_bytes,
            "export complete"
        );
        Ok(report)
    }
}

/// Export one source graph under several configurations in parallel.
///
/// Every pipeline stage treats its input graph as immutable and produces a
/// fresh graph, so the jobs share `graph` read-only and need no locking.
pub fn export_all(graph: &Graph, jobs: &[ExportJob]) -> Vec<Result<ExportReport, ExportError>> {
    jobs.par_iter()
        .map(|job| Exporter::new(job.config.clone()).export(graph, &job.dest))
        .collect()
}

/// Check that a decoded artifact is isomorphic to the graph it was encoded
/// from: same interface, same operators, same constants, same shapes.
fn verify_round_trip(graph: &Graph, decoded: &DecodedModel) -> Result<(), ExportError> {
    let mismatch = |what: &str| Err(ExportError::Verify(format!("{} mismatch", what)));

    let restored = &decoded.graph;
    if restored.node_count() != graph.node_count() {
        return mismatch("node count");
    }
    if restored.input_ids().len() != graph.input_ids().len()
        || restored.output_ids().len() != graph.output_ids().len()
    {
        return mismatch("graph interface");
    }

    let mut op_kinds: FxHashMap<&'static str, i64> = FxHashMap::default();
    for (_, op) in graph.operators() {
        *op_kinds.entry(op.kind().name()).or_default() += 1;
    }
    for (_, op) in restored.operators() {
        *op_kinds.entry(op.kind().name()).or_default() -= 1;
    }
    if op_kinds.values().any(|&count| count != 0) {
        return mismatch("operator kind");
    }

    for (&expected, &restored_id) in graph.input_ids().iter().zip(restored.input_ids()) {
        let expected_shape = graph.get_node(expected).and_then(|node| node.shape());
        let restored_shape = restored.get_node(restored_id).and_then(|node| node.shape());
        if expected_shape != restored_shape {
            return mismatch("input shape");
        }
    }

    let constants = |g: &Graph| -> Vec<usize> {
        g.iter()
            .filter_map(|(_, node)| match node {
                Node::Constant(constant) => Some(constant.len()),
                _ => None,
            })
            .collect()
    };
    if constants(graph) != constants(restored) {
        return mismatch("constant data");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{export_all, ExportConfig, ExportError, ExportJob, Exporter};
    use crate::encode::{self, TargetFormat};
    use crate::generalize::{DynamicAxes, DynamicAxis};
    use crate::graph::{Dimension, Graph, GraphBuilder};
    use crate::ops::{Attrs, OpKind};
    use crate::tensor::Tensor;
    use crate::value::DataType;

    /// Input [1, 3, 4, 4]; a foldable constant product feeds a scale.
    fn traced_graph() -> Graph {
        let mut builder = GraphBuilder::new();
        let input = builder.add_value(
            Some("input"),
            Some(DataType::Float32),
            Some(vec![
                Dimension::Fixed(1),
                Dimension::Fixed(3),
                Dimension::Fixed(4),
                Dimension::Fixed(4),
            ]),
        );
        let two = builder.add_constant(Some("two"), Tensor::from_scalar(2.0f32));
        let three = builder.add_constant(Some("three"), Tensor::from_scalar(3.0f32));
        let (_, scale) = builder
            .add_op(Some("mul"), OpKind::Mul, Attrs::new(), &[two, three])
            .unwrap();
        let (_, scaled) = builder
            .add_op(Some("scale"), OpKind::Mul, Attrs::new(), &[input, scale])
            .unwrap();
        let (_, out) = builder
            .add_op(Some("relu"), OpKind::Relu, Attrs::new(), &[scaled])
            .unwrap();
        builder.set_inputs(&[input]);
        builder.set_outputs(&[out]);
        builder.finish().unwrap()
    }

    fn batch_config(format: TargetFormat) -> ExportConfig {
        ExportConfig {
            dynamic_axes: Some(DynamicAxes::Axes(vec![DynamicAxis::new(0, 0, "batch")])),
            target_format: format,
            ..ExportConfig::default()
        }
    }

    #[test]
    fn test_export_to_vec_reports_and_artifact() {
        let graph = traced_graph();
        let exporter = Exporter::new(batch_config(TargetFormat::Binary));
        let (artifact, report) = exporter.export_to_vec(&graph).unwrap();

        assert_eq!(report.nodes_before, 3);
        // The constant product folds away; scale and relu remain.
        assert_eq!(report.nodes_after, 2);
        assert_eq!(report.artifact_bytes, artifact.len());
        assert!(report.warnings.is_empty());
        assert!(report.parameters > 0);

        // The exported input shape carries the symbolic batch axis.
        let decoded = encode::decode(&artifact).unwrap();
        let input_shape = decoded
            .graph
            .get_node(decoded.graph.input_ids()[0])
            .unwrap()
            .shape()
            .unwrap();
        assert_eq!(
            input_shape,
            vec![
                Dimension::Symbolic("batch".to_string()),
                Dimension::Fixed(3),
                Dimension::Fixed(4),
                Dimension::Fixed(4),
            ]
        );
    }

    #[test]
    fn test_export_writes_atomically() {
        let dir = std::env::temp_dir().join("graphport-export-test");
        std::fs::create_dir_all(&dir).unwrap();
        let dest = dir.join("model.gport");

        let graph = traced_graph();
        let exporter = Exporter::new(batch_config(TargetFormat::Binary));
        let report = exporter.export(&graph, &dest).unwrap();

        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written.len(), report.artifact_bytes);
        assert!(!dir.join("model.gport.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_failed_export_leaves_no_artifact() {
        let dir = std::env::temp_dir().join("graphport-export-fail-test");
        std::fs::create_dir_all(&dir).unwrap();
        let dest = dir.join("model.gport");

        // Conflicting configuration: the input axis is pinned by a
        // broadcast against a fixed-size constant.
        let mut builder = GraphBuilder::new();
        let input = builder.add_value(
            Some("input"),
            Some(DataType::Float32),
            Some(vec![Dimension::Fixed(4), Dimension::Fixed(3)]),
        );
        let bias = builder.add_constant(
            Some("bias"),
            Tensor::from_data(&[4, 3], vec![0.0f32; 12]),
        );
        let (_, out) = builder
            .add_op(Some("add"), OpKind::Add, Attrs::new(), &[input, bias])
            .unwrap();
        builder.set_inputs(&[input]);
        builder.set_outputs(&[out]);
        let graph = builder.finish().unwrap();

        let exporter = Exporter::new(batch_config(TargetFormat::Binary));
        let result = exporter.export(&graph, &dest);
        assert!(matches!(result, Err(ExportError::DynamicAxes(_))));
        assert!(!dest.exists());
        assert!(!dir.join("model.gport.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_export_all_formats_in_parallel() {
        let dir = std::env::temp_dir().join("graphport-export-all-test");
        std::fs::create_dir_all(&dir).unwrap();

        let graph = traced_graph();
        let jobs = vec![
            ExportJob {
                config: batch_config(TargetFormat::Binary),
                dest: dir.join("model.gport"),
            },
            ExportJob {
                config: batch_config(TargetFormat::Json),
                dest: dir.join("model.json"),
            },
            ExportJob {
                config: ExportConfig {
                    simplify: false,
                    ..batch_config(TargetFormat::Binary)
                },
                dest: dir.join("model-unsimplified.gport"),
            },
        ];

        let results = export_all(&graph, &jobs);
        assert_eq!(results.len(), 3);
        for result in &results {
            assert!(result.is_ok());
        }

        // The unsimplified export keeps the foldable node.
        assert_eq!(results[0].as_ref().unwrap().nodes_after, 2);
        assert_eq!(results[2].as_ref().unwrap().nodes_after, 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_report_counts_folded_nodes() {
        let graph = traced_graph();
        let exporter = Exporter::new(ExportConfig::default());
        let (_, report) = exporter.export_to_vec(&graph).unwrap();

        // One constant product folds away and nothing fuses, so the pass
        // changes account exactly for the removed operator.
        let removed: usize = report.pass_changes.iter().map(|(_, count)| count).sum();
        assert_eq!(removed, 1);
        assert_eq!(report.nodes_before - removed, report.nodes_after);
    }
}
