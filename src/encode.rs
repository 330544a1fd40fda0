//! Serialization of finalized graphs into portable artifacts.

mod binary;
mod json;

use std::error::Error;
use std::fmt;

use graphport_model_file::HeaderError;

use crate::graph::{Graph, MalformedGraphError};
use crate::ops::OpKind;

/// Version of the artifact schema written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Newest operator-set version this crate can emit.
pub const DEFAULT_OPSET: u32 = 2;

/// Target container format for an export.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TargetFormat {
    /// The `.gport` binary container.
    Binary,

    /// A human-readable JSON document carrying the same information. Also
    /// accepted as an input format.
    Json,
}

impl TargetFormat {
    pub fn from_name(name: &str) -> Option<TargetFormat> {
        match name {
            "bin" | "binary" => Some(TargetFormat::Binary),
            "json" => Some(TargetFormat::Json),
            _ => None,
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetFormat::Binary => write!(f, "binary"),
            TargetFormat::Json => write!(f, "json"),
        }
    }
}

/// The operator-set version an operator kind first appeared in.
///
/// Opset 1 covers the base kinds; opset 2 adds the fused kinds the
/// optimizer produces.
pub(crate) fn min_opset(kind: OpKind) -> u32 {
    match kind {
        OpKind::Silu | OpKind::Gelu | OpKind::FusedMatMul => 2,
        _ => 1,
    }
}

/// Errors produced while encoding a graph.
#[derive(Debug, PartialEq)]
pub enum EncodeError {
    /// The graph contains an operator the target operator set cannot
    /// represent. The operator is never silently dropped.
    UnsupportedOperator {
        op: String,
        kind: OpKind,
        opset: u32,
    },

    /// The requested operator-set version is unknown.
    UnsupportedOpset { opset: u32 },

    /// Serialization failed.
    Serialize(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOperator { op, kind, opset } => write!(
                f,
                "operator \"{}\" ({}) is not representable in opset {}",
                op, kind, opset
            ),
            Self::UnsupportedOpset { opset } => {
                write!(f, "unsupported opset version {}", opset)
            }
            Self::Serialize(msg) => write!(f, "serialization failed: {}", msg),
        }
    }
}

impl Error for EncodeError {}

/// Errors produced while decoding an artifact.
#[derive(Debug)]
pub enum DecodeError {
    /// The container header is invalid.
    Header(HeaderError),

    /// The byte stream is truncated or inconsistent.
    Corrupt(String),

    /// The artifact references an operator this crate does not know.
    UnknownOperator(String),

    /// The decoded graph fails structural validation.
    Graph(MalformedGraphError),

    /// The JSON document could not be parsed.
    Json(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(err) => write!(f, "invalid header: {}", err),
            Self::Corrupt(msg) => write!(f, "corrupt artifact: {}", msg),
            Self::UnknownOperator(name) => write!(f, "unknown operator \"{}\"", name),
            Self::Graph(err) => write!(f, "decoded graph is malformed: {}", err),
            Self::Json(msg) => write!(f, "invalid JSON model: {}", msg),
        }
    }
}

impl Error for DecodeError {}

impl From<HeaderError> for DecodeError {
    fn from(err: HeaderError) -> DecodeError {
        DecodeError::Header(err)
    }
}

impl From<MalformedGraphError> for DecodeError {
    fn from(err: MalformedGraphError) -> DecodeError {
        DecodeError::Graph(err)
    }
}

/// A graph decoded from an artifact, plus the artifact's version tags.
pub struct DecodedModel {
    pub graph: Graph,
    pub format: TargetFormat,
    pub schema_version: u32,
    pub opset_version: u32,
}

/// Serialize `graph` into the chosen container format.
///
/// Encoding is a pure function of the graph and options: repeated encodes
/// of an unchanged graph produce byte-identical artifacts.
pub fn encode(graph: &Graph, format: TargetFormat, opset: u32) -> Result<Vec<u8>, EncodeError> {
    if opset == 0 || opset > DEFAULT_OPSET {
        return Err(EncodeError::UnsupportedOpset { opset });
    }
    for (op_id, op) in graph.operators() {
        if min_opset(op.kind()) > opset {
            return Err(EncodeError::UnsupportedOperator {
                op: graph.node_name(op_id),
                kind: op.kind(),
                opset,
            });
        }
    }

    match format {
        TargetFormat::Binary => Ok(binary::encode(graph, opset)),
        TargetFormat::Json => json::encode(graph, opset),
    }
}

/// Decode an artifact produced by [`encode`], sniffing the format.
pub fn decode(bytes: &[u8]) -> Result<DecodedModel, DecodeError> {
    if bytes.starts_with(graphport_model_file::header::MAGIC) {
        binary::decode(bytes)
    } else {
        json::decode(bytes)
    }
}
