//! JSON interchange format.
//!
//! Carries the same information as the binary container in a form that is
//! convenient to inspect and to produce from other tooling. This is also
//! the input format the CLI accepts.

use serde::{Deserialize, Serialize};

use super::{DecodeError, DecodedModel, EncodeError, TargetFormat, SCHEMA_VERSION};
use crate::graph::{Dimension, Graph, Node, NodeId};
use crate::ops::{AttrValue, Attrs, OpKind};
use crate::tensor::Tensor;
use crate::value::{DataType, TensorValue};

#[derive(Deserialize, Serialize)]
struct JsonModel {
    schema_version: u32,
    opset_version: u32,
    graph: JsonGraph,
}

#[derive(Deserialize, Serialize)]
struct JsonGraph {
    inputs: Vec<u32>,
    outputs: Vec<u32>,
    nodes: Vec<JsonNode>,
}

#[derive(Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JsonNode {
    Value {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dtype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shape: Option<Vec<JsonDim>>,
    },
    Constant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        dtype: String,
        shape: Vec<usize>,
        #[serde(flatten)]
        data: JsonTensorData,
    },
    Operator {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        op: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attrs: Vec<JsonAttr>,
        inputs: Vec<u32>,
        outputs: Vec<u32>,
    },
}

/// A dimension is either a fixed size or a symbolic axis name, written
/// verbatim so a consuming runtime can bind it at load time.
#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum JsonDim {
    Fixed(usize),
    Symbolic(String),
}

/// Constant payloads use one dtype-specific field, in the style of tensor
/// protos. Float16 data is carried as raw bits.
#[derive(Default, Deserialize, Serialize)]
struct JsonTensorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    float_data: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    half_data: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    int64_data: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    int32_data: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bool_data: Option<Vec<bool>>,
}

#[derive(Deserialize, Serialize)]
struct JsonAttr {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    i: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    f: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ints: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    floats: Option<Vec<f32>>,
}

fn attr_to_json(name: &str, value: &AttrValue) -> JsonAttr {
    let mut attr = JsonAttr {
        name: name.to_string(),
        i: None,
        f: None,
        s: None,
        ints: None,
        floats: None,
    };
    match value {
        AttrValue::Int(v) => attr.i = Some(*v),
        AttrValue::Float(v) => attr.f = Some(*v),
        AttrValue::String(v) => attr.s = Some(v.clone()),
        AttrValue::Ints(v) => attr.ints = Some(v.clone()),
        AttrValue::Floats(v) => attr.floats = Some(v.clone()),
    }
    attr
}

fn attr_from_json(attr: &JsonAttr) -> Result<AttrValue, DecodeError> {
    let value = if let Some(v) = attr.i {
        AttrValue::Int(v)
    } else if let Some(v) = attr.f {
        AttrValue::Float(v)
    } else if let Some(v) = &attr.s {
        AttrValue::String(v.clone())
    } else if let Some(v) = &attr.ints {
        AttrValue::Ints(v.clone())
    } else if let Some(v) = &attr.floats {
        AttrValue::Floats(v.clone())
    } else {
        return Err(DecodeError::Json(format!(
            "attribute \"{}\" has no value",
            attr.name
        )));
    };
    Ok(value)
}

fn tensor_to_json(value: &TensorValue) -> JsonTensorData {
    let mut data = JsonTensorData::default();
    match value {
        TensorValue::Float(t) => data.float_data = Some(t.data().to_vec()),
        TensorValue::Half(t) => data.half_data = Some(t.data().to_vec()),
        TensorValue::Int(t) => data.int64_data = Some(t.data().to_vec()),
        TensorValue::Int32(t) => data.int32_data = Some(t.data().to_vec()),
        TensorValue::Bool(t) => data.bool_data = Some(t.data().to_vec()),
    }
    data
}

fn tensor_from_json(
    dtype: DataType,
    shape: &[usize],
    data: &JsonTensorData,
) -> Result<TensorValue, DecodeError> {
    let count: usize = shape.iter().product();
    let check_len = |len: usize| -> Result<(), DecodeError> {
        if len != count {
            return Err(DecodeError::Json(format!(
                "constant has {} elements but shape implies {}",
                len, count
            )));
        }
        Ok(())
    };

    let value = match (dtype, data) {
        (
            DataType::Float32,
            JsonTensorData {
                float_data: Some(values),
                ..
            },
        ) => {
            check_len(values.len())?;
            TensorValue::Float(Tensor::from_data(shape, values.clone()))
        }
        (
            DataType::Float16,
            JsonTensorData {
                half_data: Some(values),
                ..
            },
        ) => {
            check_len(values.len())?;
            TensorValue::Half(Tensor::from_data(shape, values.clone()))
        }
        (
            DataType::Int64,
            JsonTensorData {
                int64_data: Some(values),
                ..
            },
        ) => {
            check_len(values.len())?;
            TensorValue::Int(Tensor::from_data(shape, values.clone()))
        }
        (
            DataType::Int32,
            JsonTensorData {
                int32_data: Some(values),
                ..
            },
        ) => {
            check_len(values.len())?;
            TensorValue::Int32(Tensor::from_data(shape, values.clone()))
        }
        (
            DataType::Bool,
            JsonTensorData {
                bool_data: Some(values),
                ..
            },
        ) => {
            check_len(values.len())?;
            TensorValue::Bool(Tensor::from_data(shape, values.clone()))
        }
        _ => {
            return Err(DecodeError::Json(
                "constant data field does not match dtype".to_string(),
            ));
        }
    };
    Ok(value)
}

pub(super) fn encode(graph: &Graph, opset: u32) -> Result<Vec<u8>, EncodeError> {
    let nodes = graph
        .iter()
        .map(|(_, node)| match node {
            Node::Value(value) => JsonNode::Value {
                name: value.name().map(|name| name.to_string()),
                dtype: value.dtype().map(|dtype| dtype.as_str().to_string()),
                shape: value.shape().map(|dims| {
                    dims.iter()
                        .map(|dim| match dim {
                            Dimension::Fixed(size) => JsonDim::Fixed(*size),
                            Dimension::Symbolic(name) => JsonDim::Symbolic(name.clone()),
                        })
                        .collect()
                }),
            },
            Node::Constant(constant) => JsonNode::Constant {
                name: constant.name().map(|name| name.to_string()),
                dtype: constant.dtype().as_str().to_string(),
                shape: constant.shape().to_vec(),
                data: tensor_to_json(constant.value()),
            },
            Node::Operator(op) => JsonNode::Operator {
                name: op.name().map(|name| name.to_string()),
                op: op.kind().name().to_string(),
                attrs: op
                    .attrs()
                    .iter()
                    .map(|(name, value)| attr_to_json(name, value))
                    .collect(),
                inputs: op.input_ids().iter().map(|id| id.as_u32()).collect(),
                outputs: op.output_ids().iter().map(|id| id.as_u32()).collect(),
            },
        })
        .collect();

    let model = JsonModel {
        schema_version: SCHEMA_VERSION,
        opset_version: opset,
        graph: JsonGraph {
            inputs: graph.input_ids().iter().map(|id| id.as_u32()).collect(),
            outputs: graph.output_ids().iter().map(|id| id.as_u32()).collect(),
            nodes,
        },
    };

    serde_json::to_vec_pretty(&model).map_err(|err| EncodeError::Serialize(err.to_string()))
}

pub(super) fn decode(bytes: &[u8]) -> Result<DecodedModel, DecodeError> {
    let model: JsonModel =
        serde_json::from_slice(bytes).map_err(|err| DecodeError::Json(err.to_string()))?;

    let mut graph = Graph::new();
    for node in &model.graph.nodes {
        match node {
            JsonNode::Value { name, dtype, shape } => {
                let dtype = dtype
                    .as_deref()
                    .map(|name| {
                        DataType::from_str(name).ok_or_else(|| {
                            DecodeError::Json(format!("unknown dtype \"{}\"", name))
                        })
                    })
                    .transpose()?;
                let shape = shape.as_ref().map(|dims| {
                    dims.iter()
                        .map(|dim| match dim {
                            JsonDim::Fixed(size) => Dimension::Fixed(*size),
                            JsonDim::Symbolic(name) => Dimension::Symbolic(name.clone()),
                        })
                        .collect()
                });
                graph.add_value(name.as_deref(), dtype, shape);
            }
            JsonNode::Constant {
                name,
                dtype,
                shape,
                data,
            } => {
                let dtype = DataType::from_str(dtype)
                    .ok_or_else(|| DecodeError::Json(format!("unknown dtype \"{}\"", dtype)))?;
                let value = tensor_from_json(dtype, shape, data)?;
                graph.add_constant(name.as_deref(), value);
            }
            JsonNode::Operator {
                name,
                op,
                attrs,
                inputs,
                outputs,
            } => {
                let kind = OpKind::from_name(op)
                    .ok_or_else(|| DecodeError::UnknownOperator(op.clone()))?;
                let mut parsed = Attrs::new();
                for attr in attrs {
                    parsed.set(&attr.name, attr_from_json(attr)?);
                }
                let to_ids = |ids: &[u32]| -> Vec<NodeId> {
                    ids.iter().map(|&id| NodeId::from_u32(id)).collect()
                };
                graph.add_op(
                    name.as_deref(),
                    kind,
                    parsed,
                    &to_ids(inputs),
                    &to_ids(outputs),
                );
            }
        }
    }

    let to_ids = |ids: &[u32]| -> Vec<NodeId> {
        ids.iter().map(|&id| NodeId::from_u32(id)).collect()
    };
    graph.set_input_ids(&to_ids(&model.graph.inputs));
    graph.set_output_ids(&to_ids(&model.graph.outputs));
    graph.validate()?;

    Ok(DecodedModel {
        graph,
        format: TargetFormat::Json,
        schema_version: model.schema_version,
        opset_version: model.opset_version,
    })
}
