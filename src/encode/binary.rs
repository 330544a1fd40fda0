//! The `.gport` binary graph section.
//!
//! Layout: fixed-size header, then the graph section (a record per node in
//! arena order, followed by the graph input/output lists), then 8-byte
//! aligned raw tensor data for the constants. Constant records reference
//! tensor data by offset and length relative to the tensor section.

use graphport_model_file::header::FORMAT_VERSION;
use graphport_model_file::{Header, ValueReader, ValueWriter};

use super::{DecodeError, DecodedModel, TargetFormat};
use crate::graph::{Dimension, Graph, Node, NodeId};
use crate::ops::{AttrValue, Attrs, OpKind};
use crate::value::{DataType, TensorValue};

const NODE_VALUE: u8 = 0;
const NODE_CONSTANT: u8 = 1;
const NODE_OPERATOR: u8 = 2;

const DIM_FIXED: u8 = 0;
const DIM_SYMBOLIC: u8 = 1;

const ATTR_INT: u8 = 0;
const ATTR_FLOAT: u8 = 1;
const ATTR_STRING: u8 = 2;
const ATTR_INTS: u8 = 3;
const ATTR_FLOATS: u8 = 4;

/// Stable wire opcode for an operator kind.
pub(crate) fn opcode(kind: OpKind) -> u16 {
    use OpKind::*;
    match kind {
        Add => 1,
        Sub => 2,
        Mul => 3,
        Div => 4,
        Pow => 5,
        Neg => 6,
        Sqrt => 7,
        Erf => 8,
        Sigmoid => 9,
        Relu => 10,
        Tanh => 11,
        Softmax => 12,
        MatMul => 13,
        Reshape => 14,
        Transpose => 15,
        Squeeze => 16,
        Unsqueeze => 17,
        Concat => 18,
        Slice => 19,
        Shape => 20,
        Gather => 21,
        ReduceMean => 22,
        Conv => 23,
        MaxPool => 24,
        Silu => 25,
        Gelu => 26,
        FusedMatMul => 27,
    }
}

fn kind_from_opcode(code: u16) -> Option<OpKind> {
    crate::ops::ALL_KINDS
        .iter()
        .copied()
        .find(|&kind| opcode(kind) == code)
}

fn dtype_code(dtype: DataType) -> u8 {
    match dtype {
        DataType::Float32 => 1,
        DataType::Float16 => 2,
        DataType::Int64 => 3,
        DataType::Int32 => 4,
        DataType::Bool => 5,
    }
}

fn dtype_from_code(code: u8) -> Option<DataType> {
    match code {
        1 => Some(DataType::Float32),
        2 => Some(DataType::Float16),
        3 => Some(DataType::Int64),
        4 => Some(DataType::Int32),
        5 => Some(DataType::Bool),
        _ => None,
    }
}

fn write_opt_str(writer: &mut ValueWriter, value: Option<&str>) {
    match value {
        Some(value) => {
            writer.write(1u8);
            writer.write_str(value);
        }
        None => writer.write(0u8),
    }
}

fn write_ids(writer: &mut ValueWriter, ids: &[NodeId]) {
    writer.write(ids.len() as u32);
    for id in ids {
        writer.write(id.as_u32());
    }
}

pub(super) fn encode(graph: &Graph, opset: u32) -> Vec<u8> {
    // Lay out the tensor data first so constant records can reference it.
    let mut tensor_data = ValueWriter::new();
    let mut data_spans: Vec<(u64, u64)> = Vec::new();
    for (_, node) in graph.iter() {
        if let Node::Constant(constant) = node {
            tensor_data.pad_to(8);
            let bytes = constant.value().to_le_bytes();
            data_spans.push((tensor_data.len() as u64, bytes.len() as u64));
            tensor_data.write_bytes(&bytes);
        }
    }

    let mut writer = ValueWriter::new();
    writer.write(opset);
    writer.write(graph.node_count() as u32);

    let mut next_span = data_spans.iter();
    for (_, node) in graph.iter() {
        match node {
            Node::Value(value) => {
                writer.write(NODE_VALUE);
                write_opt_str(&mut writer, value.name());
                writer.write(value.dtype().map(dtype_code).unwrap_or(0));
                match value.shape() {
                    Some(dims) => {
                        writer.write(1u8);
                        writer.write(dims.len() as u32);
                        for dim in dims {
                            match dim {
                                Dimension::Fixed(size) => {
                                    writer.write(DIM_FIXED);
                                    writer.write(*size as u64);
                                }
                                Dimension::Symbolic(name) => {
                                    writer.write(DIM_SYMBOLIC);
                                    writer.write_str(name);
                                }
                            }
                        }
                    }
                    None => writer.write(0u8),
                }
            }
            Node::Constant(constant) => {
                let &(offset, len) = next_span.next().expect("span per constant");
                writer.write(NODE_CONSTANT);
                write_opt_str(&mut writer, constant.name());
                writer.write(dtype_code(constant.dtype()));
                writer.write(constant.shape().len() as u32);
                for &size in constant.shape() {
                    writer.write(size as u64);
                }
                writer.write(offset);
                writer.write(len);
            }
            Node::Operator(op) => {
                writer.write(NODE_OPERATOR);
                write_opt_str(&mut writer, op.name());
                writer.write(opcode(op.kind()));
                writer.write(op.attrs().len() as u32);
                for (name, value) in op.attrs().iter() {
                    writer.write_str(name);
                    match value {
                        AttrValue::Int(v) => {
                            writer.write(ATTR_INT);
                            writer.write(*v);
                        }
                        AttrValue::Float(v) => {
                            writer.write(ATTR_FLOAT);
                            writer.write(*v);
                        }
                        AttrValue::String(v) => {
                            writer.write(ATTR_STRING);
                            writer.write_str(v);
                        }
                        AttrValue::Ints(v) => {
                            writer.write(ATTR_INTS);
                            writer.write(v.len() as u32);
                            for &item in v {
                                writer.write(item);
                            }
                        }
                        AttrValue::Floats(v) => {
                            writer.write(ATTR_FLOATS);
                            writer.write(v.len() as u32);
                            for &item in v {
                                writer.write(item);
                            }
                        }
                    }
                }
                write_ids(&mut writer, op.input_ids());
                write_ids(&mut writer, op.output_ids());
            }
        }
    }
    write_ids(&mut writer, graph.input_ids());
    write_ids(&mut writer, graph.output_ids());

    let graph_section = writer.into_vec();
    let graph_offset = Header::LEN as u64;
    let graph_len = graph_section.len() as u64;
    // The tensor section starts at the next 8-byte boundary.
    let tensor_data_offset = (graph_offset + graph_len).div_ceil(8) * 8;

    let header = Header {
        version: FORMAT_VERSION,
        graph_offset,
        graph_len,
        tensor_data_offset,
    };

    let mut out = header.to_buf();
    out.extend(graph_section);
    out.resize(tensor_data_offset as usize, 0);
    out.extend(tensor_data.into_vec());
    out
}

struct GraphReader<'a> {
    reader: ValueReader<'a>,
    tensor_data: &'a [u8],
}

impl GraphReader<'_> {
    fn corrupt(what: &str) -> DecodeError {
        DecodeError::Corrupt(format!("unexpected end of {}", what))
    }

    fn read_opt_str(&mut self) -> Result<Option<String>, DecodeError> {
        match self.reader.read::<u8>() {
            Some(0) => Ok(None),
            Some(1) => self
                .reader
                .read_str()
                .map(Some)
                .ok_or_else(|| Self::corrupt("name")),
            _ => Err(Self::corrupt("name flag")),
        }
    }

    fn read_ids(&mut self) -> Result<Vec<NodeId>, DecodeError> {
        let count = self
            .reader
            .read::<u32>()
            .ok_or_else(|| Self::corrupt("id list"))?;
        (0..count)
            .map(|_| {
                self.reader
                    .read::<u32>()
                    .map(NodeId::from_u32)
                    .ok_or_else(|| Self::corrupt("id list"))
            })
            .collect()
    }

    fn read_value(&mut self, graph: &mut Graph) -> Result<(), DecodeError> {
        let name = self.read_opt_str()?;
        let dtype_code = self
            .reader
            .read::<u8>()
            .ok_or_else(|| Self::corrupt("value dtype"))?;
        let dtype = if dtype_code == 0 {
            None
        } else {
            Some(dtype_from_code(dtype_code).ok_or_else(|| {
                DecodeError::Corrupt(format!("unknown dtype code {}", dtype_code))
            })?)
        };

        let has_shape = self
            .reader
            .read::<u8>()
            .ok_or_else(|| Self::corrupt("shape flag"))?;
        let shape = match has_shape {
            0 => None,
            1 => {
                let rank = self
                    .reader
                    .read::<u32>()
                    .ok_or_else(|| Self::corrupt("shape"))?;
                let dims = (0..rank)
                    .map(|_| match self.reader.read::<u8>() {
                        Some(DIM_FIXED) => self
                            .reader
                            .read::<u64>()
                            .map(|size| Dimension::Fixed(size as usize))
                            .ok_or_else(|| Self::corrupt("dim")),
                        Some(DIM_SYMBOLIC) => self
                            .reader
                            .read_str()
                            .map(Dimension::Symbolic)
                            .ok_or_else(|| Self::corrupt("dim")),
                        _ => Err(Self::corrupt("dim tag")),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Some(dims)
            }
            _ => return Err(Self::corrupt("shape flag")),
        };

        graph.add_value(name.as_deref(), dtype, shape);
        Ok(())
    }

    fn read_constant(&mut self, graph: &mut Graph) -> Result<(), DecodeError> {
        let name = self.read_opt_str()?;
        let dtype_code = self
            .reader
            .read::<u8>()
            .ok_or_else(|| Self::corrupt("constant dtype"))?;
        let dtype = dtype_from_code(dtype_code).ok_or_else(|| {
            DecodeError::Corrupt(format!("unknown dtype code {}", dtype_code))
        })?;

        let rank = self
            .reader
            .read::<u32>()
            .ok_or_else(|| Self::corrupt("constant shape"))?;
        let shape = (0..rank)
            .map(|_| {
                self.reader
                    .read::<u64>()
                    .map(|size| size as usize)
                    .ok_or_else(|| Self::corrupt("constant shape"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let offset = self
            .reader
            .read::<u64>()
            .ok_or_else(|| Self::corrupt("data offset"))? as usize;
        let len = self
            .reader
            .read::<u64>()
            .ok_or_else(|| Self::corrupt("data length"))? as usize;
        let bytes = self
            .tensor_data
            .get(offset..offset + len)
            .ok_or_else(|| DecodeError::Corrupt("tensor data span out of range".to_string()))?;
        let value = TensorValue::from_le_bytes(dtype, &shape, bytes).ok_or_else(|| {
            DecodeError::Corrupt("tensor data does not match shape".to_string())
        })?;

        graph.add_constant(name.as_deref(), value);
        Ok(())
    }

    fn read_operator(&mut self, graph: &mut Graph) -> Result<(), DecodeError> {
        let name = self.read_opt_str()?;
        let code = self
            .reader
            .read::<u16>()
            .ok_or_else(|| Self::corrupt("opcode"))?;
        let kind = kind_from_opcode(code)
            .ok_or_else(|| DecodeError::UnknownOperator(format!("opcode {}", code)))?;

        let attr_count = self
            .reader
            .read::<u32>()
            .ok_or_else(|| Self::corrupt("attrs"))?;
        let mut attrs = Attrs::new();
        for _ in 0..attr_count {
            let attr_name = self
                .reader
                .read_str()
                .ok_or_else(|| Self::corrupt("attr name"))?;
            let tag = self
                .reader
                .read::<u8>()
                .ok_or_else(|| Self::corrupt("attr tag"))?;
            let value = match tag {
                ATTR_INT => self
                    .reader
                    .read::<i64>()
                    .map(AttrValue::Int)
                    .ok_or_else(|| Self::corrupt("attr"))?,
                ATTR_FLOAT => self
                    .reader
                    .read::<f32>()
                    .map(AttrValue::Float)
                    .ok_or_else(|| Self::corrupt("attr"))?,
                ATTR_STRING => self
                    .reader
                    .read_str()
                    .map(AttrValue::String)
                    .ok_or_else(|| Self::corrupt("attr"))?,
                ATTR_INTS => {
                    let count = self
                        .reader
                        .read::<u32>()
                        .ok_or_else(|| Self::corrupt("attr"))?;
                    let items = (0..count)
                        .map(|_| {
                            self.reader
                                .read::<i64>()
                                .ok_or_else(|| Self::corrupt("attr"))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    AttrValue::Ints(items)
                }
                ATTR_FLOATS => {
                    let count = self
                        .reader
                        .read::<u32>()
                        .ok_or_else(|| Self::corrupt("attr"))?;
                    let items = (0..count)
                        .map(|_| {
                            self.reader
                                .read::<f32>()
                                .ok_or_else(|| Self::corrupt("attr"))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    AttrValue::Floats(items)
                }
                _ => return Err(Self::corrupt("attr tag")),
            };
            attrs.set(&attr_name, value);
        }

        let inputs = self.read_ids()?;
        let outputs = self.read_ids()?;
        graph.add_op(name.as_deref(), kind, attrs, &inputs, &outputs);
        Ok(())
    }
}

pub(super) fn decode(bytes: &[u8]) -> Result<DecodedModel, DecodeError> {
    let header = Header::from_buf(bytes)?;
    let graph_section = &bytes
        [header.graph_offset as usize..(header.graph_offset + header.graph_len) as usize];
    let tensor_data = &bytes[header.tensor_data_offset as usize..];

    let mut reader = GraphReader {
        reader: ValueReader::new(graph_section),
        tensor_data,
    };

    let opset = reader
        .reader
        .read::<u32>()
        .ok_or_else(|| GraphReader::corrupt("opset"))?;
    let node_count = reader
        .reader
        .read::<u32>()
        .ok_or_else(|| GraphReader::corrupt("node count"))?;

    let mut graph = Graph::new();
    for _ in 0..node_count {
        let tag = reader
            .reader
            .read::<u8>()
            .ok_or_else(|| GraphReader::corrupt("node tag"))?;
        match tag {
            NODE_VALUE => reader.read_value(&mut graph)?,
            NODE_CONSTANT => reader.read_constant(&mut graph)?,
            NODE_OPERATOR => reader.read_operator(&mut graph)?,
            _ => return Err(GraphReader::corrupt("node tag")),
        }
    }

    let inputs = reader.read_ids()?;
    let outputs = reader.read_ids()?;
    graph.set_input_ids(&inputs);
    graph.set_output_ids(&outputs);
    graph.validate()?;

    Ok(DecodedModel {
        graph,
        format: TargetFormat::Binary,
        schema_version: header.version,
        opset_version: opset,
    })
}
