//! The closed set of operator kinds and their signatures.

use std::fmt;

pub mod eval;

/// Operator kinds understood by the export engine.
///
/// Each kind has a static [`Signature`] describing its arity and attribute
/// schema, which the graph builder validates against at construction time.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum OpKind {
    // Elementwise.
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Sqrt,
    Erf,
    Sigmoid,
    Relu,
    Tanh,
    Softmax,
    // Matrix products.
    MatMul,
    // Layout.
    Reshape,
    Transpose,
    Squeeze,
    Unsqueeze,
    Concat,
    Slice,
    // Shape extraction.
    Shape,
    Gather,
    // Reductions.
    ReduceMean,
    // Convolutional.
    Conv,
    MaxPool,
    // Fused kinds produced by the optimizer.
    Silu,
    Gelu,
    FusedMatMul,
}

/// Expected type of an attribute value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttrKind {
    Int,
    Float,
    String,
    Ints,
    Floats,
}

/// Schema for one attribute of an operator kind.
#[derive(Clone, Debug)]
pub struct AttrSchema {
    pub name: &'static str,
    pub kind: AttrKind,
    pub required: bool,
}

/// Static description of an operator kind's inputs, outputs and attributes.
#[derive(Clone, Debug)]
pub struct Signature {
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub outputs: usize,
    pub attrs: &'static [AttrSchema],
}

macro_rules! attr {
    ($name:literal, $kind:ident) => {
        AttrSchema {
            name: $name,
            kind: AttrKind::$kind,
            required: false,
        }
    };
    ($name:literal, $kind:ident, required) => {
        AttrSchema {
            name: $name,
            kind: AttrKind::$kind,
            required: true,
        }
    };
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::Pow => "Pow",
            OpKind::Neg => "Neg",
            OpKind::Sqrt => "Sqrt",
            OpKind::Erf => "Erf",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::Relu => "Relu",
            OpKind::Tanh => "Tanh",
            OpKind::Softmax => "Softmax",
            OpKind::MatMul => "MatMul",
            OpKind::Reshape => "Reshape",
            OpKind::Transpose => "Transpose",
            OpKind::Squeeze => "Squeeze",
            OpKind::Unsqueeze => "Unsqueeze",
            OpKind::Concat => "Concat",
            OpKind::Slice => "Slice",
            OpKind::Shape => "Shape",
            OpKind::Gather => "Gather",
            OpKind::ReduceMean => "ReduceMean",
            OpKind::Conv => "Conv",
            OpKind::MaxPool => "MaxPool",
            OpKind::Silu => "Silu",
            OpKind::Gelu => "Gelu",
            OpKind::FusedMatMul => "FusedMatMul",
        }
    }

    /// Look up an operator kind by name.
    pub fn from_name(name: &str) -> Option<OpKind> {
        ALL_KINDS.iter().copied().find(|kind| kind.name() == name)
    }

    /// True if swapping the operands does not change the result.
    pub fn is_commutative(self) -> bool {
        matches!(self, OpKind::Add | OpKind::Mul)
    }

    pub fn signature(self) -> &'static Signature {
        use OpKind::*;
        match self {
            Add | Sub | Mul | Div | Pow | MatMul => &Signature {
                min_inputs: 2,
                max_inputs: 2,
                outputs: 1,
                attrs: &[],
            },
            Neg | Sqrt | Erf | Sigmoid | Relu | Tanh | Silu | Gelu | Shape => &Signature {
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                attrs: &[],
            },
            Softmax => &Signature {
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                attrs: &[attr!("axis", Int, required)],
            },
            Reshape => &Signature {
                min_inputs: 2,
                max_inputs: 2,
                outputs: 1,
                attrs: &[],
            },
            Transpose => &Signature {
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                attrs: &[attr!("perm", Ints)],
            },
            Squeeze => &Signature {
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                attrs: &[attr!("axes", Ints)],
            },
            Unsqueeze => &Signature {
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                attrs: &[attr!("axes", Ints, required)],
            },
            Concat => &Signature {
                min_inputs: 1,
                max_inputs: usize::MAX,
                outputs: 1,
                attrs: &[attr!("axis", Int, required)],
            },
            Slice => &Signature {
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                attrs: &[
                    attr!("starts", Ints, required),
                    attr!("ends", Ints, required),
                    attr!("axes", Ints),
                ],
            },
            Gather => &Signature {
                min_inputs: 2,
                max_inputs: 2,
                outputs: 1,
                attrs: &[attr!("axis", Int)],
            },
            ReduceMean => &Signature {
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                attrs: &[attr!("axes", Ints), attr!("keepdims", Int)],
            },
            Conv => &Signature {
                min_inputs: 2,
                max_inputs: 3,
                outputs: 1,
                attrs: &[attr!("strides", Ints), attr!("pads", Ints)],
            },
            MaxPool => &Signature {
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                attrs: &[
                    attr!("kernel_shape", Ints, required),
                    attr!("strides", Ints),
                    attr!("pads", Ints),
                ],
            },
            FusedMatMul => &Signature {
                min_inputs: 2,
                max_inputs: 3,
                outputs: 1,
                attrs: &[attr!("alpha", Float)],
            },
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// All operator kinds, in a stable order.
pub const ALL_KINDS: &[OpKind] = &[
    OpKind::Add,
    OpKind::Sub,
    OpKind::Mul,
    OpKind::Div,
    OpKind::Pow,
    OpKind::Neg,
    OpKind::Sqrt,
    OpKind::Erf,
    OpKind::Sigmoid,
    OpKind::Relu,
    OpKind::Tanh,
    OpKind::Softmax,
    OpKind::MatMul,
    OpKind::Reshape,
    OpKind::Transpose,
    OpKind::Squeeze,
    OpKind::Unsqueeze,
    OpKind::Concat,
    OpKind::Slice,
    OpKind::Shape,
    OpKind::Gather,
    OpKind::ReduceMean,
    OpKind::Conv,
    OpKind::MaxPool,
    OpKind::Silu,
    OpKind::Gelu,
    OpKind::FusedMatMul,
];

/// Value of a single operator attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Int(_) => AttrKind::Int,
            AttrValue::Float(_) => AttrKind::Float,
            AttrValue::String(_) => AttrKind::String,
            AttrValue::Ints(_) => AttrKind::Ints,
            AttrValue::Floats(_) => AttrKind::Floats,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(val: i64) -> AttrValue {
        AttrValue::Int(val)
    }
}

impl From<f32> for AttrValue {
    fn from(val: f32) -> AttrValue {
        AttrValue::Float(val)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(val: Vec<i64>) -> AttrValue {
        AttrValue::Ints(val)
    }
}

impl From<Vec<f32>> for AttrValue {
    fn from(val: Vec<f32>) -> AttrValue {
        AttrValue::Floats(val)
    }
}

impl From<&str> for AttrValue {
    fn from(val: &str) -> AttrValue {
        AttrValue::String(val.to_string())
    }
}

/// An operator node's attributes, stored sorted by name.
///
/// The sorted order gives attribute lists a canonical form, which the
/// redundant-node pass and the encoders rely on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Attrs(Vec<(String, AttrValue)>);

impl Attrs {
    pub fn new() -> Attrs {
        Attrs(Vec::new())
    }

    /// Add or replace an attribute.
    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        let value = value.into();
        match self.0.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(pos) => self.0[pos].1 = value,
            Err(pos) => self.0.insert(pos, (name.to_string(), value)),
        }
    }

    /// Builder-style variant of [`set`](Attrs::set).
    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Attrs {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|pos| &self.0[pos].1)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(AttrValue::Int(val)) => Some(*val),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        match self.get(name) {
            Some(AttrValue::Float(val)) => Some(*val),
            _ => None,
        }
    }

    pub fn get_ints(&self, name: &str) -> Option<&[i64]> {
        match self.get(name) {
            Some(AttrValue::Ints(val)) => Some(val),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>, V: Into<AttrValue>> FromIterator<(S, V)> for Attrs {
    fn from_iter<I: IntoIterator<Item = (S, V)>>(iter: I) -> Attrs {
        let mut attrs = Attrs::new();
        for (name, value) in iter {
            attrs.set(&name.into(), value);
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::{AttrKind, Attrs, OpKind, ALL_KINDS};

    #[test]
    fn test_name_round_trip() {
        for &kind in ALL_KINDS {
            assert_eq!(OpKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(OpKind::from_name("Resize"), None);
    }

    #[test]
    fn test_signatures_are_consistent() {
        for &kind in ALL_KINDS {
            let sig = kind.signature();
            assert!(sig.min_inputs <= sig.max_inputs, "{} arity", kind);
            assert!(sig.outputs >= 1, "{} outputs", kind);
        }
    }

    #[test]
    fn test_attrs_sorted_and_typed() {
        let attrs = Attrs::new()
            .with("strides", vec![2i64, 2])
            .with("pads", vec![1i64, 1, 1, 1]);

        // Attributes are kept in name order regardless of insertion order.
        let names: Vec<&str> = attrs.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["pads", "strides"]);

        assert_eq!(attrs.get_ints("strides"), Some([2i64, 2].as_slice()));
        assert_eq!(attrs.get_int("strides"), None);
        assert_eq!(attrs.get("dilations"), None);
        assert_eq!(
            attrs.get("pads").map(|v| v.kind()),
            Some(AttrKind::Ints)
        );
    }

    #[test]
    fn test_attrs_set_replaces() {
        let mut attrs = Attrs::new();
        attrs.set("axis", 0i64);
        attrs.set("axis", 1i64);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get_int("axis"), Some(1));
    }
}
