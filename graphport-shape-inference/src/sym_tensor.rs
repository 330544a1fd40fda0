//! Tensors with symbolic shapes and values.

use std::fmt;

use crate::sym_expr::SymExpr;

/// Tensor with symbolic shape and, for scalars and vectors, symbolic values.
///
/// This type is used during shape inference to represent what is known about
/// an operator input or output. Most values only carry a shape. Operators
/// that manipulate shapes (`Shape`, `Gather`, `Concat` over shape vectors)
/// additionally track the symbolic *values* of small integer tensors so that
/// shape-extraction subgraphs can be followed.
#[derive(Clone, PartialEq)]
pub enum SymTensor {
    /// Scalar with a known symbolic value.
    Scalar(SymExpr),
    /// Vector with known symbolic values.
    Vector(Vec<SymExpr>),
    /// Tensor with a known shape and unknown values.
    Shape(Vec<SymExpr>),
    /// Tensor whose dimensions are unknown. The rank may still be known.
    Unknown { rank: Option<usize> },
}

impl SymTensor {
    /// Create a tensor with unknown rank and values.
    pub fn unknown() -> SymTensor {
        SymTensor::Unknown { rank: None }
    }

    /// Create a tensor with a known rank but unknown dimension sizes.
    pub fn unknown_with_rank(rank: usize) -> SymTensor {
        SymTensor::Unknown { rank: Some(rank) }
    }

    /// Create a tensor with the given shape and unknown values.
    pub fn from_shape(shape: Vec<SymExpr>) -> SymTensor {
        SymTensor::Shape(shape)
    }

    /// Create a tensor with the given fixed shape and unknown values.
    pub fn from_fixed_shape(shape: &[usize]) -> SymTensor {
        SymTensor::Shape(shape.iter().map(|&size| SymExpr::from(size)).collect())
    }

    /// Create a vector with known symbolic values.
    pub fn from_vec(values: Vec<SymExpr>) -> SymTensor {
        SymTensor::Vector(values)
    }

    /// Create a scalar with a known symbolic value.
    pub fn from_scalar(value: SymExpr) -> SymTensor {
        SymTensor::Scalar(value)
    }

    /// Return the number of dimensions, if known.
    pub fn ndim(&self) -> Option<usize> {
        match self {
            SymTensor::Scalar(_) => Some(0),
            SymTensor::Vector(_) => Some(1),
            SymTensor::Shape(dims) => Some(dims.len()),
            SymTensor::Unknown { rank } => *rank,
        }
    }

    /// Return the dimensions of this tensor, if known.
    ///
    /// For vectors and scalars this is derived from the value count.
    pub fn dims(&self) -> Option<Vec<SymExpr>> {
        match self {
            SymTensor::Scalar(_) => Some(Vec::new()),
            SymTensor::Vector(values) => Some(vec![SymExpr::from(values.len())]),
            SymTensor::Shape(dims) => Some(dims.clone()),
            SymTensor::Unknown { .. } => None,
        }
    }

    /// Return the symbolic values of this tensor, if known.
    pub fn values(&self) -> Option<&[SymExpr]> {
        match self {
            SymTensor::Scalar(value) => Some(std::slice::from_ref(value)),
            SymTensor::Vector(values) => Some(values),
            SymTensor::Shape(_) | SymTensor::Unknown { .. } => None,
        }
    }

    /// Return this tensor's single value, if it is a scalar.
    pub fn as_scalar(&self) -> Option<&SymExpr> {
        match self {
            SymTensor::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Return this tensor's values as a slice, if it is a vector.
    pub fn as_vector(&self) -> Option<&[SymExpr]> {
        match self {
            SymTensor::Vector(values) => Some(values),
            _ => None,
        }
    }

    /// Return the concrete values of a scalar or vector, if all are known.
    pub fn to_const_vec(&self) -> Option<Vec<i64>> {
        self.values()?
            .iter()
            .map(|value| value.as_value())
            .collect()
    }

    /// Return true if nothing is known about this tensor's dimensions.
    pub fn is_unknown(&self) -> bool {
        matches!(self, SymTensor::Unknown { .. })
    }

    /// Simplify the symbolic expressions in this tensor.
    pub fn simplify(self) -> SymTensor {
        match self {
            SymTensor::Scalar(value) => SymTensor::Scalar(value.simplify()),
            SymTensor::Vector(values) => {
                SymTensor::Vector(values.iter().map(|v| v.simplify()).collect())
            }
            SymTensor::Shape(dims) => {
                SymTensor::Shape(dims.iter().map(|d| d.simplify()).collect())
            }
            SymTensor::Unknown { .. } => self,
        }
    }
}

impl fmt::Debug for SymTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymTensor::Scalar(value) => write!(f, "scalar({})", value),
            SymTensor::Vector(values) => {
                let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "vector[{}]", rendered.join(", "))
            }
            SymTensor::Shape(dims) => {
                let rendered: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "shape({})", rendered.join(", "))
            }
            SymTensor::Unknown { rank: Some(rank) } => write!(f, "unknown(rank={})", rank),
            SymTensor::Unknown { rank: None } => write!(f, "unknown"),
        }
    }
}
