//! Data types and typed constant values.

use std::fmt;

use crate::tensor::Tensor;

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum DataType {
    Float32,
    /// 16-bit IEEE floats, stored as raw bits. Carried through to the
    /// artifact but never evaluated.
    Float16,
    Int64,
    Int32,
    Bool,
}

impl DataType {
    /// Width of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float16 => 2,
            DataType::Int64 => 8,
            DataType::Int32 => 4,
            DataType::Bool => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float16 => "float16",
            DataType::Int64 => "int64",
            DataType::Int32 => "int32",
            DataType::Bool => "bool",
        }
    }

    pub fn from_str(name: &str) -> Option<DataType> {
        match name {
            "float32" => Some(DataType::Float32),
            "float16" => Some(DataType::Float16),
            "int64" => Some(DataType::Int64),
            "int32" => Some(DataType::Int32),
            "bool" => Some(DataType::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A constant tensor of one of the supported element types.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorValue {
    Float(Tensor<f32>),
    Half(Tensor<u16>),
    Int(Tensor<i64>),
    Int32(Tensor<i32>),
    Bool(Tensor<bool>),
}

impl TensorValue {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorValue::Float(_) => DataType::Float32,
            TensorValue::Half(_) => DataType::Float16,
            TensorValue::Int(_) => DataType::Int64,
            TensorValue::Int32(_) => DataType::Int32,
            TensorValue::Bool(_) => DataType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::Float(t) => t.shape(),
            TensorValue::Half(t) => t.shape(),
            TensorValue::Int(t) => t.shape(),
            TensorValue::Int32(t) => t.shape(),
            TensorValue::Bool(t) => t.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        match self {
            TensorValue::Float(t) => t.len(),
            TensorValue::Half(t) => t.len(),
            TensorValue::Int(t) => t.len(),
            TensorValue::Int32(t) => t.len(),
            TensorValue::Bool(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_float(&self) -> Option<&Tensor<f32>> {
        match self {
            TensorValue::Float(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&Tensor<i64>> {
        match self {
            TensorValue::Int(t) => Some(t),
            _ => None,
        }
    }

    /// Return the value as a float scalar, if it is one.
    pub fn as_scalar_f32(&self) -> Option<f32> {
        self.as_float().and_then(|t| t.item().copied())
    }

    /// Return integer elements widened to i64, for scalars and vectors.
    ///
    /// Shape-like inputs (reshape targets, axis lists) are read this way.
    pub fn as_i64_vec(&self) -> Option<Vec<i64>> {
        match self {
            TensorValue::Int(t) if t.ndim() <= 1 => Some(t.data().to_vec()),
            TensorValue::Int32(t) if t.ndim() <= 1 => {
                Some(t.data().iter().map(|&x| x as i64).collect())
            }
            _ => None,
        }
    }

    /// Serialize the elements as little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        fn collect<T: Copy, const N: usize>(data: &[T], f: impl Fn(T) -> [u8; N]) -> Vec<u8> {
            let mut bytes = Vec::with_capacity(data.len() * N);
            for &value in data {
                bytes.extend(f(value));
            }
            bytes
        }

        match self {
            TensorValue::Float(t) => collect(t.data(), f32::to_le_bytes),
            TensorValue::Half(t) => collect(t.data(), u16::to_le_bytes),
            TensorValue::Int(t) => collect(t.data(), i64::to_le_bytes),
            TensorValue::Int32(t) => collect(t.data(), i32::to_le_bytes),
            TensorValue::Bool(t) => t.data().iter().map(|&b| b as u8).collect(),
        }
    }

    /// Deserialize elements from little-endian bytes.
    ///
    /// Returns `None` if the byte count does not match the shape and dtype.
    pub fn from_le_bytes(dtype: DataType, shape: &[usize], bytes: &[u8]) -> Option<TensorValue> {
        let count: usize = shape.iter().product();
        if bytes.len() != count * dtype.size_of() {
            return None;
        }

        fn parse<T, const N: usize>(bytes: &[u8], f: impl Fn([u8; N]) -> T) -> Vec<T> {
            bytes
                .chunks_exact(N)
                .map(|chunk| f(chunk.try_into().unwrap()))
                .collect()
        }

        let value = match dtype {
            DataType::Float32 => {
                TensorValue::Float(Tensor::from_data(shape, parse(bytes, f32::from_le_bytes)))
            }
            DataType::Float16 => {
                TensorValue::Half(Tensor::from_data(shape, parse(bytes, u16::from_le_bytes)))
            }
            DataType::Int64 => {
                TensorValue::Int(Tensor::from_data(shape, parse(bytes, i64::from_le_bytes)))
            }
            DataType::Int32 => {
                TensorValue::Int32(Tensor::from_data(shape, parse(bytes, i32::from_le_bytes)))
            }
            DataType::Bool => TensorValue::Bool(Tensor::from_data(
                shape,
                bytes.iter().map(|&b| b != 0).collect(),
            )),
        };
        Some(value)
    }
}

impl From<Tensor<f32>> for TensorValue {
    fn from(tensor: Tensor<f32>) -> TensorValue {
        TensorValue::Float(tensor)
    }
}

impl From<Tensor<i64>> for TensorValue {
    fn from(tensor: Tensor<i64>) -> TensorValue {
        TensorValue::Int(tensor)
    }
}

impl From<Tensor<i32>> for TensorValue {
    fn from(tensor: Tensor<i32>) -> TensorValue {
        TensorValue::Int32(tensor)
    }
}

impl From<Tensor<bool>> for TensorValue {
    fn from(tensor: Tensor<bool>) -> TensorValue {
        TensorValue::Bool(tensor)
    }
}
