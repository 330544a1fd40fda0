//! Eager evaluation of operators on constant tensors.
//!
//! Constant folding replaces an operator with the value it would compute at
//! runtime. The arithmetic here must therefore match runtime semantics
//! exactly: IEEE f32 for float operators, two's-complement i64/i32 for
//! integer operators. Operators that cannot be reproduced exactly (`Erf`,
//! anything touching f16 payloads) are simply not foldable and are left in
//! the graph.

use std::fmt;
use std::ops::Range;

use smallvec::SmallVec;

use crate::ops::{Attrs, OpKind};
use crate::tensor::Tensor;
use crate::value::TensorValue;

/// Errors produced when evaluating an operator on constant inputs.
///
/// Folding treats any of these as "leave the node in place" rather than
/// failing the export: the runtime will surface the same condition.
#[derive(Clone, Debug, PartialEq)]
pub enum EvalError {
    /// This operator kind is not evaluated at export time.
    Unsupported(OpKind),

    /// The input data types are not supported for this operator.
    TypeMismatch,

    /// The input shapes are incompatible.
    ShapeMismatch(String),

    /// An attribute or shape-like input has an invalid value.
    InvalidValue(String),

    /// Integer division by zero.
    DivideByZero,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Unsupported(kind) => write!(f, "operator {} is not evaluated", kind),
            EvalError::TypeMismatch => write!(f, "unsupported input types"),
            EvalError::ShapeMismatch(msg) => write!(f, "incompatible shapes: {}", msg),
            EvalError::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
            EvalError::DivideByZero => write!(f, "integer division by zero"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Return true if `kind` can be evaluated by [`eval`].
pub fn is_foldable(kind: OpKind) -> bool {
    use OpKind::*;
    matches!(
        kind,
        Add | Sub
            | Mul
            | Div
            | Pow
            | Neg
            | Sqrt
            | Sigmoid
            | Relu
            | Tanh
            | MatMul
            | Reshape
            | Transpose
            | Squeeze
            | Unsqueeze
            | Concat
            | Slice
            | Shape
            | Gather
            | ReduceMean
    )
}

/// Evaluate an operator on constant inputs.
pub fn eval(kind: OpKind, attrs: &Attrs, inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    use OpKind::*;
    match kind {
        Add => binary_elementwise(inputs, |a, b| a + b, |a: i64, b| a.wrapping_add(b)),
        Sub => binary_elementwise(inputs, |a, b| a - b, |a: i64, b| a.wrapping_sub(b)),
        Mul => binary_elementwise(inputs, |a, b| a * b, |a: i64, b| a.wrapping_mul(b)),
        Div => eval_div(inputs),
        Pow => {
            let [TensorValue::Float(a), TensorValue::Float(b)] = inputs else {
                return Err(EvalError::TypeMismatch);
            };
            Ok(broadcast_map(a, b, |x, y| x.powf(y))?.into())
        }
        Neg => unary_elementwise(inputs, |x| -x, |x: i64| x.wrapping_neg()),
        Sqrt => unary_float(inputs, f32::sqrt),
        Sigmoid => unary_float(inputs, |x| 1.0 / (1.0 + (-x).exp())),
        Tanh => unary_float(inputs, f32::tanh),
        Relu => unary_elementwise(inputs, |x: f32| x.max(0.0), |x: i64| x.max(0)),
        MatMul => eval_matmul(inputs),
        Reshape => eval_reshape(inputs),
        Transpose => eval_transpose(attrs, inputs),
        Squeeze => eval_squeeze(attrs, inputs),
        Unsqueeze => eval_unsqueeze(attrs, inputs),
        Concat => eval_concat(attrs, inputs),
        Slice => eval_slice(attrs, inputs),
        Shape => eval_shape(inputs),
        Gather => eval_gather(attrs, inputs),
        ReduceMean => eval_reduce_mean(attrs, inputs),
        _ => Err(EvalError::Unsupported(kind)),
    }
}

/// Compute the result shape of broadcasting `a` and `b` together.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, EvalError> {
    let ndim = a.len().max(b.len());
    let mut shape = Vec::with_capacity(ndim);
    for i in 0..ndim {
        let a_dim = i
            .checked_sub(ndim - a.len())
            .map(|j| a[j])
            .unwrap_or(1);
        let b_dim = i
            .checked_sub(ndim - b.len())
            .map(|j| b[j])
            .unwrap_or(1);
        let dim = match (a_dim, b_dim) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            (x, y) => {
                return Err(EvalError::ShapeMismatch(format!(
                    "cannot broadcast {} against {}",
                    x, y
                )));
            }
        };
        shape.push(dim);
    }
    Ok(shape)
}

/// Strides for reading a tensor of shape `shape` as if it had been broadcast
/// to `out_shape`: broadcast dimensions get a stride of zero.
fn broadcast_strides(shape: &[usize], out_shape: &[usize]) -> SmallVec<[usize; 8]> {
    let pad = out_shape.len() - shape.len();
    let mut strides: SmallVec<[usize; 8]> = SmallVec::new();
    strides.resize(out_shape.len(), 0);

    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        strides[pad + i] = if shape[i] == 1 { 0 } else { stride };
        stride *= shape[i];
    }
    strides
}

/// Apply `f` elementwise to `a` and `b`, broadcasting them to a common
/// shape.
fn broadcast_map<T: Copy, U>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    f: impl Fn(T, T) -> U,
) -> Result<Tensor<U>, EvalError> {
    let out_shape = broadcast_shape(a.shape(), b.shape())?;
    let out_len: usize = out_shape.iter().product();
    let a_strides = broadcast_strides(a.shape(), &out_shape);
    let b_strides = broadcast_strides(b.shape(), &out_shape);

    let mut index: SmallVec<[usize; 8]> = SmallVec::new();
    index.resize(out_shape.len(), 0);

    let a_data = a.data();
    let b_data = b.data();
    let mut out = Vec::with_capacity(out_len);
    for _ in 0..out_len {
        let a_off: usize = index.iter().zip(&a_strides).map(|(i, s)| i * s).sum();
        let b_off: usize = index.iter().zip(&b_strides).map(|(i, s)| i * s).sum();
        out.push(f(a_data[a_off], b_data[b_off]));

        for dim in (0..index.len()).rev() {
            index[dim] += 1;
            if index[dim] < out_shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    Ok(Tensor::from_data(&out_shape, out))
}

fn binary_elementwise(
    inputs: &[&TensorValue],
    float_op: impl Fn(f32, f32) -> f32,
    int_op: impl Fn(i64, i64) -> i64,
) -> Result<TensorValue, EvalError> {
    match inputs {
        [TensorValue::Float(a), TensorValue::Float(b)] => {
            Ok(broadcast_map(a, b, float_op)?.into())
        }
        [TensorValue::Int(a), TensorValue::Int(b)] => Ok(broadcast_map(a, b, int_op)?.into()),
        [TensorValue::Int32(a), TensorValue::Int32(b)] => {
            Ok(broadcast_map(a, b, |x, y| int_op(x as i64, y as i64) as i32)?.into())
        }
        _ => Err(EvalError::TypeMismatch),
    }
}

fn eval_div(inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    // Check integer divisors up front so a zero leaves the node unfolded
    // instead of emitting a bogus constant.
    match inputs {
        [_, TensorValue::Int(b)] if b.data().contains(&0) => {
            return Err(EvalError::DivideByZero);
        }
        [_, TensorValue::Int32(b)] if b.data().contains(&0) => {
            return Err(EvalError::DivideByZero);
        }
        _ => {}
    }
    binary_elementwise(inputs, |a, b| a / b, |a, b| a.wrapping_div(b))
}

fn unary_elementwise(
    inputs: &[&TensorValue],
    float_op: impl Fn(f32) -> f32,
    int_op: impl Fn(i64) -> i64,
) -> Result<TensorValue, EvalError> {
    match inputs {
        [TensorValue::Float(t)] => Ok(t.map(|&x| float_op(x)).into()),
        [TensorValue::Int(t)] => Ok(t.map(|&x| int_op(x)).into()),
        [TensorValue::Int32(t)] => Ok(t.map(|&x| int_op(x as i64) as i32).into()),
        _ => Err(EvalError::TypeMismatch),
    }
}

fn unary_float(
    inputs: &[&TensorValue],
    float_op: impl Fn(f32) -> f32,
) -> Result<TensorValue, EvalError> {
    match inputs {
        [TensorValue::Float(t)] => Ok(t.map(|&x| float_op(x)).into()),
        _ => Err(EvalError::TypeMismatch),
    }
}

fn eval_matmul(inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [TensorValue::Float(a), TensorValue::Float(b)] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let (&[m, k], &[k2, n]) = (a.shape(), b.shape()) else {
        // Batched matmul does not occur between graph constants in practice.
        return Err(EvalError::Unsupported(OpKind::MatMul));
    };
    if k != k2 {
        return Err(EvalError::ShapeMismatch(format!(
            "matmul inner dims {} and {} differ",
            k, k2
        )));
    }

    let a_data = a.data();
    let b_data = b.data();
    let mut out = vec![0.0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f32;
            for i in 0..k {
                acc += a_data[row * k + i] * b_data[i * n + col];
            }
            out[row * n + col] = acc;
        }
    }
    Ok(Tensor::from_data(&[m, n], out).into())
}

/// Replace a value's shape, keeping its data.
fn with_shape(value: &TensorValue, shape: Vec<usize>) -> TensorValue {
    match value {
        TensorValue::Float(t) => t.clone().reshaped(shape).into(),
        TensorValue::Half(t) => TensorValue::Half(t.clone().reshaped(shape)),
        TensorValue::Int(t) => t.clone().reshaped(shape).into(),
        TensorValue::Int32(t) => t.clone().reshaped(shape).into(),
        TensorValue::Bool(t) => t.clone().reshaped(shape).into(),
    }
}

fn eval_reshape(inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [data, target] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let target = target.as_i64_vec().ok_or(EvalError::TypeMismatch)?;

    let mut out_shape: Vec<usize> = Vec::with_capacity(target.len());
    let mut infer_pos = None;
    for (i, &dim) in target.iter().enumerate() {
        match dim {
            -1 => {
                if infer_pos.is_some() {
                    return Err(EvalError::InvalidValue(
                        "multiple -1 entries in reshape target".to_string(),
                    ));
                }
                infer_pos = Some(i);
                out_shape.push(1);
            }
            0 => {
                let copied = data.shape().get(i).copied().ok_or_else(|| {
                    EvalError::InvalidValue("reshape target copies missing dim".to_string())
                })?;
                out_shape.push(copied);
            }
            dim if dim > 0 => out_shape.push(dim as usize),
            _ => {
                return Err(EvalError::InvalidValue(
                    "negative dim in reshape target".to_string(),
                ));
            }
        }
    }

    let known: usize = out_shape.iter().product();
    if let Some(pos) = infer_pos {
        if known == 0 || data.len() % known != 0 {
            return Err(EvalError::ShapeMismatch(format!(
                "cannot infer reshape dim for {} elements",
                data.len()
            )));
        }
        out_shape[pos] = data.len() / known;
    } else if known != data.len() {
        return Err(EvalError::ShapeMismatch(format!(
            "cannot reshape {} elements to {:?}",
            data.len(),
            out_shape
        )));
    }
    Ok(with_shape(data, out_shape))
}

fn transpose<T: Copy>(tensor: &Tensor<T>, perm: &[usize]) -> Tensor<T> {
    let shape = tensor.shape();
    let out_shape: Vec<usize> = perm.iter().map(|&axis| shape[axis]).collect();
    let in_strides = tensor.strides();

    let mut index: SmallVec<[usize; 8]> = SmallVec::new();
    index.resize(out_shape.len(), 0);

    let data = tensor.data();
    let mut out = Vec::with_capacity(data.len());
    for _ in 0..data.len() {
        let offset: usize = index
            .iter()
            .zip(perm)
            .map(|(&i, &axis)| i * in_strides[axis])
            .sum();
        out.push(data[offset]);

        for dim in (0..index.len()).rev() {
            index[dim] += 1;
            if index[dim] < out_shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    Tensor::from_data(&out_shape, out)
}

fn resolve_axis(ndim: usize, axis: i64) -> Result<usize, EvalError> {
    let ndim = ndim as i64;
    if axis < -ndim || axis >= ndim {
        return Err(EvalError::InvalidValue(format!("axis {} out of range", axis)));
    }
    Ok(if axis < 0 { axis + ndim } else { axis } as usize)
}

fn eval_transpose(attrs: &Attrs, inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [data] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let ndim = data.ndim();
    let perm: Vec<usize> = match attrs.get_ints("perm") {
        Some(perm) => {
            if perm.len() != ndim {
                return Err(EvalError::InvalidValue("perm length mismatch".to_string()));
            }
            perm.iter()
                .map(|&axis| resolve_axis(ndim, axis))
                .collect::<Result<_, _>>()?
        }
        None => (0..ndim).rev().collect(),
    };

    let out = match data {
        TensorValue::Float(t) => transpose(t, &perm).into(),
        TensorValue::Half(t) => TensorValue::Half(transpose(t, &perm)),
        TensorValue::Int(t) => transpose(t, &perm).into(),
        TensorValue::Int32(t) => transpose(t, &perm).into(),
        TensorValue::Bool(t) => transpose(t, &perm).into(),
    };
    Ok(out)
}

fn eval_squeeze(attrs: &Attrs, inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [data] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let shape = data.shape();

    let removed: Vec<usize> = match attrs.get_ints("axes") {
        Some(axes) => {
            let mut removed = Vec::with_capacity(axes.len());
            for &axis in axes {
                let axis = resolve_axis(shape.len(), axis)?;
                if shape[axis] != 1 {
                    return Err(EvalError::InvalidValue(format!(
                        "cannot squeeze axis {} of size {}",
                        axis, shape[axis]
                    )));
                }
                removed.push(axis);
            }
            removed
        }
        None => shape
            .iter()
            .enumerate()
            .filter_map(|(i, &size)| (size == 1).then_some(i))
            .collect(),
    };

    let out_shape: Vec<usize> = shape
        .iter()
        .enumerate()
        .filter_map(|(i, &size)| (!removed.contains(&i)).then_some(size))
        .collect();
    Ok(with_shape(data, out_shape))
}

fn eval_unsqueeze(attrs: &Attrs, inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [data] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let axes = attrs
        .get_ints("axes")
        .ok_or_else(|| EvalError::InvalidValue("missing axes".to_string()))?;

    let out_rank = data.ndim() + axes.len();
    let mut inserted: Vec<usize> = axes
        .iter()
        .map(|&axis| resolve_axis(out_rank, axis))
        .collect::<Result<_, _>>()?;
    inserted.sort();

    let mut out_shape = Vec::with_capacity(out_rank);
    let mut in_dims = data.shape().iter();
    for i in 0..out_rank {
        if inserted.contains(&i) {
            out_shape.push(1);
        } else {
            out_shape.push(*in_dims.next().ok_or_else(|| {
                EvalError::InvalidValue("duplicate unsqueeze axes".to_string())
            })?);
        }
    }
    Ok(with_shape(data, out_shape))
}

fn concat<T: Copy>(tensors: &[&Tensor<T>], axis: usize) -> Result<Tensor<T>, EvalError> {
    let first_shape = tensors[0].shape();
    let mut out_shape = first_shape.to_vec();
    for tensor in &tensors[1..] {
        let shape = tensor.shape();
        if shape.len() != first_shape.len() {
            return Err(EvalError::ShapeMismatch("concat rank mismatch".to_string()));
        }
        for (i, (&a, &b)) in first_shape.iter().zip(shape).enumerate() {
            if i != axis && a != b {
                return Err(EvalError::ShapeMismatch(format!(
                    "concat dim {} mismatch: {} vs {}",
                    i, a, b
                )));
            }
        }
        out_shape[axis] += shape[axis];
    }

    let outer: usize = first_shape[..axis].iter().product();
    let inner: usize = first_shape[axis + 1..].iter().product();

    let mut out = Vec::with_capacity(out_shape.iter().product());
    for block in 0..outer {
        for tensor in tensors {
            let chunk = tensor.shape()[axis] * inner;
            let start = block * chunk;
            out.extend_from_slice(&tensor.data()[start..start + chunk]);
        }
    }
    Ok(Tensor::from_data(&out_shape, out))
}

fn eval_concat(attrs: &Attrs, inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let first = inputs.first().ok_or(EvalError::TypeMismatch)?;
    let axis = resolve_axis(
        first.ndim().max(1),
        attrs
            .get_int("axis")
            .ok_or_else(|| EvalError::InvalidValue("missing axis".to_string()))?,
    )?;

    macro_rules! concat_as {
        ($variant:ident) => {{
            let tensors: Option<Vec<_>> = inputs
                .iter()
                .map(|input| match input {
                    TensorValue::$variant(t) => Some(t),
                    _ => None,
                })
                .collect();
            let tensors = tensors.ok_or(EvalError::TypeMismatch)?;
            concat(&tensors, axis).map(TensorValue::$variant)
        }};
    }

    match first {
        TensorValue::Float(_) => concat_as!(Float),
        TensorValue::Half(_) => concat_as!(Half),
        TensorValue::Int(_) => concat_as!(Int),
        TensorValue::Int32(_) => concat_as!(Int32),
        TensorValue::Bool(_) => concat_as!(Bool),
    }
}

fn slice_ranges(
    shape: &[usize],
    attrs: &Attrs,
) -> Result<Vec<Range<usize>>, EvalError> {
    let starts = attrs
        .get_ints("starts")
        .ok_or_else(|| EvalError::InvalidValue("missing starts".to_string()))?;
    let ends = attrs
        .get_ints("ends")
        .ok_or_else(|| EvalError::InvalidValue("missing ends".to_string()))?;
    if starts.len() != ends.len() {
        return Err(EvalError::InvalidValue(
            "starts and ends differ in length".to_string(),
        ));
    }

    let axes: Vec<usize> = match attrs.get_ints("axes") {
        Some(axes) => axes
            .iter()
            .map(|&axis| resolve_axis(shape.len(), axis))
            .collect::<Result<_, _>>()?,
        None => (0..starts.len()).collect(),
    };

    let mut ranges: Vec<Range<usize>> = shape.iter().map(|&size| 0..size).collect();
    for (i, &axis) in axes.iter().enumerate() {
        let size = shape[axis] as i64;
        let clamp = |bound: i64| -> usize {
            let bound = if bound < 0 { bound + size } else { bound };
            bound.clamp(0, size) as usize
        };
        let start = clamp(starts[i]);
        let end = clamp(ends[i]).max(start);
        ranges[axis] = start..end;
    }
    Ok(ranges)
}

fn slice<T: Copy>(tensor: &Tensor<T>, ranges: &[Range<usize>]) -> Tensor<T> {
    let out_shape: Vec<usize> = ranges.iter().map(|range| range.len()).collect();
    let out_len: usize = out_shape.iter().product();
    let strides = tensor.strides();

    let mut index: SmallVec<[usize; 8]> = SmallVec::new();
    index.resize(out_shape.len(), 0);

    let data = tensor.data();
    let mut out = Vec::with_capacity(out_len);
    for _ in 0..out_len {
        let offset: usize = index
            .iter()
            .zip(ranges)
            .zip(&strides)
            .map(|((&i, range), &stride)| (range.start + i) * stride)
            .sum();
        out.push(data[offset]);

        for dim in (0..index.len()).rev() {
            index[dim] += 1;
            if index[dim] < out_shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    Tensor::from_data(&out_shape, out)
}

fn eval_slice(attrs: &Attrs, inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [data] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let ranges = slice_ranges(data.shape(), attrs)?;

    let out = match data {
        TensorValue::Float(t) => slice(t, &ranges).into(),
        TensorValue::Half(t) => TensorValue::Half(slice(t, &ranges)),
        TensorValue::Int(t) => slice(t, &ranges).into(),
        TensorValue::Int32(t) => slice(t, &ranges).into(),
        TensorValue::Bool(t) => slice(t, &ranges).into(),
    };
    Ok(out)
}

fn eval_shape(inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [data] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let dims: Vec<i64> = data.shape().iter().map(|&size| size as i64).collect();
    Ok(Tensor::from_vec(dims).into())
}

fn gather<T: Copy>(
    data: &Tensor<T>,
    axis: usize,
    indices: &[i64],
    index_shape: &[usize],
) -> Result<Tensor<T>, EvalError> {
    let shape = data.shape();
    let axis_size = shape[axis] as i64;

    let mut out_shape = Vec::with_capacity(shape.len() - 1 + index_shape.len());
    out_shape.extend_from_slice(&shape[..axis]);
    out_shape.extend_from_slice(index_shape);
    out_shape.extend_from_slice(&shape[axis + 1..]);

    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product();

    let mut out = Vec::with_capacity(out_shape.iter().product());
    for block in 0..outer {
        for &index in indices {
            let resolved = if index < 0 { index + axis_size } else { index };
            if resolved < 0 || resolved >= axis_size {
                return Err(EvalError::InvalidValue(format!(
                    "gather index {} out of range",
                    index
                )));
            }
            let start = (block * axis_size as usize + resolved as usize) * inner;
            out.extend_from_slice(&data.data()[start..start + inner]);
        }
    }
    Ok(Tensor::from_data(&out_shape, out))
}

fn eval_gather(attrs: &Attrs, inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [data, indices] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let axis = resolve_axis(data.ndim(), attrs.get_int("axis").unwrap_or(0))?;
    let index_shape = indices.shape().to_vec();
    let index_vals = match indices {
        TensorValue::Int(t) => t.data().to_vec(),
        TensorValue::Int32(t) => t.data().iter().map(|&x| x as i64).collect(),
        _ => return Err(EvalError::TypeMismatch),
    };

    let out = match data {
        TensorValue::Float(t) => gather(t, axis, &index_vals, &index_shape)?.into(),
        TensorValue::Half(t) => TensorValue::Half(gather(t, axis, &index_vals, &index_shape)?),
        TensorValue::Int(t) => gather(t, axis, &index_vals, &index_shape)?.into(),
        TensorValue::Int32(t) => gather(t, axis, &index_vals, &index_shape)?.into(),
        TensorValue::Bool(t) => gather(t, axis, &index_vals, &index_shape)?.into(),
    };
    Ok(out)
}

fn eval_reduce_mean(attrs: &Attrs, inputs: &[&TensorValue]) -> Result<TensorValue, EvalError> {
    let [TensorValue::Float(data)] = inputs else {
        return Err(EvalError::TypeMismatch);
    };
    let shape = data.shape();
    let keep_dims = attrs.get_int("keepdims").unwrap_or(1) != 0;

    let mut axes: Vec<usize> = match attrs.get_ints("axes") {
        Some(axes) => axes
            .iter()
            .map(|&axis| resolve_axis(shape.len(), axis))
            .collect::<Result<_, _>>()?,
        None => (0..shape.len()).collect(),
    };
    axes.sort();
    axes.dedup();

    let out_shape: Vec<usize> = shape
        .iter()
        .enumerate()
        .filter_map(|(i, &size)| {
            if !axes.contains(&i) {
                Some(size)
            } else if keep_dims {
                Some(1)
            } else {
                None
            }
        })
        .collect();

    let reduced_count: usize = axes.iter().map(|&axis| shape[axis]).product();
    let out_len: usize = out_shape.iter().product();
    let mut sums = vec![0.0f32; out_len];

    // Walk every input element and accumulate it into the output slot
    // obtained by dropping the reduced dimensions.
    let mut index: SmallVec<[usize; 8]> = SmallVec::new();
    index.resize(shape.len(), 0);
    for &value in data.data() {
        let mut out_offset = 0;
        for (dim, &i) in index.iter().enumerate() {
            if axes.contains(&dim) {
                continue;
            }
            out_offset = out_offset * shape[dim] + i;
        }
        sums[out_offset] += value;

        for dim in (0..index.len()).rev() {
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }

    let count = reduced_count.max(1) as f32;
    for sum in &mut sums {
        *sum /= count;
    }
    Ok(Tensor::from_data(&out_shape, sums).into())
}

#[cfg(test)]
mod tests {
    use graphport_testing::TestCases;

    use super::{eval, is_foldable, EvalError};
    use crate::ops::{Attrs, OpKind};
    use crate::tensor::Tensor;
    use crate::value::TensorValue;

    fn scalar(value: f32) -> TensorValue {
        Tensor::from_scalar(value).into()
    }

    #[test]
    fn test_fold_scalar_mul() {
        // The canonical folding example: 2.0 * 3.0 => 6.0.
        let out = eval(OpKind::Mul, &Attrs::new(), &[&scalar(2.0), &scalar(3.0)]).unwrap();
        assert_eq!(out, scalar(6.0));
    }

    #[test]
    fn test_binary_scalar_arithmetic() {
        #[derive(Debug)]
        struct Case {
            kind: OpKind,
            lhs: f32,
            rhs: f32,
            expected: f32,
        }

        let cases = [
            Case {
                kind: OpKind::Add,
                lhs: 1.5,
                rhs: 2.25,
                expected: 3.75,
            },
            Case {
                kind: OpKind::Sub,
                lhs: 1.0,
                rhs: 4.0,
                expected: -3.0,
            },
            Case {
                kind: OpKind::Div,
                lhs: 1.0,
                rhs: 4.0,
                expected: 0.25,
            },
            Case {
                kind: OpKind::Pow,
                lhs: 3.0,
                rhs: 2.0,
                expected: 9.0,
            },
        ];

        cases.test_each(|case| {
            let out = eval(
                case.kind,
                &Attrs::new(),
                &[&scalar(case.lhs), &scalar(case.rhs)],
            )
            .unwrap();
            assert_eq!(out, scalar(case.expected));
        });
    }

    #[test]
    fn test_broadcast_add() {
        let a = TensorValue::from(Tensor::from_data(&[2, 2], vec![1.0f32, 2.0, 3.0, 4.0]));
        let b = TensorValue::from(Tensor::from_vec(vec![10.0f32, 20.0]));
        let out = eval(OpKind::Add, &Attrs::new(), &[&a, &b]).unwrap();
        assert_eq!(
            out,
            TensorValue::from(Tensor::from_data(&[2, 2], vec![11.0f32, 22.0, 13.0, 24.0]))
        );
    }

    #[test]
    fn test_broadcast_shape_mismatch() {
        let a = TensorValue::from(Tensor::from_vec(vec![1.0f32, 2.0, 3.0]));
        let b = TensorValue::from(Tensor::from_vec(vec![1.0f32, 2.0]));
        let err = eval(OpKind::Add, &Attrs::new(), &[&a, &b]).err().unwrap();
        assert!(matches!(err, EvalError::ShapeMismatch(_)));
    }

    #[test]
    fn test_int_div_by_zero_not_folded() {
        let a = TensorValue::from(Tensor::from_vec(vec![6i64]));
        let b = TensorValue::from(Tensor::from_vec(vec![0i64]));
        let err = eval(OpKind::Div, &Attrs::new(), &[&a, &b]).err().unwrap();
        assert_eq!(err, EvalError::DivideByZero);
    }

    #[test]
    fn test_matmul() {
        let a = TensorValue::from(Tensor::from_data(&[2, 3], vec![1.0f32; 6]));
        let b = TensorValue::from(Tensor::from_data(&[3, 2], vec![2.0f32; 6]));
        let out = eval(OpKind::MatMul, &Attrs::new(), &[&a, &b]).unwrap();
        assert_eq!(
            out,
            TensorValue::from(Tensor::from_data(&[2, 2], vec![6.0f32; 4]))
        );
    }

    #[test]
    fn test_reshape_with_inferred_dim() {
        let data = TensorValue::from(Tensor::from_data(&[2, 6], (0..12).collect::<Vec<i64>>()));
        let target = TensorValue::from(Tensor::from_vec(vec![3i64, -1]));
        let out = eval(OpKind::Reshape, &Attrs::new(), &[&data, &target]).unwrap();
        assert_eq!(out.shape(), &[3, 4]);
    }

    #[test]
    fn test_transpose() {
        let data = TensorValue::from(Tensor::from_data(&[2, 3], (0..6).collect::<Vec<i64>>()));
        let out = eval(OpKind::Transpose, &Attrs::new(), &[&data]).unwrap();
        assert_eq!(
            out,
            TensorValue::from(Tensor::from_data(&[3, 2], vec![0i64, 3, 1, 4, 2, 5]))
        );
    }

    #[test]
    fn test_concat() {
        let a = TensorValue::from(Tensor::from_data(&[2, 2], vec![1i64, 2, 3, 4]));
        let b = TensorValue::from(Tensor::from_data(&[2, 1], vec![5i64, 6]));
        let attrs = Attrs::new().with("axis", 1i64);
        let out = eval(OpKind::Concat, &attrs, &[&a, &b]).unwrap();
        assert_eq!(
            out,
            TensorValue::from(Tensor::from_data(&[2, 3], vec![1i64, 2, 5, 3, 4, 6]))
        );
    }

    #[test]
    fn test_slice() {
        let data = TensorValue::from(Tensor::from_data(&[3, 3], (0..9).collect::<Vec<i64>>()));
        let attrs = Attrs::new()
            .with("starts", vec![1i64])
            .with("ends", vec![3i64])
            .with("axes", vec![1i64]);
        let out = eval(OpKind::Slice, &attrs, &[&data]).unwrap();
        assert_eq!(
            out,
            TensorValue::from(Tensor::from_data(&[3, 2], vec![1i64, 2, 4, 5, 7, 8]))
        );
    }

    #[test]
    fn test_shape_and_gather() {
        let data = TensorValue::from(Tensor::from_data(&[2, 3, 4], vec![0.0f32; 24]));
        let shape = eval(OpKind::Shape, &Attrs::new(), &[&data]).unwrap();
        assert_eq!(shape, TensorValue::from(Tensor::from_vec(vec![2i64, 3, 4])));

        let index = TensorValue::from(Tensor::from_scalar(-1i64));
        let picked = eval(OpKind::Gather, &Attrs::new(), &[&shape, &index]).unwrap();
        assert_eq!(picked, TensorValue::from(Tensor::from_scalar(4i64)));
    }

    #[test]
    fn test_reduce_mean() {
        let data = TensorValue::from(Tensor::from_data(&[2, 2], vec![1.0f32, 3.0, 5.0, 7.0]));
        let attrs = Attrs::new().with("axes", vec![1i64]).with("keepdims", 0i64);
        let out = eval(OpKind::ReduceMean, &attrs, &[&data]).unwrap();
        assert_eq!(out, TensorValue::from(Tensor::from_vec(vec![2.0f32, 6.0])));
    }

    #[test]
    fn test_erf_not_foldable() {
        assert!(!is_foldable(OpKind::Erf));
        assert!(is_foldable(OpKind::Mul));
        let err = eval(OpKind::Erf, &Attrs::new(), &[&scalar(1.0)])
            .err()
            .unwrap();
        assert_eq!(err, EvalError::Unsupported(OpKind::Erf));
    }
}
