//! Shape inference rules for layout and shape-manipulating operators.

use smallvec::SmallVec;

use crate::infer_shapes::{resolve_axes, resolve_axis, InferCtx, InferError, InferShapes};
use crate::sym_expr::SymExpr;
use crate::sym_tensor::SymTensor;

/// Sentinel used by slice bounds meaning "to the end of the dimension".
pub const SLICE_MAX: i64 = i64::MAX;

/// Unify two dimensions which execution requires to be equal.
///
/// A named symbol meeting a fixed size is pinned to that size.
fn unify_dims(
    a: &SymExpr,
    b: &SymExpr,
    ctx: &mut InferCtx,
) -> Result<SymExpr, InferError> {
    match (a, b) {
        (a, b) if a == b => Ok(a.clone()),
        (SymExpr::Value(x), SymExpr::Value(y)) => Err(InferError::IncompatibleShapes(format!(
            "sizes {} and {} differ",
            x, y
        ))),
        (SymExpr::Var(name), SymExpr::Value(v)) | (SymExpr::Value(v), SymExpr::Var(name)) => {
            ctx.constraints.push(crate::Constraint {
                name: name.to_string(),
                value: *v,
            });
            Ok(SymExpr::Value(*v))
        }
        (SymExpr::Value(v), _) | (_, SymExpr::Value(v)) => Ok(SymExpr::Value(*v)),
        (a, _) => Ok(a.clone()),
    }
}

/// Shape inference for `Concat`.
pub struct ConcatOp {
    pub axis: i64,
}

impl InferShapes for ConcatOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        if inputs.is_empty() {
            return Err(InferError::IncorrectInputCount);
        }

        // Concatenating tracked vectors produces a tracked vector. This is
        // the common tail of shape-extraction subgraphs.
        if self.axis == 0 && inputs.iter().all(|input| input.as_vector().is_some()) {
            let mut values = Vec::new();
            for input in inputs {
                values.extend(input.as_vector().unwrap().iter().cloned());
            }
            return Ok([SymTensor::from_vec(values)].into());
        }

        let mut dims_per_input = Vec::with_capacity(inputs.len());
        for input in inputs {
            let Some(dims) = input.dims() else {
                return Ok([SymTensor::Unknown {
                    rank: inputs.iter().find_map(|i| i.ndim()),
                }]
                .into());
            };
            dims_per_input.push(dims);
        }

        let rank = dims_per_input[0].len();
        if dims_per_input.iter().any(|dims| dims.len() != rank) {
            return Err(InferError::IncorrectRank);
        }
        let axis = resolve_axis(rank, self.axis)?;

        let mut out_dims = dims_per_input[0].clone();
        for dims in &dims_per_input[1..] {
            for (i, dim) in dims.iter().enumerate() {
                if i == axis {
                    out_dims[i] = (out_dims[i].clone() + dim.clone()).simplify();
                } else {
                    out_dims[i] = unify_dims(&out_dims[i], dim, ctx)?;
                }
            }
        }
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for `Reshape`.
///
/// The target shape is the second input. A target entry of 0 copies the
/// corresponding input dimension and -1 infers the remaining size.
pub struct ReshapeOp;

impl ReshapeOp {
    /// Decompose a product expression into a constant factor and the symbols
    /// it multiplies. Returns `None` for anything more complex.
    fn linear_factors(expr: &SymExpr) -> Option<(i64, Vec<String>)> {
        match expr {
            SymExpr::Value(v) => Some((*v, Vec::new())),
            SymExpr::Var(name) => Some((1, vec![name.to_string()])),
            SymExpr::Mul(a, b) => {
                let (ca, mut va) = Self::linear_factors(a)?;
                let (cb, vb) = Self::linear_factors(b)?;
                va.extend(vb);
                Some((ca * cb, va))
            }
            _ => None,
        }
    }
}

impl InferShapes for ReshapeOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let [data, target] = inputs else {
            return Err(InferError::IncorrectInputCount);
        };

        let Some(target_vals) = target.values() else {
            // The target is not statically known. The output rank is still
            // known if the target's own length is.
            let rank = target
                .dims()
                .and_then(|dims| dims.first().and_then(|len| len.as_value()))
                .map(|len| len as usize);
            return Ok([match rank {
                Some(rank) => SymTensor::unknown_with_rank(rank),
                None => SymTensor::unknown(),
            }]
            .into());
        };

        let data_dims = data.dims();

        // Resolve zero entries (copy input dimension) and find the position
        // of an inferred (-1) entry.
        let mut out_dims: Vec<SymExpr> = Vec::with_capacity(target_vals.len());
        let mut infer_pos = None;
        for (i, val) in target_vals.iter().enumerate() {
            match val.as_value() {
                Some(-1) => {
                    if infer_pos.is_some() {
                        return Err(InferError::InvalidValue(
                            "reshape target has multiple -1 entries".to_string(),
                        ));
                    }
                    infer_pos = Some(i);
                    out_dims.push(SymExpr::Value(-1));
                }
                Some(0) => {
                    let dim = data_dims
                        .as_ref()
                        .and_then(|dims| dims.get(i).cloned())
                        .ok_or_else(|| {
                            InferError::InvalidValue(
                                "reshape target copies an out-of-range dimension".to_string(),
                            )
                        })?;
                    out_dims.push(dim);
                }
                _ => out_dims.push(val.clone()),
            }
        }

        let Some(data_dims) = data_dims else {
            return Ok([SymTensor::unknown_with_rank(out_dims.len())].into());
        };

        let total = data_dims
            .iter()
            .fold(SymExpr::Value(1), |prod, dim| prod * dim.clone())
            .simplify();

        if let Some(pos) = infer_pos {
            let known = out_dims
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pos)
                .fold(SymExpr::Value(1), |prod, (_, dim)| prod * dim.clone())
                .simplify();
            out_dims[pos] = (total / known).simplify();
        } else if let (Some((factor, vars)), Some(target_total)) = (
            Self::linear_factors(&total),
            out_dims
                .iter()
                .fold(SymExpr::Value(1), |prod, dim| prod * dim.clone())
                .simplify()
                .as_value(),
        ) {
            // A fully literal target pins the element count. If the input
            // element count is a single symbol times a constant, that symbol
            // is thereby forced to a fixed value.
            if let [name] = &vars[..] {
                if factor != 0 && target_total % factor == 0 {
                    ctx.constraints.push(crate::Constraint {
                        name: name.clone(),
                        value: target_total / factor,
                    });
                } else {
                    return Err(InferError::IncompatibleShapes(format!(
                        "cannot reshape {} elements into {}",
                        total, target_total
                    )));
                }
            } else if vars.is_empty() && factor != target_total {
                return Err(InferError::IncompatibleShapes(format!(
                    "cannot reshape {} elements into {}",
                    factor, target_total
                )));
            }
        }

        Ok([SymTensor::from_shape(out_dims).simplify()].into())
    }
}

/// Shape inference for `Transpose`.
pub struct TransposeOp {
    /// Permutation of the input axes, or `None` to reverse them.
    pub perm: Option<Vec<i64>>,
}

impl InferShapes for TransposeOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let Some(data) = inputs.first() else {
            return Err(InferError::IncorrectInputCount);
        };
        let Some(dims) = data.dims() else {
            return Ok([SymTensor::Unknown { rank: data.ndim() }].into());
        };

        let out_dims: Vec<SymExpr> = match &self.perm {
            None => dims.iter().rev().cloned().collect(),
            Some(perm) => {
                if perm.len() != dims.len() {
                    return Err(InferError::IncorrectRank);
                }
                let axes = resolve_axes(dims.len(), perm)?;
                axes.iter().map(|&axis| dims[axis].clone()).collect()
            }
        };
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for `Squeeze`.
pub struct SqueezeOp {
    /// Axes to remove, or `None` to remove all size-1 dimensions.
    pub axes: Option<Vec<i64>>,
}

impl InferShapes for SqueezeOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let Some(data) = inputs.first() else {
            return Err(InferError::IncorrectInputCount);
        };

        // Squeezing a single-element tracked vector yields a tracked scalar.
        if let (Some([value]), None | Some([0])) =
            (data.as_vector(), self.axes.as_deref())
        {
            return Ok([SymTensor::from_scalar(value.clone())].into());
        }

        let Some(dims) = data.dims() else {
            return Ok([SymTensor::unknown()].into());
        };

        let removed: SmallVec<[usize; 4]> = match &self.axes {
            Some(axes) => {
                let resolved = resolve_axes(dims.len(), axes)?;
                for &axis in &resolved {
                    match &dims[axis] {
                        SymExpr::Value(1) => {}
                        SymExpr::Value(v) => {
                            return Err(InferError::InvalidValue(format!(
                                "cannot squeeze axis {} of size {}",
                                axis, v
                            )));
                        }
                        // Squeezing a symbolic axis asserts it is 1.
                        SymExpr::Var(name) => ctx.constraints.push(crate::Constraint {
                            name: name.to_string(),
                            value: 1,
                        }),
                        _ => {}
                    }
                }
                resolved
            }
            None => dims
                .iter()
                .enumerate()
                .filter_map(|(i, dim)| (dim.as_value() == Some(1)).then_some(i))
                .collect(),
        };

        let out_dims: Vec<SymExpr> = dims
            .into_iter()
            .enumerate()
            .filter_map(|(i, dim)| (!removed.contains(&i)).then_some(dim))
            .collect();
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for `Unsqueeze`.
pub struct UnsqueezeOp {
    pub axes: Vec<i64>,
}

impl InferShapes for UnsqueezeOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let Some(data) = inputs.first() else {
            return Err(InferError::IncorrectInputCount);
        };

        // Unsqueezing a tracked scalar yields a tracked single-element
        // vector. This appears in every shape-extraction subgraph.
        if let (Some(value), [0]) = (data.as_scalar(), &self.axes[..]) {
            return Ok([SymTensor::from_vec(vec![value.clone()])].into());
        }

        let Some(dims) = data.dims() else {
            return Ok([match data.ndim() {
                Some(rank) => SymTensor::unknown_with_rank(rank + self.axes.len()),
                None => SymTensor::unknown(),
            }]
            .into());
        };

        let out_rank = dims.len() + self.axes.len();
        let mut inserted = resolve_axes(out_rank, &self.axes)?;
        inserted.sort();

        let mut out_dims = Vec::with_capacity(out_rank);
        let mut next_dim = dims.into_iter();
        for i in 0..out_rank {
            if inserted.contains(&i) {
                out_dims.push(SymExpr::Value(1));
            } else {
                out_dims.push(next_dim.next().ok_or(InferError::IncorrectRank)?);
            }
        }
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for `Shape`.
///
/// The output is a tracked vector holding the input's dimensions, which
/// downstream operators can extract from and recombine.
pub struct ShapeOp;

impl InferShapes for ShapeOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let Some(data) = inputs.first() else {
            return Err(InferError::IncorrectInputCount);
        };
        let out = match data.dims() {
            Some(dims) => SymTensor::from_vec(dims),
            None => SymTensor::unknown_with_rank(1),
        };
        Ok([out].into())
    }
}

/// Shape inference for `Gather`.
pub struct GatherOp {
    pub axis: i64,
}

impl InferShapes for GatherOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let [data, indices] = inputs else {
            return Err(InferError::IncorrectInputCount);
        };

        // Gathering from a tracked vector with constant indices selects the
        // tracked values.
        if let (Some(values), Some(index_vals), 0) =
            (data.as_vector(), indices.to_const_vec(), self.axis)
        {
            let len = values.len() as i64;
            let mut selected = Vec::with_capacity(index_vals.len());
            for index in &index_vals {
                let resolved = if *index < 0 { index + len } else { *index };
                if resolved < 0 || resolved >= len {
                    return Err(InferError::InvalidValue(format!(
                        "gather index {} out of range for length {}",
                        index, len
                    )));
                }
                selected.push(values[resolved as usize].clone());
            }
            let out = match indices.ndim() {
                Some(0) => SymTensor::from_scalar(selected.into_iter().next().unwrap()),
                _ => SymTensor::from_vec(selected),
            };
            return Ok([out].into());
        }

        let (Some(data_dims), Some(index_dims)) = (data.dims(), indices.dims()) else {
            return Ok([SymTensor::unknown()].into());
        };
        let axis = resolve_axis(data_dims.len(), self.axis)?;

        let mut out_dims = Vec::with_capacity(data_dims.len() - 1 + index_dims.len());
        out_dims.extend(data_dims[..axis].iter().cloned());
        out_dims.extend(index_dims);
        out_dims.extend(data_dims[axis + 1..].iter().cloned());
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for `Slice` with unit steps.
pub struct SliceOp {
    pub starts: Vec<i64>,
    pub ends: Vec<i64>,
    /// Axes the bounds apply to, or `None` for the leading axes.
    pub axes: Option<Vec<i64>>,
}

impl SliceOp {
    fn slice_fixed(len: i64, start: i64, end: i64) -> i64 {
        let clamp = |bound: i64| -> i64 {
            let bound = if bound < 0 { bound + len } else { bound };
            bound.clamp(0, len)
        };
        (clamp(end) - clamp(start)).max(0)
    }
}

impl InferShapes for SliceOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let Some(data) = inputs.first() else {
            return Err(InferError::IncorrectInputCount);
        };
        if self.starts.len() != self.ends.len() {
            return Err(InferError::InvalidValue(
                "slice starts and ends differ in length".to_string(),
            ));
        }

        // Slicing a tracked vector keeps the values.
        if let (Some(values), [start], [end], None | Some([0])) = (
            data.as_vector(),
            &self.starts[..],
            &self.ends[..],
            self.axes.as_deref(),
        ) {
            let len = values.len() as i64;
            let resolve = |bound: i64| -> usize {
                let bound = if bound < 0 { bound + len } else { bound };
                bound.clamp(0, len) as usize
            };
            let (start, end) = (resolve(*start), resolve(*end).max(resolve(*start)));
            return Ok([SymTensor::from_vec(values[start..end].to_vec())].into());
        }

        let Some(dims) = data.dims() else {
            return Ok([SymTensor::Unknown { rank: data.ndim() }].into());
        };

        let axes: SmallVec<[usize; 4]> = match &self.axes {
            Some(axes) => resolve_axes(dims.len(), axes)?,
            None => (0..self.starts.len().min(dims.len())).collect(),
        };

        let mut out_dims = dims;
        for (i, &axis) in axes.iter().enumerate() {
            let (start, end) = (self.starts[i], self.ends[i]);
            out_dims[axis] = match out_dims[axis].as_value() {
                Some(len) => SymExpr::Value(Self::slice_fixed(len, start, end)),
                None if start == 0 && end == SLICE_MAX => out_dims[axis].clone(),
                None if end == SLICE_MAX && start > 0 => {
                    (out_dims[axis].clone() - SymExpr::Value(start)).simplify()
                }
                None if start >= 0 && end >= 0 => SymExpr::Value((end - start).max(0)),
                None => out_dims[axis].clone(),
            };
        }
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for spatial windowed operators (`Conv`, `MaxPool`).
///
/// The output size of each spatial dimension is
/// `(input + pad_begin + pad_end - kernel) / stride + 1`, which stays
/// symbolic when the input size does.
fn windowed_spatial_dims(
    spatial: &[SymExpr],
    kernel: &[SymExpr],
    strides: Option<&[i64]>,
    pads: Option<&[i64]>,
) -> Result<Vec<SymExpr>, InferError> {
    let rank = spatial.len();
    if kernel.len() != rank {
        return Err(InferError::IncorrectRank);
    }
    if let Some(strides) = strides {
        if strides.len() != rank {
            return Err(InferError::InvalidValue("wrong stride count".to_string()));
        }
    }
    if let Some(pads) = pads {
        if pads.len() != 2 * rank {
            return Err(InferError::InvalidValue("wrong pad count".to_string()));
        }
    }

    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let stride = strides.map(|s| s[i]).unwrap_or(1);
        let pad = pads.map(|p| p[i] + p[i + rank]).unwrap_or(0);
        if stride <= 0 {
            return Err(InferError::InvalidValue("stride must be positive".to_string()));
        }
        let padded = spatial[i].clone() + SymExpr::Value(pad) - kernel[i].clone();
        let dim = padded / SymExpr::Value(stride) + SymExpr::Value(1);
        out.push(dim.simplify());
    }
    Ok(out)
}

/// Shape inference for `Conv`.
pub struct ConvOp {
    pub strides: Option<Vec<i64>>,
    pub pads: Option<Vec<i64>>,
}

impl InferShapes for ConvOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        if inputs.len() < 2 {
            return Err(InferError::IncorrectInputCount);
        }
        let (data, weight) = (&inputs[0], &inputs[1]);

        let (Some(data_dims), Some(weight_dims)) = (data.dims(), weight.dims()) else {
            return Ok([SymTensor::Unknown { rank: data.ndim() }].into());
        };
        if data_dims.len() < 3 || weight_dims.len() != data_dims.len() {
            return Err(InferError::IncorrectRank);
        }

        let spatial = windowed_spatial_dims(
            &data_dims[2..],
            &weight_dims[2..],
            self.strides.as_deref(),
            self.pads.as_deref(),
        )?;

        let mut out_dims = vec![data_dims[0].clone(), weight_dims[0].clone()];
        out_dims.extend(spatial);
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for `MaxPool`.
pub struct PoolOp {
    pub kernel_shape: Vec<i64>,
    pub strides: Option<Vec<i64>>,
    pub pads: Option<Vec<i64>>,
}

impl InferShapes for PoolOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let Some(data) = inputs.first() else {
            return Err(InferError::IncorrectInputCount);
        };
        let Some(data_dims) = data.dims() else {
            return Ok([SymTensor::Unknown { rank: data.ndim() }].into());
        };
        if data_dims.len() < 3 {
            return Err(InferError::IncorrectRank);
        }

        let kernel: Vec<SymExpr> = self
            .kernel_shape
            .iter()
            .map(|&k| SymExpr::Value(k))
            .collect();
        let spatial = windowed_spatial_dims(
            &data_dims[2..],
            &kernel,
            self.strides.as_deref(),
            self.pads.as_deref(),
        )?;

        let mut out_dims = vec![data_dims[0].clone(), data_dims[1].clone()];
        out_dims.extend(spatial);
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

#[cfg(test)]
mod tests {
    use graphport_testing::TestCases;

    use super::{
        ConcatOp, ConvOp, GatherOp, PoolOp, ReshapeOp, ShapeOp, SliceOp, SqueezeOp,
        TransposeOp, UnsqueezeOp, SLICE_MAX,
    };
    use crate::infer_shapes::{InferCtx, InferError, InferShapes};
    use crate::sym_expr::SymExpr;
    use crate::sym_tensor::SymTensor;

    fn shape(dims: &[SymExpr]) -> SymTensor {
        SymTensor::from_shape(dims.to_vec())
    }

    #[test]
    fn test_concat_symbolic_axis() {
        let mut ctx = InferCtx::new();
        let a = shape(&["batch".into(), 4usize.into()]);
        let b = shape(&["batch".into(), 6usize.into()]);
        let out = ConcatOp { axis: 1 }
            .infer_shapes(&[a, b], &mut ctx)
            .unwrap();
        assert_eq!(out, vec![shape(&["batch".into(), 10usize.into()])]);

        // Concatenation along a symbolic axis yields a symbolic sum.
        let mut ctx = InferCtx::new();
        let a = shape(&["m".into(), 4usize.into()]);
        let b = shape(&["n".into(), 4usize.into()]);
        let out = ConcatOp { axis: 0 }
            .infer_shapes(&[a, b], &mut ctx)
            .unwrap();
        let sum = (SymExpr::var("m") + SymExpr::var("n")).simplify();
        assert_eq!(out, vec![shape(&[sum, 4usize.into()])]);
    }

    #[test]
    fn test_concat_tracked_vectors() {
        let mut ctx = InferCtx::new();
        let a = SymTensor::from_vec(vec!["batch".into()]);
        let b = SymTensor::from_vec(vec![3usize.into(), 640usize.into()]);
        let out = ConcatOp { axis: 0 }
            .infer_shapes(&[a, b], &mut ctx)
            .unwrap();
        assert_eq!(
            out,
            vec![SymTensor::from_vec(vec![
                "batch".into(),
                3usize.into(),
                640usize.into()
            ])]
        );
    }

    #[test]
    fn test_reshape_with_inferred_dim() {
        let mut ctx = InferCtx::new();
        let data = shape(&["batch".into(), 3usize.into(), 4usize.into()]);
        let target = SymTensor::from_vec(vec![SymExpr::Value(-1), 12usize.into()]);
        let out = ReshapeOp.infer_shapes(&[data, target], &mut ctx).unwrap();
        assert_eq!(out, vec![shape(&["batch".into(), 12usize.into()])]);
    }

    #[test]
    fn test_reshape_literal_pins_symbol() {
        let mut ctx = InferCtx::new();
        let data = shape(&["batch".into(), 3usize.into()]);
        let target = SymTensor::from_vec(vec![15usize.into()]);
        ReshapeOp.infer_shapes(&[data, target], &mut ctx).unwrap();
        assert_eq!(ctx.constraints.len(), 1);
        assert_eq!(ctx.constraints[0].name, "batch");
        assert_eq!(ctx.constraints[0].value, 5);
    }

    #[test]
    fn test_reshape_indivisible_literal() {
        let mut ctx = InferCtx::new();
        let data = shape(&["batch".into(), 3usize.into()]);
        let target = SymTensor::from_vec(vec![16usize.into()]);
        let err = ReshapeOp
            .infer_shapes(&[data, target], &mut ctx)
            .err()
            .unwrap();
        assert!(matches!(err, InferError::IncompatibleShapes(_)));
    }

    #[test]
    fn test_transpose() {
        #[derive(Clone, Debug)]
        struct Case {
            perm: Option<Vec<i64>>,
            expected: SymTensor,
        }

        let cases = [
            Case {
                perm: None,
                expected: shape(&[4usize.into(), 3usize.into(), "batch".into()]),
            },
            Case {
                perm: Some(vec![0, 2, 1]),
                expected: shape(&["batch".into(), 4usize.into(), 3usize.into()]),
            },
        ];

        cases.test_each_clone(|case| {
            let mut ctx = InferCtx::new();
            let data = shape(&["batch".into(), 3usize.into(), 4usize.into()]);
            let out = TransposeOp { perm: case.perm }
                .infer_shapes(&[data], &mut ctx)
                .unwrap();
            assert_eq!(out, vec![case.expected]);
        });
    }

    #[test]
    fn test_shape_extraction_subgraph() {
        // S = Shape(x); B = Gather(S, 0); BV = Unsqueeze(B, [0]);
        // S2 = Concat(BV, [9]), the usual dynamic-reshape prelude.
        let mut ctx = InferCtx::new();
        let x = shape(&["batch".into(), 3usize.into(), 3usize.into()]);

        let s = ShapeOp.infer_shapes(&[x], &mut ctx).unwrap().remove(0);
        assert_eq!(
            s,
            SymTensor::from_vec(vec!["batch".into(), 3usize.into(), 3usize.into()])
        );

        let indices = SymTensor::from_scalar(SymExpr::Value(0));
        let b = GatherOp { axis: 0 }
            .infer_shapes(&[s, indices], &mut ctx)
            .unwrap()
            .remove(0);
        assert_eq!(b, SymTensor::from_scalar("batch".into()));

        let bv = UnsqueezeOp { axes: vec![0] }
            .infer_shapes(&[b], &mut ctx)
            .unwrap()
            .remove(0);
        assert_eq!(bv, SymTensor::from_vec(vec!["batch".into()]));

        let nine = SymTensor::from_vec(vec![9usize.into()]);
        let s2 = ConcatOp { axis: 0 }
            .infer_shapes(&[bv, nine], &mut ctx)
            .unwrap()
            .remove(0);
        assert_eq!(
            s2,
            SymTensor::from_vec(vec!["batch".into(), 9usize.into()])
        );
        assert!(ctx.constraints.is_empty());
    }

    #[test]
    fn test_squeeze_unsqueeze() {
        let mut ctx = InferCtx::new();
        let data = shape(&[1usize.into(), "batch".into(), 1usize.into()]);
        let out = SqueezeOp { axes: None }
            .infer_shapes(&[data], &mut ctx)
            .unwrap();
        assert_eq!(out, vec![shape(&["batch".into()])]);

        let data = shape(&["batch".into(), 4usize.into()]);
        let out = UnsqueezeOp { axes: vec![1] }
            .infer_shapes(&[data], &mut ctx)
            .unwrap();
        assert_eq!(
            out,
            vec![shape(&["batch".into(), 1usize.into(), 4usize.into()])]
        );
    }

    #[test]
    fn test_slice() {
        let mut ctx = InferCtx::new();
        let data = shape(&["batch".into(), 10usize.into()]);
        let out = SliceOp {
            starts: vec![2],
            ends: vec![8],
            axes: Some(vec![1]),
        }
        .infer_shapes(&[data], &mut ctx)
        .unwrap();
        assert_eq!(out, vec![shape(&["batch".into(), 6usize.into()])]);

        // Slicing a symbolic dim to the end subtracts the start.
        let mut ctx = InferCtx::new();
        let data = shape(&["len".into()]);
        let out = SliceOp {
            starts: vec![1],
            ends: vec![SLICE_MAX],
            axes: None,
        }
        .infer_shapes(&[data], &mut ctx)
        .unwrap();
        let expected = (SymExpr::var("len") - SymExpr::Value(1)).simplify();
        assert_eq!(out, vec![shape(&[expected])]);
    }

    #[test]
    fn test_conv_and_pool() {
        let mut ctx = InferCtx::new();
        let data = shape(&[
            "batch".into(),
            3usize.into(),
            640usize.into(),
            640usize.into(),
        ]);
        let weight = shape(&[
            16usize.into(),
            3usize.into(),
            3usize.into(),
            3usize.into(),
        ]);
        let out = ConvOp {
            strides: Some(vec![2, 2]),
            pads: Some(vec![1, 1, 1, 1]),
        }
        .infer_shapes(&[data, weight], &mut ctx)
        .unwrap();
        assert_eq!(
            out,
            vec![shape(&[
                "batch".into(),
                16usize.into(),
                320usize.into(),
                320usize.into()
            ])]
        );

        let mut ctx = InferCtx::new();
        let data = shape(&[
            "batch".into(),
            16usize.into(),
            "h".into(),
            320usize.into(),
        ]);
        let out = PoolOp {
            kernel_shape: vec![2, 2],
            strides: Some(vec![2, 2]),
            pads: None,
        }
        .infer_shapes(&[data], &mut ctx)
        .unwrap();
        let h_out = ((SymExpr::var("h") - SymExpr::Value(2)) / SymExpr::Value(2)
            + SymExpr::Value(1))
        .simplify();
        assert_eq!(
            out,
            vec![shape(&[
                "batch".into(),
                16usize.into(),
                h_out,
                160usize.into()
            ])]
        );
    }
}
