//! Traits for shape inference and implementations shared by many operators.

use smallvec::SmallVec;

use crate::sym_expr::SymExpr;
use crate::sym_gen::SymbolGen;
use crate::sym_tensor::SymTensor;

/// Errors produced when inferring the output shapes of an operator.
#[derive(Clone, Debug, PartialEq)]
pub enum InferError {
    /// Too many or too few inputs were provided for this operator.
    IncorrectInputCount,

    /// The input shapes are incompatible. Operator execution would fail if
    /// given inputs with these shapes.
    IncompatibleShapes(String),

    /// An input's rank does not match that expected by the operator.
    IncorrectRank,

    /// An operator input or attribute has an invalid value.
    InvalidValue(String),
}

impl std::fmt::Display for InferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferError::IncorrectInputCount => write!(f, "incorrect input count"),
            InferError::IncompatibleShapes(msg) => write!(f, "incompatible shapes: {}", msg),
            InferError::IncorrectRank => write!(f, "incorrect input rank"),
            InferError::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
        }
    }
}

impl std::error::Error for InferError {}

/// A fact, derived during propagation, that a named symbol must equal a
/// concrete value for the graph to execute.
#[derive(Clone, Debug, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub value: i64,
}

/// State shared by shape inference rules while walking a graph.
pub struct InferCtx {
    /// Generator for fresh symbols representing unknown sizes.
    pub syms: SymbolGen,

    /// Symbol bindings implied by operators seen so far.
    pub constraints: Vec<Constraint>,
}

impl InferCtx {
    pub fn new() -> InferCtx {
        InferCtx {
            syms: SymbolGen::with_prefix("dyn"),
            constraints: Vec::new(),
        }
    }

    fn pin(&mut self, name: &str, value: i64) {
        self.constraints.push(Constraint {
            name: name.to_string(),
            value,
        });
    }
}

impl Default for InferCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Infer the shapes of an operator's outputs given its inputs.
pub trait InferShapes {
    /// Infer the shapes, and where possible values, of an operator's outputs.
    ///
    /// Rules that cannot determine an output shape return
    /// [`SymTensor::unknown`] variants rather than failing; errors are
    /// reserved for inputs the operator could never execute with.
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError>;
}

/// Broadcast two dimension lists together following standard multidirectional
/// broadcasting rules, recording constraints for symbols broadcast against
/// fixed sizes.
pub(crate) fn broadcast_dims(
    a_dims: &[SymExpr],
    b_dims: &[SymExpr],
    ctx: &mut InferCtx,
) -> Result<Vec<SymExpr>, InferError> {
    let a_pad = b_dims.len().saturating_sub(a_dims.len());
    let b_pad = a_dims.len().saturating_sub(b_dims.len());
    let one = SymExpr::Value(1);

    let a_iter = std::iter::repeat(&one).take(a_pad).chain(a_dims.iter());
    let b_iter = std::iter::repeat(&one).take(b_pad).chain(b_dims.iter());

    let mut out_dims = Vec::with_capacity(a_pad + a_dims.len());
    for (a, b) in a_iter.zip(b_iter) {
        let dim = match (a, b) {
            (a, b) if a == b => a.clone(),
            (SymExpr::Value(1), b) => b.clone(),
            (a, SymExpr::Value(1)) => a.clone(),
            // Two fixed, different, non-1 sizes can never broadcast.
            (SymExpr::Value(x), SymExpr::Value(y)) => {
                return Err(InferError::IncompatibleShapes(format!(
                    "cannot broadcast {} against {}",
                    x, y
                )));
            }
            // A symbol broadcast against a fixed non-1 size is thereby pinned
            // to that size.
            (SymExpr::Var(name), SymExpr::Value(v)) => {
                ctx.pin(name, *v);
                SymExpr::Value(*v)
            }
            (SymExpr::Value(v), SymExpr::Var(name)) => {
                ctx.pin(name, *v);
                SymExpr::Value(*v)
            }
            (a, b) => a.broadcast(b).simplify(),
        };
        out_dims.push(dim);
    }
    Ok(out_dims)
}

/// Resolve an axis given as a value in `[-ndim, ndim-1]` to the zero-based
/// dimension of a tensor with `ndim` dimensions.
pub(crate) fn resolve_axis(ndim: usize, axis: i64) -> Result<usize, InferError> {
    let ndim = ndim as i64;
    if axis < -ndim || axis >= ndim {
        return Err(InferError::IncorrectRank);
    }
    if axis >= 0 {
        Ok(axis as usize)
    } else {
        Ok((ndim + axis) as usize)
    }
}

/// Resolve a sequence of axis values to zero-based dimension indexes.
pub(crate) fn resolve_axes(
    ndim: usize,
    axes: &[i64],
) -> Result<SmallVec<[usize; 4]>, InferError> {
    let mut resolved: SmallVec<[usize; 4]> = SmallVec::with_capacity(axes.len());
    for &axis in axes {
        resolved.push(resolve_axis(ndim, axis)?);
    }
    Ok(resolved)
}

/// Shape inference for unary operators.
///
/// These take at least one input and return a single output with the same
/// shape as the first input.
pub struct UnaryOp;

impl InferShapes for UnaryOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let Some(data) = inputs.first() else {
            return Err(InferError::IncorrectInputCount);
        };

        let out = match data.dims() {
            Some(dims) => SymTensor::from_shape(dims),
            None => SymTensor::Unknown { rank: data.ndim() },
        };
        Ok([out].into())
    }
}

/// Shape inference for binary operators.
///
/// The output shape is the result of broadcasting the two input shapes
/// together. When both inputs carry symbolic values and a combining function
/// is configured, the output values are computed elementwise, which allows
/// arithmetic on extracted shape vectors to be followed.
pub struct BinaryOp {
    combine: Option<fn(SymExpr, SymExpr) -> SymExpr>,
}

impl BinaryOp {
    /// A binary operator whose effect on values is not tracked.
    pub fn plain() -> BinaryOp {
        BinaryOp { combine: None }
    }

    /// A binary operator which applies `combine` to its elements.
    pub fn arith(combine: fn(SymExpr, SymExpr) -> SymExpr) -> BinaryOp {
        BinaryOp {
            combine: Some(combine),
        }
    }
}

impl InferShapes for BinaryOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let [a, b] = inputs else {
            return Err(InferError::IncorrectInputCount);
        };

        // Track values through arithmetic on scalars and vectors, so shape
        // computations like `width / 2` stay symbolic.
        if let (Some(combine), Some(a_vals), Some(b_vals)) =
            (self.combine, a.values(), b.values())
        {
            let combined: Option<Vec<SymExpr>> = match (a_vals.len(), b_vals.len()) {
                (x, y) if x == y => Some(
                    a_vals
                        .iter()
                        .zip(b_vals)
                        .map(|(a, b)| combine(a.clone(), b.clone()).simplify())
                        .collect(),
                ),
                (_, 1) => Some(
                    a_vals
                        .iter()
                        .map(|a| combine(a.clone(), b_vals[0].clone()).simplify())
                        .collect(),
                ),
                (1, _) => Some(
                    b_vals
                        .iter()
                        .map(|b| combine(a_vals[0].clone(), b.clone()).simplify())
                        .collect(),
                ),
                _ => None,
            };
            if let Some(values) = combined {
                let out = match (a, b) {
                    (SymTensor::Scalar(_), SymTensor::Scalar(_)) => {
                        SymTensor::from_scalar(values.into_iter().next().unwrap())
                    }
                    _ => SymTensor::from_vec(values),
                };
                return Ok([out].into());
            }
        }

        let (Some(a_dims), Some(b_dims)) = (a.dims(), b.dims()) else {
            let rank = match (a.ndim(), b.ndim()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
            return Ok([SymTensor::Unknown { rank }].into());
        };

        let out_dims = broadcast_dims(&a_dims, &b_dims, ctx)?;
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for matrix multiplication.
pub struct MatMulOp;

impl InferShapes for MatMulOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        // Fused variants may carry a trailing bias input; only the first two
        // inputs determine the output shape.
        if inputs.len() < 2 {
            return Err(InferError::IncorrectInputCount);
        }
        let (a, b) = (&inputs[0], &inputs[1]);

        let (Some(a_dims), Some(b_dims)) = (a.dims(), b.dims()) else {
            return Ok([SymTensor::unknown()].into());
        };
        if a_dims.len() < 2 || b_dims.len() < 2 {
            return Err(InferError::IncorrectRank);
        }

        let (a_batch, a_mat) = a_dims.split_at(a_dims.len() - 2);
        let (b_batch, b_mat) = b_dims.split_at(b_dims.len() - 2);

        // Inner dimensions must agree.
        match (&a_mat[1], &b_mat[0]) {
            (a, b) if a == b => {}
            (SymExpr::Value(x), SymExpr::Value(y)) => {
                return Err(InferError::IncompatibleShapes(format!(
                    "matmul inner dims {} and {} differ",
                    x, y
                )));
            }
            (SymExpr::Var(name), SymExpr::Value(v)) | (SymExpr::Value(v), SymExpr::Var(name)) => {
                ctx.pin(name, *v);
            }
            _ => {}
        }

        let mut out_dims = broadcast_dims(a_batch, b_batch, ctx)?;
        out_dims.push(a_mat[0].clone());
        out_dims.push(b_mat[1].clone());
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

/// Shape inference for reduction operators.
pub struct ReduceOp {
    /// Axes over which the reduction is applied, or `None` to reduce all.
    pub axes: Option<Vec<i64>>,

    /// True if reduced dimensions are retained with size 1.
    pub keep_dims: bool,
}

impl InferShapes for ReduceOp {
    fn infer_shapes(
        &self,
        inputs: &[SymTensor],
        _ctx: &mut InferCtx,
    ) -> Result<Vec<SymTensor>, InferError> {
        let Some(data) = inputs.first() else {
            return Err(InferError::IncorrectInputCount);
        };
        let Some(dims) = data.dims() else {
            return Ok([SymTensor::unknown()].into());
        };

        let ndim = dims.len();
        let mut axes = match &self.axes {
            Some(axes) => resolve_axes(ndim, axes)?,
            None => (0..ndim).collect(),
        };
        axes.sort();
        axes.dedup();

        let mut out_dims = Vec::new();
        for (i, dim) in dims.into_iter().enumerate() {
            if !axes.contains(&i) {
                out_dims.push(dim);
            } else if self.keep_dims {
                out_dims.push(SymExpr::Value(1));
            }
        }
        Ok([SymTensor::from_shape(out_dims)].into())
    }
}

#[cfg(test)]
mod tests {
    use graphport_testing::TestCases;

    use super::{BinaryOp, InferCtx, InferError, InferShapes, MatMulOp, ReduceOp, UnaryOp};
    use crate::sym_expr::SymExpr;
    use crate::sym_tensor::SymTensor;

    fn shape(dims: &[SymExpr]) -> SymTensor {
        SymTensor::from_shape(dims.to_vec())
    }

    #[test]
    fn test_unary_op() {
        let mut ctx = InferCtx::new();
        let input = shape(&["batch".into(), 16usize.into()]);
        let out = UnaryOp.infer_shapes(&[input.clone()], &mut ctx).unwrap();
        assert_eq!(out, vec![input]);

        let err = UnaryOp.infer_shapes(&[], &mut ctx).err().unwrap();
        assert_eq!(err, InferError::IncorrectInputCount);
    }

    #[test]
    fn test_binary_op_broadcast() {
        #[derive(Clone, Debug)]
        struct Case {
            lhs: SymTensor,
            rhs: SymTensor,
            expected: SymTensor,
        }

        let cases = [
            Case {
                lhs: shape(&["batch".into(), 4usize.into()]),
                rhs: shape(&["batch".into(), 4usize.into()]),
                expected: shape(&["batch".into(), 4usize.into()]),
            },
            // Scalar-style broadcast against size-1 dims.
            Case {
                lhs: shape(&[1usize.into(), 5usize.into()]),
                rhs: shape(&[4usize.into(), 1usize.into()]),
                expected: shape(&[4usize.into(), 5usize.into()]),
            },
            // Rank promotion.
            Case {
                lhs: shape(&["batch".into(), 3usize.into(), 8usize.into()]),
                rhs: shape(&[8usize.into()]),
                expected: shape(&["batch".into(), 3usize.into(), 8usize.into()]),
            },
        ];

        cases.test_each_clone(|case| {
            let mut ctx = InferCtx::new();
            let out = BinaryOp::plain()
                .infer_shapes(&[case.lhs, case.rhs], &mut ctx)
                .unwrap();
            assert_eq!(out, vec![case.expected]);
        });
    }

    #[test]
    fn test_binary_op_incompatible() {
        let mut ctx = InferCtx::new();
        let err = BinaryOp::plain()
            .infer_shapes(
                &[shape(&[5usize.into()]), shape(&[3usize.into()])],
                &mut ctx,
            )
            .err()
            .unwrap();
        assert!(matches!(err, InferError::IncompatibleShapes(_)));
    }

    #[test]
    fn test_binary_op_pins_symbol() {
        let mut ctx = InferCtx::new();
        let out = BinaryOp::plain()
            .infer_shapes(
                &[shape(&["batch".into()]), shape(&[4usize.into()])],
                &mut ctx,
            )
            .unwrap();
        assert_eq!(out, vec![shape(&[4usize.into()])]);
        assert_eq!(ctx.constraints.len(), 1);
        assert_eq!(ctx.constraints[0].name, "batch");
        assert_eq!(ctx.constraints[0].value, 4);
    }

    #[test]
    fn test_binary_op_tracks_values() {
        let mut ctx = InferCtx::new();
        let dims = SymTensor::from_vec(vec!["batch".into(), 640usize.into()]);
        let two = SymTensor::from_scalar(2i64.into());
        let out = BinaryOp::arith(|a, b| a / b)
            .infer_shapes(&[dims, two], &mut ctx)
            .unwrap();
        let expected = SymTensor::from_vec(vec![
            SymExpr::var("batch") / SymExpr::Value(2),
            320usize.into(),
        ]);
        assert_eq!(out, vec![expected]);
    }

    #[test]
    fn test_matmul() {
        let mut ctx = InferCtx::new();
        let a = shape(&["batch".into(), 12usize.into(), 64usize.into()]);
        let b = shape(&[64usize.into(), 32usize.into()]);
        let out = MatMulOp.infer_shapes(&[a, b], &mut ctx).unwrap();
        assert_eq!(
            out,
            vec![shape(&["batch".into(), 12usize.into(), 32usize.into()])]
        );
    }

    #[test]
    fn test_matmul_inner_dim_mismatch() {
        let mut ctx = InferCtx::new();
        let a = shape(&[2usize.into(), 3usize.into()]);
        let b = shape(&[4usize.into(), 5usize.into()]);
        let err = MatMulOp.infer_shapes(&[a, b], &mut ctx).err().unwrap();
        assert!(matches!(err, InferError::IncompatibleShapes(_)));
    }

    #[test]
    fn test_reduce() {
        #[derive(Clone, Debug)]
        struct Case {
            axes: Option<Vec<i64>>,
            keep_dims: bool,
            expected: SymTensor,
        }

        let cases = [
            Case {
                axes: Some(vec![1]),
                keep_dims: false,
                expected: shape(&["batch".into(), 5usize.into()]),
            },
            Case {
                axes: Some(vec![-1]),
                keep_dims: true,
                expected: shape(&["batch".into(), 4usize.into(), 1usize.into()]),
            },
            Case {
                axes: None,
                keep_dims: false,
                expected: shape(&[]),
            },
        ];

        cases.test_each_clone(|case| {
            let mut ctx = InferCtx::new();
            let input = shape(&["batch".into(), 4usize.into(), 5usize.into()]);
            let op = ReduceOp {
                axes: case.axes,
                keep_dims: case.keep_dims,
            };
            let out = op.infer_shapes(&[input], &mut ctx).unwrap();
            assert_eq!(out, vec![case.expected]);
        });
    }
}
