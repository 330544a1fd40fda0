//! Symbolic shape inference for model graphs.
//!
//! # About shape inference
//!
//! Exporting a graph with dynamic axes requires knowing how every operator
//! transforms the shapes of its inputs. When an input dimension is replaced
//! by a named symbol such as `"batch"`, downstream shapes become symbolic
//! expressions over that symbol (`"batch"`, `"batch" * 2`, …) rather than
//! concrete sizes.
//!
//! As an example, suppose a model has an image input of shape
//! `(batch, 3, height, width)` and derives a mask shape from it:
//!
//! ```text
//! S = Shape(Image)                 // ["batch", 3, "height", "width"]
//! B = Gather(S, axis=0, index=0)   // "batch"
//! BV = Unsqueeze(B, axes=[0])      // ["batch"]
//! ```
//!
//! Inference follows both the *shapes* of values and, for operators that
//! manipulate shape vectors, their *values*, so that subgraphs like the one
//! above generalize correctly.
//!
//! # Crate overview
//!
//! The main export is the [`InferShapes`] trait, plus the types implementing
//! it for families of operators in [`ops`] and [`infer_shapes`]. Shapes and
//! values are represented by [`SymTensor`], whose elements are symbolic
//! integer expressions ([`SymExpr`]).
//!
//! When propagation algebraically pins a named symbol to a concrete value
//! (for example broadcasting `"batch"` against a fixed dimension of size 4),
//! the rule records a [`Constraint`] in the [`InferCtx`] instead of failing.
//! Deciding whether such a constraint is acceptable is left to the caller.

mod infer_shapes;
pub mod ops;
mod sym_expr;
mod sym_gen;
mod sym_tensor;

pub use infer_shapes::{
    BinaryOp, Constraint, InferCtx, InferError, InferShapes, MatMulOp, ReduceOp, UnaryOp,
};
pub use sym_expr::SymExpr;
pub use sym_gen::SymbolGen;
pub use sym_tensor::SymTensor;
