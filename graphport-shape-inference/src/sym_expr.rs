//! Symbolic expressions representing integer dimension sizes.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::sync::Arc;

/// Symbolic expression representing an integer value.
///
/// Expressions can be known integer values, named symbols or composite
/// expressions. Dimension sizes are assumed to be non-negative.
#[derive(Clone, Debug, PartialEq)]
pub enum SymExpr {
    /// Element with a known integer value.
    Value(i64),
    /// Named symbolic value.
    Var(Arc<str>),
    /// Addition of two symbolic values.
    Add(Arc<SymExpr>, Arc<SymExpr>),
    /// Subtraction of two symbolic values.
    Sub(Arc<SymExpr>, Arc<SymExpr>),
    /// Multiplication of two symbolic values.
    Mul(Arc<SymExpr>, Arc<SymExpr>),
    /// Flooring division of the first expression by the second.
    Div(Arc<SymExpr>, Arc<SymExpr>),
    /// Maximum of two symbolic values.
    Max(Arc<SymExpr>, Arc<SymExpr>),
    /// Result of broadcasting two symbolic values.
    ///
    /// This behaves like `Max`, except it implies that the two values are
    /// either equal or one of them is 1.
    Broadcast(Arc<SymExpr>, Arc<SymExpr>),
}

impl SymExpr {
    /// Create a named symbol.
    pub fn var(name: &str) -> SymExpr {
        SymExpr::Var(name.into())
    }

    /// Return the known integer value of this expression, if it has one.
    pub fn as_value(&self) -> Option<i64> {
        match self {
            SymExpr::Value(v) => Some(*v),
            _ => None,
        }
    }

    /// Return the symbol name if this expression is a plain variable.
    pub fn var_name(&self) -> Option<&str> {
        match self {
            SymExpr::Var(name) => Some(name),
            _ => None,
        }
    }

    /// Return the maximum of `self` and `other`.
    pub fn max(&self, other: &SymExpr) -> SymExpr {
        SymExpr::Max(self.clone().into(), other.clone().into())
    }

    /// Return the result of broadcasting `self` and `other`.
    pub fn broadcast(&self, other: &SymExpr) -> SymExpr {
        SymExpr::Broadcast(self.clone().into(), other.clone().into())
    }

    /// Evaluate this expression under a binding of symbol names to values.
    ///
    /// Returns `None` if a symbol is unbound or a division by zero occurs.
    pub fn eval(&self, bindings: &dyn Fn(&str) -> Option<i64>) -> Option<i64> {
        match self {
            SymExpr::Value(v) => Some(*v),
            SymExpr::Var(name) => bindings(name),
            SymExpr::Add(a, b) => Some(a.eval(bindings)? + b.eval(bindings)?),
            SymExpr::Sub(a, b) => Some(a.eval(bindings)? - b.eval(bindings)?),
            SymExpr::Mul(a, b) => Some(a.eval(bindings)? * b.eval(bindings)?),
            SymExpr::Div(a, b) => {
                let divisor = b.eval(bindings)?;
                if divisor == 0 {
                    None
                } else {
                    Some(a.eval(bindings)?.div_euclid(divisor))
                }
            }
            SymExpr::Max(a, b) => Some(a.eval(bindings)?.max(b.eval(bindings)?)),
            SymExpr::Broadcast(a, b) => {
                let a = a.eval(bindings)?;
                let b = b.eval(bindings)?;
                Some(a.max(b))
            }
        }
    }

    /// Replace occurrences of the symbol `name` with a fixed value.
    pub fn substitute(&self, name: &str, value: i64) -> SymExpr {
        let subst =
            |x: &Arc<SymExpr>| -> Arc<SymExpr> { Arc::new(x.substitute(name, value)) };
        match self {
            SymExpr::Value(_) => self.clone(),
            SymExpr::Var(n) => {
                if &**n == name {
                    SymExpr::Value(value)
                } else {
                    self.clone()
                }
            }
            SymExpr::Add(a, b) => SymExpr::Add(subst(a), subst(b)),
            SymExpr::Sub(a, b) => SymExpr::Sub(subst(a), subst(b)),
            SymExpr::Mul(a, b) => SymExpr::Mul(subst(a), subst(b)),
            SymExpr::Div(a, b) => SymExpr::Div(subst(a), subst(b)),
            SymExpr::Max(a, b) => SymExpr::Max(subst(a), subst(b)),
            SymExpr::Broadcast(a, b) => SymExpr::Broadcast(subst(a), subst(b)),
        }
    }

    /// Simplify an expression.
    ///
    /// This folds constant subexpressions, removes identities (eg. `x + 0`
    /// becomes `x`) and puts the operands of commutative operations in a
    /// canonical order, so that equal expressions built in different orders
    /// compare equal.
    pub fn simplify(&self) -> SymExpr {
        match self {
            SymExpr::Value(_) | SymExpr::Var(_) => self.clone(),
            SymExpr::Add(a, b) => {
                let (a, b) = order_commutative(a.simplify(), b.simplify());
                match (a, b) {
                    (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x + y),
                    (SymExpr::Value(0), x) => x,
                    // Fold the constant into a nested sum: `a + (b + x)` =>
                    // `(a + b) + x`.
                    (SymExpr::Value(x), SymExpr::Add(lhs, rhs)) => {
                        if let SymExpr::Value(y) = &*lhs {
                            SymExpr::Add(SymExpr::Value(x + y).into(), rhs)
                        } else {
                            SymExpr::Add(
                                SymExpr::Value(x).into(),
                                SymExpr::Add(lhs, rhs).into(),
                            )
                        }
                    }
                    (a, b) => SymExpr::Add(a.into(), b.into()),
                }
            }
            SymExpr::Sub(a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                match (a, b) {
                    (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x - y),
                    (a, SymExpr::Value(0)) => a,
                    (a, b) if a == b => SymExpr::Value(0),
                    (a, b) => SymExpr::Sub(a.into(), b.into()),
                }
            }
            SymExpr::Mul(a, b) => {
                let (a, b) = order_commutative(a.simplify(), b.simplify());
                match (a, b) {
                    (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x * y),
                    (SymExpr::Value(0), _) => SymExpr::Value(0),
                    (SymExpr::Value(1), x) => x,
                    (SymExpr::Value(x), SymExpr::Mul(lhs, rhs)) => {
                        if let SymExpr::Value(y) = &*lhs {
                            SymExpr::Mul(SymExpr::Value(x * y).into(), rhs)
                        } else {
                            SymExpr::Mul(
                                SymExpr::Value(x).into(),
                                SymExpr::Mul(lhs, rhs).into(),
                            )
                        }
                    }
                    (a, b) => SymExpr::Mul(a.into(), b.into()),
                }
            }
            SymExpr::Div(a, b) => {
                let (a, b) = remove_common_factors(a.simplify(), b.simplify());
                match (a, b) {
                    (SymExpr::Value(x), SymExpr::Value(y)) if y != 0 => {
                        SymExpr::Value(x.div_euclid(y))
                    }
                    (a, SymExpr::Value(1)) => a,
                    (a, b) if a == b => SymExpr::Value(1),
                    (a, b) => SymExpr::Div(a.into(), b.into()),
                }
            }
            SymExpr::Max(a, b) => {
                let (a, b) = order_commutative(a.simplify(), b.simplify());
                match (a, b) {
                    (SymExpr::Value(x), SymExpr::Value(y)) => SymExpr::Value(x.max(y)),
                    (a, b) if a == b => a,
                    (a, b) => SymExpr::Max(a.into(), b.into()),
                }
            }
            SymExpr::Broadcast(a, b) => {
                let (a, b) = order_commutative(a.simplify(), b.simplify());
                match (a, b) {
                    (SymExpr::Value(x), SymExpr::Value(y)) if x == y => SymExpr::Value(x),
                    (SymExpr::Value(1), x) => x,
                    (x, SymExpr::Value(1)) => x,
                    // A fixed size other than 1 dominates: broadcasting can
                    // only succeed if the other side is 1 or equal to it.
                    (SymExpr::Value(x), _) => SymExpr::Value(x),
                    (_, SymExpr::Value(y)) => SymExpr::Value(y),
                    (a, b) if a == b => a,
                    (a, b) => SymExpr::Broadcast(a.into(), b.into()),
                }
            }
        }
    }

    /// Return the precedence of the operator, used to add parentheses when
    /// formatting an expression tree.
    fn precedence(&self) -> u8 {
        match self {
            SymExpr::Value(_) | SymExpr::Var(_) | SymExpr::Max(..) | SymExpr::Broadcast(..) => 3,
            SymExpr::Mul(..) | SymExpr::Div(..) => 2,
            SymExpr::Add(..) | SymExpr::Sub(..) => 1,
        }
    }
}

/// Remove factors common to the numerator and denominator of a division.
///
/// Both sides are decomposed into multiplication terms; equal terms cancel
/// pairwise, so `(12 * batch) / 12` reduces to `batch`.
fn remove_common_factors(lhs: SymExpr, rhs: SymExpr) -> (SymExpr, SymExpr) {
    fn collect_terms(terms: &mut Vec<SymExpr>, term: &SymExpr) {
        if let SymExpr::Mul(lhs, rhs) = term {
            collect_terms(terms, lhs);
            collect_terms(terms, rhs);
        } else {
            terms.push(term.clone());
        }
    }

    let mut lhs_terms = Vec::new();
    collect_terms(&mut lhs_terms, &lhs);
    let mut rhs_terms = Vec::new();
    collect_terms(&mut rhs_terms, &rhs);

    let mut i = 0;
    while i < lhs_terms.len() {
        if let Some(k) = rhs_terms.iter().position(|t| t == &lhs_terms[i]) {
            lhs_terms.remove(i);
            rhs_terms.remove(k);
        } else {
            i += 1;
        }
    }

    let rebuild = |terms: Vec<SymExpr>| {
        terms
            .into_iter()
            .reduce(|prod, x| (prod * x).simplify())
            .unwrap_or(SymExpr::Value(1))
    };
    (rebuild(lhs_terms), rebuild(rhs_terms))
}

/// Put operands of a commutative operation in canonical order: known values
/// first, then variables and composites ordered by their rendering.
fn order_commutative(a: SymExpr, b: SymExpr) -> (SymExpr, SymExpr) {
    let swap = match (&a, &b) {
        (SymExpr::Value(_), _) => false,
        (_, SymExpr::Value(_)) => true,
        (a, b) => a.to_string() > b.to_string(),
    };
    if swap {
        (b, a)
    } else {
        (a, b)
    }
}

impl Add for SymExpr {
    type Output = SymExpr;

    fn add(self, rhs: SymExpr) -> SymExpr {
        SymExpr::Add(self.into(), rhs.into())
    }
}

impl Sub for SymExpr {
    type Output = SymExpr;

    fn sub(self, rhs: SymExpr) -> SymExpr {
        SymExpr::Sub(self.into(), rhs.into())
    }
}

impl Mul for SymExpr {
    type Output = SymExpr;

    fn mul(self, rhs: SymExpr) -> SymExpr {
        SymExpr::Mul(self.into(), rhs.into())
    }
}

impl Div for SymExpr {
    type Output = SymExpr;

    fn div(self, rhs: SymExpr) -> SymExpr {
        SymExpr::Div(self.into(), rhs.into())
    }
}

impl From<i64> for SymExpr {
    fn from(val: i64) -> SymExpr {
        SymExpr::Value(val)
    }
}

impl From<usize> for SymExpr {
    fn from(val: usize) -> SymExpr {
        SymExpr::Value(val as i64)
    }
}

impl<'a> From<&'a str> for SymExpr {
    fn from(name: &'a str) -> SymExpr {
        SymExpr::var(name)
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let add_parens = |f: &mut fmt::Formatter<'_>, expr: &SymExpr| {
            if expr.precedence() < self.precedence() {
                write!(f, "({})", expr)
            } else {
                write!(f, "{}", expr)
            }
        };
        let write_binop = |f: &mut fmt::Formatter<'_>, op, lhs, rhs| {
            add_parens(f, lhs)?;
            write!(f, " {op} ")?;
            add_parens(f, rhs)
        };
        match self {
            SymExpr::Value(val) => write!(f, "{}", val),
            SymExpr::Var(name) => write!(f, "{}", name),
            SymExpr::Add(lhs, rhs) => write_binop(f, '+', lhs, rhs),
            SymExpr::Sub(lhs, rhs) => write_binop(f, '-', lhs, rhs),
            SymExpr::Mul(lhs, rhs) => write_binop(f, '*', lhs, rhs),
            SymExpr::Div(lhs, rhs) => write_binop(f, '/', lhs, rhs),
            SymExpr::Max(lhs, rhs) => write!(f, "max({}, {})", lhs, rhs),
            SymExpr::Broadcast(lhs, rhs) => write!(f, "broadcast({}, {})", lhs, rhs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SymExpr;

    #[test]
    fn test_simplify_add() {
        let x = SymExpr::var("x");

        // x + 0 => x
        let expr = x.clone() + SymExpr::from(0i64);
        assert_eq!(expr.simplify(), x);

        // 2 + 3 => 5
        let expr = SymExpr::from(2i64) + SymExpr::from(3i64);
        assert_eq!(expr.simplify(), SymExpr::Value(5));

        // (x + 2) + 3 => 5 + x
        let expr = (x.clone() + SymExpr::from(2i64)) + SymExpr::from(3i64);
        assert_eq!(expr.simplify(), SymExpr::from(5i64) + x.clone());
    }

    #[test]
    fn test_simplify_sub() {
        let x = SymExpr::var("x");

        // x - 0 => x
        let expr = x.clone() - SymExpr::from(0i64);
        assert_eq!(expr.simplify(), x);

        // x - x => 0
        let expr = x.clone() - x.clone();
        assert_eq!(expr.simplify(), SymExpr::Value(0));
    }

    #[test]
    fn test_simplify_mul() {
        let x = SymExpr::var("x");

        // 1 * x => x
        let expr = SymExpr::from(1i64) * x.clone();
        assert_eq!(expr.simplify(), x);

        // x * 0 => 0
        let expr = x.clone() * SymExpr::from(0i64);
        assert_eq!(expr.simplify(), SymExpr::Value(0));

        // (x * 2) * 3 => 6 * x
        let expr = (x.clone() * SymExpr::from(2i64)) * SymExpr::from(3i64);
        assert_eq!(expr.simplify(), SymExpr::from(6i64) * x.clone());
    }

    #[test]
    fn test_simplify_div() {
        let x = SymExpr::var("x");

        // x / 1 => x
        let expr = x.clone() / SymExpr::from(1i64);
        assert_eq!(expr.simplify(), x);

        // x / x => 1
        let expr = x.clone() / x.clone();
        assert_eq!(expr.simplify(), SymExpr::Value(1));

        // 7 / 2 => 3
        let expr = SymExpr::from(7i64) / SymExpr::from(2i64);
        assert_eq!(expr.simplify(), SymExpr::Value(3));

        // x / 0 is left unevaluated.
        let expr = x.clone() / SymExpr::from(0i64);
        assert_eq!(expr.simplify(), x / SymExpr::from(0i64));
    }

    #[test]
    fn test_simplify_broadcast() {
        let x = SymExpr::var("x");
        let one = SymExpr::from(1i64);
        let ten = SymExpr::from(10i64);

        assert_eq!(x.broadcast(&one).simplify(), x);
        assert_eq!(one.broadcast(&x).simplify(), x);
        assert_eq!(ten.broadcast(&ten).simplify(), ten);
        assert_eq!(x.broadcast(&ten).simplify(), ten);
        assert_eq!(x.broadcast(&x).simplify(), x);
    }

    #[test]
    fn test_commutative_order() {
        let x = SymExpr::var("x");
        let y = SymExpr::var("y");
        let a = (x.clone() + y.clone()).simplify();
        let b = (y + x).simplify();
        assert_eq!(a, b);
    }

    #[test]
    fn test_eval() {
        let x = SymExpr::var("x");
        let expr = ((x.clone() + SymExpr::from(2i64)) * SymExpr::from(3i64)).simplify();
        let result = expr.eval(&|name| if name == "x" { Some(4) } else { None });
        assert_eq!(result, Some(18));

        let unbound = expr.eval(&|_| None);
        assert_eq!(unbound, None);
    }

    #[test]
    fn test_substitute() {
        let x = SymExpr::var("x");
        let expr = x.clone() * SymExpr::from(2i64);
        assert_eq!(expr.substitute("x", 5).simplify(), SymExpr::Value(10));
    }

    #[test]
    fn test_display() {
        let expr = (SymExpr::from(1i64) + SymExpr::var("batch")) * SymExpr::from(3i64);
        assert_eq!(expr.to_string(), "(1 + batch) * 3");
    }
}
