//! Symbol name generator.

use crate::sym_expr::SymExpr;

/// Generates fresh named symbols.
///
/// During shape inference it is sometimes necessary to invent a symbol for a
/// value that cannot be expressed in terms of existing symbols, such as the
/// output size of an operator with a data-dependent shape. Generated names
/// are numbered from 1 so repeated inference runs over the same graph produce
/// identical names.
pub struct SymbolGen {
    prefix: String,
    next_symbol_id: u32,
}

impl Default for SymbolGen {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolGen {
    pub fn new() -> Self {
        Self::with_prefix("unk")
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next_symbol_id: 0,
        }
    }

    /// Generate a new symbol with a unique name.
    pub fn fresh(&mut self) -> SymExpr {
        self.next_symbol_id += 1;
        SymExpr::var(&format!("{}_{}", self.prefix, self.next_symbol_id))
    }
}

#[cfg(test)]
mod tests {
    use super::SymbolGen;
    use crate::sym_expr::SymExpr;

    #[test]
    fn test_symbol_gen() {
        let mut gen = SymbolGen::new();
        assert_eq!(gen.fresh(), SymExpr::var("unk_1"));
        assert_eq!(gen.fresh(), SymExpr::var("unk_2"));

        let mut gen = SymbolGen::with_prefix("dyn");
        assert_eq!(gen.fresh(), SymExpr::var("dyn_1"));
    }
}
