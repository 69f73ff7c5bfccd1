//! Residual predicates evaluated against materialized documents.
//!
//! Supports expressions of the form: "field OP literal" where OP ∈ {==, !=, <, <=, >, >=}

use std::cmp::Ordering;
use std::fmt;

use planstage_core::types::{Document, Scalar};

use crate::traits::StageError;

/// Boolean test over a fully materialized document.
pub trait ResidualPredicate {
    fn matches(&self, doc: &Document) -> bool;
}

impl<F> ResidualPredicate for F
where
    F: Fn(&Document) -> bool,
{
    fn matches(&self, doc: &Document) -> bool {
        self(doc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Single-field comparison against a literal.
///
/// A missing field, a null, or a type mismatch never matches (not even `!=`).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPredicate {
    pub field: String,
    pub op: CmpOp,
    pub literal: Scalar,
}

impl FieldPredicate {
    pub fn new(field: impl Into<String>, op: CmpOp, literal: impl Into<Scalar>) -> Self {
        Self {
            field: field.into(),
            op,
            literal: literal.into(),
        }
    }

    /// Parse a simple predicate like "age > 18" or "name == Alice".
    pub fn parse(expr: &str) -> Result<Self, StageError> {
        // Two-character operators first so "<=" is not read as "<".
        let ops = [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            ("<=", CmpOp::Le),
            (">=", CmpOp::Ge),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
        ];

        for (sym, op) in ops {
            if let Some(pos) = expr.find(sym) {
                let field = expr[..pos].trim();
                let lit = expr[pos + sym.len()..].trim();
                if field.is_empty() || lit.is_empty() {
                    break;
                }
                return Ok(Self {
                    field: field.to_string(),
                    op,
                    literal: parse_literal(lit),
                });
            }
        }

        Err(StageError::Predicate(format!("unparseable predicate: {}", expr)))
    }
}

impl ResidualPredicate for FieldPredicate {
    fn matches(&self, doc: &Document) -> bool {
        match doc.get(&self.field) {
            None | Some(Scalar::Null) => false,
            Some(value) => value
                .partial_cmp_value(&self.literal)
                .map(|ord| self.op.accepts(ord))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for FieldPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.field, self.op.symbol(), self.literal)
    }
}

/// Integers, then floats, then booleans; quoted or bare text is a string.
fn parse_literal(lit: &str) -> Scalar {
    if let Ok(v) = lit.parse::<i64>() {
        return Scalar::I64(v);
    }
    if let Ok(v) = lit.parse::<f64>() {
        return Scalar::F64(v);
    }
    if let Ok(v) = lit.parse::<bool>() {
        return Scalar::Bool(v);
    }
    let unquoted = lit
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| lit.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(lit);
    Scalar::Str(unquoted.to_string())
}
