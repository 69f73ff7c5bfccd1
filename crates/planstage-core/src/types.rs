//! Lightweight value and document types.
//!
//! Records are flat field → scalar maps. That is all the residual predicates
//! and the test collaborators need; richer document models live elsewhere.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bin(Vec<u8>),
}

impl Scalar {
    /// Ordering between two scalars of compatible type.
    ///
    /// Integers and floats compare numerically. Returns `None` for mixed
    /// incompatible types and for NaN.
    pub fn partial_cmp_value(&self, other: &Scalar) -> Option<Ordering> {
        use Scalar::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (I64(a), I64(b)) => Some(a.cmp(b)),
            (F64(a), F64(b)) => a.partial_cmp(b),
            (I64(a), F64(b)) => (*a as f64).partial_cmp(b),
            (F64(a), I64(b)) => a.partial_cmp(&(*b as f64)),
            (Str(a), Str(b)) => Some(a.cmp(b)),
            (Bin(a), Bin(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::I64(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::F64(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

/// A materialized record: field name → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, Scalar>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_comparison_crosses_int_and_float() {
        assert_eq!(
            Scalar::I64(2).partial_cmp_value(&Scalar::F64(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Scalar::Str("a".into()).partial_cmp_value(&Scalar::I64(1)), None);
    }

    #[test]
    fn document_builder_and_lookup() {
        let doc = Document::new().with("a", 1i64).with("name", "x");
        assert_eq!(doc.get("a"), Some(&Scalar::I64(1)));
        assert_eq!(doc.get("name"), Some(&Scalar::Str("x".into())));
        assert!(doc.get("missing").is_none());
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn document_serializes_as_plain_object() {
        let doc = Document::new().with("a", 1i64);
        let json = serde_json::to_string(&doc).unwrap();
        assert_eq!(json, r#"{"a":{"I64":1}}"#);
    }
}
