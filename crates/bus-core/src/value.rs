//! Decoded value tree shared by [`crate::reader`] and [`crate::writer`].
//!
//! This is the ergonomic, allocation-based counterpart to the streaming
//! `TypeReader`/`TypeWriter` state machines: most callers (message
//! bodies, the matchmaker's arg0 filter, the client library) want a
//! `Value` they can pattern-match, not a cursor.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    /// The element's own complete type signature travels with the
    /// array independently of its contents, so an empty array still
    /// knows what type (and alignment) its elements would have had.
    Array(String, Vec<Value>),
    Struct(Vec<Value>),
    Variant(Box<Value>),
    /// Array of dict-entries, keyed by the rendered key value. Ordering
    /// is not meaningful for dicts; `BTreeMap` keeps encode output
    /// deterministic for tests. Key and value signatures are carried
    /// alongside the map for the same reason as `Array`'s: an empty
    /// dict still has a type.
    Dict(String, String, BTreeMap<DictKey, Value>),
}

/// Dict-entry keys must be basic types; this restricts `Value` enough
/// to give them `Ord` without a fallible conversion at use sites.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DictKey {
    Byte(u8),
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Str(String),
    ObjectPath(String),
    Signature(String),
}

impl Value {
    /// The signature fragment this value would encode as.
    pub fn signature(&self) -> String {
        match self {
            Value::Byte(_) => "y".to_string(),
            Value::Bool(_) => "b".to_string(),
            Value::I32(_) => "i".to_string(),
            Value::U32(_) => "u".to_string(),
            Value::I64(_) => "x".to_string(),
            Value::U64(_) => "t".to_string(),
            Value::Double(_) => "d".to_string(),
            Value::Str(_) => "s".to_string(),
            Value::ObjectPath(_) => "o".to_string(),
            Value::Signature(_) => "g".to_string(),
            Value::Variant(_) => "v".to_string(),
            Value::Array(elem_sig, _) => format!("a{elem_sig}"),
            Value::Struct(fields) => {
                let inner: String = fields.iter().map(|f| f.signature()).collect();
                format!("({inner})")
            }
            Value::Dict(key_sig, val_sig, _) => format!("a{{{key_sig}{val_sig}}}"),
        }
    }
}

/// The signature fragment a dict-entry key of this variant would
/// encode as — callers building a `Value::Dict` need this to fill in
/// its key signature.
pub fn dict_key_signature(key: &DictKey) -> String {
    match key {
        DictKey::Byte(_) => "y".to_string(),
        DictKey::Bool(_) => "b".to_string(),
        DictKey::I32(_) => "i".to_string(),
        DictKey::U32(_) => "u".to_string(),
        DictKey::I64(_) => "x".to_string(),
        DictKey::U64(_) => "t".to_string(),
        DictKey::Str(_) => "s".to_string(),
        DictKey::ObjectPath(_) => "o".to_string(),
        DictKey::Signature(_) => "g".to_string(),
    }
}
