//! Signature grammar — the type alphabet described in the data model.
//!
//! A signature is a sequence of type codes: `y b i u x t d s o g a(` and
//! `v`, with balanced parens and every `a` followed by exactly one
//! complete type. This module only validates and walks signatures; the
//! actual byte encoding lives in [`crate::codec`] and [`crate::reader`]/
//! [`crate::writer`].

use thiserror::Error;

/// A single basic or container type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    Byte,
    Bool,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Array,
    StructStart,
    StructEnd,
    Variant,
    /// Dict-entry `{key value}`, valid only as an array's element type
    /// (`a{sv}`); treated like a two-field struct with 8-byte alignment.
    DictEntryStart,
    DictEntryEnd,
}

impl TypeCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'y' => TypeCode::Byte,
            b'b' => TypeCode::Bool,
            b'i' => TypeCode::Int32,
            b'u' => TypeCode::UInt32,
            b'x' => TypeCode::Int64,
            b't' => TypeCode::UInt64,
            b'd' => TypeCode::Double,
            b's' => TypeCode::String,
            b'o' => TypeCode::ObjectPath,
            b'g' => TypeCode::Signature,
            b'a' => TypeCode::Array,
            b'(' => TypeCode::StructStart,
            b')' => TypeCode::StructEnd,
            b'v' => TypeCode::Variant,
            b'{' => TypeCode::DictEntryStart,
            b'}' => TypeCode::DictEntryEnd,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        match self {
            TypeCode::Byte => b'y',
            TypeCode::Bool => b'b',
            TypeCode::Int32 => b'i',
            TypeCode::UInt32 => b'u',
            TypeCode::Int64 => b'x',
            TypeCode::UInt64 => b't',
            TypeCode::Double => b'd',
            TypeCode::String => b's',
            TypeCode::ObjectPath => b'o',
            TypeCode::Signature => b'g',
            TypeCode::Array => b'a',
            TypeCode::StructStart => b'(',
            TypeCode::StructEnd => b')',
            TypeCode::Variant => b'v',
            TypeCode::DictEntryStart => b'{',
            TypeCode::DictEntryEnd => b'}',
        }
    }

    /// Alignment in bytes per the data model's alignment table.
    pub fn alignment(self) -> usize {
        match self {
            TypeCode::Byte | TypeCode::Bool | TypeCode::Variant | TypeCode::Signature => 1,
            TypeCode::Int32
            | TypeCode::UInt32
            | TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::Array => 4,
            TypeCode::Int64
            | TypeCode::UInt64
            | TypeCode::Double
            | TypeCode::StructStart
            | TypeCode::DictEntryStart => 8,
            TypeCode::StructEnd | TypeCode::DictEntryEnd => 1,
        }
    }

    /// Fixed on-wire width for basic scalar types. `None` for
    /// variable-length or container types.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            TypeCode::Byte | TypeCode::Bool => Some(1),
            TypeCode::Int32 | TypeCode::UInt32 => Some(4),
            TypeCode::Int64 | TypeCode::UInt64 | TypeCode::Double => Some(8),
            _ => None,
        }
    }

    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            TypeCode::Array
                | TypeCode::StructStart
                | TypeCode::StructEnd
                | TypeCode::Variant
                | TypeCode::DictEntryStart
                | TypeCode::DictEntryEnd
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unknown type code: {0:#04x}")]
    UnknownCode(u8),
    #[error("unbalanced struct parens")]
    Unbalanced,
    #[error("array type code 'a' not followed by a complete type")]
    DanglingArray,
    #[error("signature longer than 255 bytes")]
    TooLong,
    #[error("empty struct '()' is not a valid type")]
    EmptyStruct,
    #[error("dict-entry '{{' may only appear as an array element type")]
    DictEntryOutsideArray,
    #[error("dict-entry must have exactly a key type and a value type")]
    BadDictEntry,
}

/// A validated, borrowed type signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature<'a>(&'a str);

impl<'a> Signature<'a> {
    /// Validate `s` as a well-formed signature (possibly describing
    /// zero, one, or many complete types in sequence).
    pub fn parse(s: &'a str) -> Result<Self, SignatureError> {
        if s.len() > 255 {
            return Err(SignatureError::TooLong);
        }
        validate(s.as_bytes())?;
        Ok(Signature(s))
    }

    /// Construct without validation. Callers must guarantee `s` is
    /// already a validated signature (e.g. a sub-slice of one).
    pub fn new_unchecked(s: &'a str) -> Self {
        Signature(s)
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split off exactly one complete type from the front, returning it
    /// and the remainder.
    pub fn split_first_type(&self) -> Option<(&'a str, &'a str)> {
        if self.0.is_empty() {
            return None;
        }
        let bytes = self.0.as_bytes();
        let end = complete_type_end(bytes, 0, false).ok()?;
        Some((&self.0[..end], &self.0[end..]))
    }

    /// Iterate over the top-level complete types in this signature.
    pub fn iter(&self) -> SignatureIter<'a> {
        SignatureIter { rest: self.0 }
    }
}

pub struct SignatureIter<'a> {
    rest: &'a str,
}

impl<'a> Iterator for SignatureIter<'a> {
    type Item = &'a str;
    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let bytes = self.rest.as_bytes();
        let end = complete_type_end(bytes, 0, false).ok()?;
        let (head, tail) = self.rest.split_at(end);
        self.rest = tail;
        Some(head)
    }
}

/// Index just past one complete type starting at byte offset `pos` in
/// `s`. Used by the reader/writer to walk an already-validated
/// signature without re-deriving error detail. `as_array_elem` mirrors
/// the parser's own flag (pass `true` only when `pos` is the element
/// type directly inside an array's `a`).
pub fn type_end_at(s: &str, pos: usize, as_array_elem: bool) -> Option<usize> {
    complete_type_end(s.as_bytes(), pos, as_array_elem).ok()
}

/// Validate that `bytes` is a sequence of zero or more complete types.
fn validate(bytes: &[u8]) -> Result<(), SignatureError> {
    let mut pos = 0;
    while pos < bytes.len() {
        pos = complete_type_end(bytes, pos, false)?;
    }
    Ok(())
}

/// Returns the index just past one complete type starting at `pos`.
/// `as_array_elem` is true when this type is the direct element type of
/// an enclosing `a` — only there may a dict-entry `{...}` appear.
fn complete_type_end(
    bytes: &[u8],
    pos: usize,
    as_array_elem: bool,
) -> Result<usize, SignatureError> {
    let code = *bytes.get(pos).ok_or(SignatureError::Unbalanced)?;
    match code {
        b'y' | b'b' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'v' => Ok(pos + 1),
        b'a' => {
            if pos + 1 >= bytes.len() {
                return Err(SignatureError::DanglingArray);
            }
            complete_type_end(bytes, pos + 1, true)
        }
        b'(' => {
            let mut cur = pos + 1;
            if bytes.get(cur) == Some(&b')') {
                return Err(SignatureError::EmptyStruct);
            }
            while bytes.get(cur) != Some(&b')') {
                cur = complete_type_end(bytes, cur, false)?;
            }
            Ok(cur + 1)
        }
        b'{' => {
            if !as_array_elem {
                return Err(SignatureError::DictEntryOutsideArray);
            }
            let key_end = complete_type_end(bytes, pos + 1, false)?;
            if !bytes[pos + 1..key_end]
                .first()
                .and_then(|&b| TypeCode::from_byte(b))
                .map(|t| t.is_basic())
                .unwrap_or(false)
            {
                return Err(SignatureError::BadDictEntry);
            }
            let value_end = complete_type_end(bytes, key_end, false)?;
            if bytes.get(value_end) != Some(&b'}') {
                return Err(SignatureError::BadDictEntry);
            }
            Ok(value_end + 1)
        }
        b')' | b'}' => Err(SignatureError::Unbalanced),
        other => Err(SignatureError::UnknownCode(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_codes_round_trip() {
        for &b in b"ybiuxtdsoga(v" {
            if b == b'(' {
                continue;
            }
            let code = TypeCode::from_byte(b).unwrap();
            assert_eq!(code.to_byte(), b);
        }
    }

    #[test]
    fn alignment_table_is_internally_consistent() {
        assert_eq!(TypeCode::Byte.alignment(), 1);
        assert_eq!(TypeCode::Bool.alignment(), 1);
        assert_eq!(TypeCode::Variant.alignment(), 1);
        assert_eq!(TypeCode::Signature.alignment(), 1);
        assert_eq!(TypeCode::Int32.alignment(), 4);
        assert_eq!(TypeCode::UInt32.alignment(), 4);
        assert_eq!(TypeCode::String.alignment(), 4);
        assert_eq!(TypeCode::ObjectPath.alignment(), 4);
        assert_eq!(TypeCode::Array.alignment(), 4);
        assert_eq!(TypeCode::Int64.alignment(), 8);
        assert_eq!(TypeCode::UInt64.alignment(), 8);
        assert_eq!(TypeCode::Double.alignment(), 8);
        assert_eq!(TypeCode::StructStart.alignment(), 8);
    }

    #[test]
    fn parses_scalar_and_struct() {
        assert!(Signature::parse("i").is_ok());
        assert!(Signature::parse("(is)").is_ok());
        assert!(Signature::parse("a(is)").is_ok());
    }

    #[test]
    fn parses_dict_entry_array() {
        assert!(Signature::parse("a{sv}").is_ok());
        assert!(Signature::parse("(isa{sv})").is_ok());
    }

    #[test]
    fn rejects_dict_entry_outside_array() {
        assert_eq!(
            Signature::parse("{sv}").unwrap_err(),
            SignatureError::DictEntryOutsideArray
        );
    }

    #[test]
    fn rejects_dict_entry_with_non_basic_key() {
        assert_eq!(
            Signature::parse("a{(i)v}").unwrap_err(),
            SignatureError::BadDictEntry
        );
    }

    #[test]
    fn rejects_dict_entry_with_three_types() {
        assert!(Signature::parse("a{sii}").is_err());
    }

    #[test]
    fn rejects_unbalanced_parens() {
        assert_eq!(
            Signature::parse("(is").unwrap_err(),
            SignatureError::Unbalanced
        );
        assert_eq!(
            Signature::parse("is)").unwrap_err(),
            SignatureError::Unbalanced
        );
    }

    #[test]
    fn rejects_dangling_array() {
        assert!(Signature::parse("a").is_err());
    }

    #[test]
    fn rejects_empty_struct() {
        assert!(Signature::parse("()").is_err());
    }

    #[test]
    fn rejects_unknown_code() {
        assert!(Signature::parse("z").is_err());
    }

    #[test]
    fn splits_first_type() {
        let sig = Signature::parse("isa(i)").unwrap();
        let (first, rest) = sig.split_first_type().unwrap();
        assert_eq!(first, "i");
        assert_eq!(rest, "sa(i)");
    }

    #[test]
    fn iterates_top_level_types() {
        let sig = Signature::parse("isa(i)v").unwrap();
        let types: Vec<&str> = sig.iter().collect();
        assert_eq!(types, vec!["i", "s", "a(i)", "v"]);
    }

    #[test]
    fn nested_arrays_validate() {
        assert!(Signature::parse("aai").is_ok());
        assert!(Signature::parse("aa(is)").is_ok());
    }

    #[test]
    fn empty_signature_is_valid() {
        let sig = Signature::parse("").unwrap();
        assert!(sig.is_empty());
        assert_eq!(sig.iter().count(), 0);
    }
}
