//! Recursive type writer (C2) — the encode-side mirror of
//! [`crate::reader`]. Values are appended to a growing `Vec<u8>`;
//! containers are opened with `recurse_into_container` and closed with
//! `unrecurse`, which is where array lengths get back-patched once the
//! element count is known.

use crate::codec::{self, ByteOrder, CodecError};
use crate::signature::TypeCode;
use crate::value::{DictKey, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterKind {
    Body,
    Struct,
    /// Holds the absolute offset of the 4-byte length word so
    /// `unrecurse` can go back and fill it in.
    Array,
    Variant,
}

pub struct TypeWriter<'b> {
    order: ByteOrder,
    buf: &'b mut Vec<u8>,
    kind: WriterKind,
    /// For `Array`: offset of the length word. For others: unused.
    len_offset: usize,
    /// For `Array`: offset where element data starts (after the length
    /// word and the element alignment padding), needed to compute the
    /// byte count written into the length word.
    data_start: usize,
}

impl<'b> TypeWriter<'b> {
    pub fn new_body(order: ByteOrder, buf: &'b mut Vec<u8>) -> Self {
        TypeWriter {
            order,
            buf,
            kind: WriterKind::Body,
            len_offset: 0,
            data_start: 0,
        }
    }

    pub fn write_basic(&mut self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Byte(v) => codec::write_u8(self.buf, self.order, *v),
            Value::Bool(v) => codec::write_bool(self.buf, self.order, *v),
            Value::I32(v) => codec::write_i32(self.buf, self.order, *v),
            Value::U32(v) => codec::write_u32(self.buf, self.order, *v),
            Value::I64(v) => codec::write_i64(self.buf, self.order, *v),
            Value::U64(v) => codec::write_u64(self.buf, self.order, *v),
            Value::Double(v) => codec::write_f64(self.buf, self.order, *v),
            Value::Str(v) => codec::write_string(self.buf, self.order, v),
            Value::ObjectPath(v) => codec::write_string(self.buf, self.order, v),
            Value::Signature(v) => codec::write_signature(self.buf, v)?,
            _ => return Err(not_basic()),
        }
        Ok(())
    }

    fn write_basic_key(&mut self, key: &DictKey) -> Result<(), CodecError> {
        match key {
            DictKey::Byte(v) => codec::write_u8(self.buf, self.order, *v),
            DictKey::Bool(v) => codec::write_bool(self.buf, self.order, *v),
            DictKey::I32(v) => codec::write_i32(self.buf, self.order, *v),
            DictKey::U32(v) => codec::write_u32(self.buf, self.order, *v),
            DictKey::I64(v) => codec::write_i64(self.buf, self.order, *v),
            DictKey::U64(v) => codec::write_u64(self.buf, self.order, *v),
            DictKey::Str(v) => codec::write_string(self.buf, self.order, v),
            DictKey::ObjectPath(v) => codec::write_string(self.buf, self.order, v),
            DictKey::Signature(v) => codec::write_signature(self.buf, v)?,
        }
        Ok(())
    }

    /// Open a struct: 8-byte alignment, no length word (the reader
    /// finds struct ends via the signature, not the wire).
    pub fn recurse_into_struct(&mut self) -> TypeWriter<'_> {
        codec::pad_to(self.buf, 8);
        TypeWriter {
            order: self.order,
            buf: self.buf,
            kind: WriterKind::Struct,
            len_offset: 0,
            data_start: 0,
        }
    }

    /// Open a dict-entry: identical on the wire to a struct of the key
    /// and value types.
    pub fn recurse_into_dict_entry(&mut self) -> TypeWriter<'_> {
        self.recurse_into_struct()
    }

    /// Open an array of `elem_align`-aligned elements: writes a
    /// placeholder 4-byte length word, then pads to the element's
    /// alignment. `unrecurse` fills the length word in once the
    /// caller is done appending elements.
    pub fn recurse_into_array(&mut self, elem_align: usize) -> TypeWriter<'_> {
        let len_offset = self.buf.len();
        codec::write_u32(self.buf, self.order, 0);
        codec::pad_to(self.buf, elem_align);
        let data_start = self.buf.len();
        TypeWriter {
            order: self.order,
            buf: self.buf,
            kind: WriterKind::Array,
            len_offset,
            data_start,
        }
    }

    /// Open a variant: 1-byte sig-length + nul-terminated signature,
    /// then pad to 8 bytes before the value (this encoding always pads
    /// the variant body to 8 regardless of the contained type's own
    /// alignment).
    pub fn recurse_into_variant(&mut self, inner_signature: &str) -> Result<TypeWriter<'_>, CodecError> {
        codec::write_signature(self.buf, inner_signature)?;
        codec::pad_to(self.buf, 8);
        Ok(TypeWriter {
            order: self.order,
            buf: self.buf,
            kind: WriterKind::Variant,
            len_offset: 0,
            data_start: 0,
        })
    }

    /// Close a container opened by one of the `recurse_into_*`
    /// methods. For an array this back-patches the length word; for
    /// everything else there is nothing to finalize because the
    /// reader derives the end purely from the signature.
    pub fn unrecurse(self) {
        if self.kind == WriterKind::Array {
            let len = (self.buf.len() - self.data_start) as u32;
            let bytes = match self.order {
                ByteOrder::Little => len.to_le_bytes(),
                ByteOrder::Big => len.to_be_bytes(),
            };
            self.buf[self.len_offset..self.len_offset + 4].copy_from_slice(&bytes);
        }
    }

    /// Encode a full `Value` tree at the current position, recursing
    /// through containers as needed.
    pub fn write_value(&mut self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Byte(_)
            | Value::Bool(_)
            | Value::I32(_)
            | Value::U32(_)
            | Value::I64(_)
            | Value::U64(_)
            | Value::Double(_)
            | Value::Str(_)
            | Value::ObjectPath(_)
            | Value::Signature(_) => self.write_basic(value),
            Value::Variant(inner) => {
                let sig = inner.signature();
                let mut child = self.recurse_into_variant(&sig)?;
                child.write_value(inner)?;
                child.unrecurse();
                Ok(())
            }
            Value::Struct(fields) => {
                let mut child = self.recurse_into_struct();
                for field in fields {
                    child.write_value(field)?;
                }
                child.unrecurse();
                Ok(())
            }
            Value::Array(elem_sig, items) => {
                let elem_align = elem_align_of(elem_sig)?;
                let mut child = self.recurse_into_array(elem_align);
                for item in items {
                    child.write_value(item)?;
                }
                child.unrecurse();
                Ok(())
            }
            Value::Dict(_, _, map) => {
                let elem_align = 8; // dict-entries are always 8-aligned, like structs
                let mut child = self.recurse_into_array(elem_align);
                for (key, val) in map {
                    let mut entry = child.recurse_into_dict_entry();
                    entry.write_basic_key(key)?;
                    entry.write_value(val)?;
                    entry.unrecurse();
                }
                child.unrecurse();
                Ok(())
            }
        }
    }

}

/// Alignment of an array's element type, read off its signature
/// directly rather than inferred from the first element — the only
/// way an empty array still aligns correctly.
fn elem_align_of(elem_sig: &str) -> Result<usize, CodecError> {
    let code = elem_sig.as_bytes().first().and_then(|&b| TypeCode::from_byte(b)).ok_or(not_basic())?;
    Ok(code.alignment())
}

fn not_basic() -> CodecError {
    CodecError::Truncated {
        offset: 0,
        needed: 0,
        available: 0,
    }
}

/// Encode a full message body (a flat sequence of values with no
/// enclosing parens) for the given byte order.
pub fn encode_body(order: ByteOrder, values: &[Value]) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut writer = TypeWriter::new_body(order, &mut buf);
    for value in values {
        writer.write_value(value)?;
    }
    Ok(buf)
}
