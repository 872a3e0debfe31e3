//! Recursive type reader (C2) — a streaming cursor over a signature and
//! a value byte region that walks containers without building an
//! intermediate tree. [`crate::value::Value`] is built on top of this
//! for callers that want the allocated form; the dispatcher itself
//! reads `arg0` directly off a reader where it can, to avoid decoding
//! bodies it will only forward unchanged.

use crate::codec::{self, ByteOrder, CodecError};
use crate::signature::{type_end_at, TypeCode};
use crate::value::{DictKey, Value};

/// What kind of container this reader is walking. Dispatched by match
/// rather than a vtable — the state machine differs enough per kind
/// (an array never advances `type_pos`; a variant never advances past
/// its one value) that a shared trait would just be `match self.kind`
/// one level up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderKind {
    /// The message body: a flat sequence of complete types with no
    /// enclosing parens.
    Body,
    Struct,
    Array,
    Variant,
}

/// A point a reader can be rewound to. Only meaningful against the
/// same underlying buffer and type string the mark was taken from.
#[derive(Debug, Clone)]
pub struct Mark<'a> {
    kind: ReaderKind,
    type_str: &'a str,
    type_pos: usize,
    value_pos: usize,
    array_end: usize,
    finished: bool,
}

pub struct TypeReader<'a> {
    order: ByteOrder,
    kind: ReaderKind,
    type_str: &'a str,
    type_pos: usize,
    value_buf: &'a [u8],
    value_pos: usize,
    /// Only meaningful for `Array`: absolute offset one past the last
    /// byte of array content.
    array_end: usize,
    /// Set once a `Variant`'s single value has been consumed, or a
    /// `Struct`/`Body` reader has walked off the end of its type
    /// string. Kept separate from the positional checks below because
    /// a variant's `type_pos` never moves.
    finished: bool,
}

impl<'a> TypeReader<'a> {
    /// A top-level reader over a message body: `type_str` is the
    /// message signature (no enclosing parens), `value_pos` is the
    /// already-8-byte-aligned start of the body within `value_buf`.
    pub fn new_body(
        order: ByteOrder,
        type_str: &'a str,
        value_buf: &'a [u8],
        value_pos: usize,
    ) -> Self {
        TypeReader {
            order,
            kind: ReaderKind::Body,
            type_str,
            type_pos: 0,
            value_buf,
            value_pos,
            array_end: 0,
            finished: type_str.is_empty(),
        }
    }

    pub fn save_mark(&self) -> Mark<'a> {
        Mark {
            kind: self.kind,
            type_str: self.type_str,
            type_pos: self.type_pos,
            value_pos: self.value_pos,
            array_end: self.array_end,
            finished: self.finished,
        }
    }

    pub fn init_from_mark(order: ByteOrder, value_buf: &'a [u8], mark: &Mark<'a>) -> Self {
        TypeReader {
            order,
            kind: mark.kind,
            type_str: mark.type_str,
            type_pos: mark.type_pos,
            value_buf,
            value_pos: mark.value_pos,
            array_end: mark.array_end,
            finished: mark.finished,
        }
    }

    /// The absolute offset into the shared value buffer this reader is
    /// currently positioned at. Used by a parent reader to catch its
    /// own cursor up after a child reader finishes a container.
    pub fn value_pos(&self) -> usize {
        self.value_pos
    }

    /// Adopt a just-finished child's position as our own, then advance
    /// past the container we recursed into.
    pub fn end_recurse(&mut self, child: &TypeReader<'a>) -> Result<(), CodecError> {
        self.value_pos = child.value_pos;
        self.next_sibling()
    }

    /// The type code at the reader's current position, or `None` if
    /// this container (or the whole body) is exhausted.
    pub fn current_type(&self) -> Option<TypeCode> {
        if self.finished {
            return None;
        }
        match self.kind {
            ReaderKind::Array => {
                if self.value_pos >= self.array_end {
                    return None;
                }
                TypeCode::from_byte(*self.type_str.as_bytes().first()?)
            }
            ReaderKind::Body | ReaderKind::Struct => {
                if self.type_pos >= self.type_str.len() {
                    return None;
                }
                TypeCode::from_byte(*self.type_str.as_bytes().get(self.type_pos)?)
            }
            ReaderKind::Variant => TypeCode::from_byte(*self.type_str.as_bytes().first()?),
        }
    }

    /// The full complete-type string for whatever `current_type`
    /// points at (e.g. `"a(is)"`, not just `"a"`).
    pub fn current_type_str(&self) -> Option<&'a str> {
        match self.kind {
            ReaderKind::Array | ReaderKind::Variant => {
                if self.current_type().is_none() {
                    return None;
                }
                Some(self.type_str)
            }
            ReaderKind::Body | ReaderKind::Struct => {
                self.current_type()?;
                let end = type_end_at(self.type_str, self.type_pos, false)?;
                Some(&self.type_str[self.type_pos..end])
            }
        }
    }

    /// True if an array reader's element region is zero bytes long.
    /// Meaningful to call right after `recurse_into_container` returns
    /// an `Array` child, before reading any element.
    pub fn array_is_empty(&self) -> bool {
        self.kind == ReaderKind::Array && self.value_pos >= self.array_end
    }

    /// Move past whatever `current_type` pointed to. For a struct or
    /// body this advances the type cursor to the next field; for an
    /// array it is a no-op (exhaustion is purely a function of
    /// `value_pos` vs `array_end`); for a variant it marks the reader
    /// finished, since a variant holds exactly one value.
    pub fn next_sibling(&mut self) -> Result<(), CodecError> {
        match self.kind {
            ReaderKind::Body | ReaderKind::Struct => {
                if self.type_pos < self.type_str.len() {
                    let end = type_end_at(self.type_str, self.type_pos, false)
                        .ok_or(bad_signature())?;
                    self.type_pos = end;
                }
            }
            ReaderKind::Array => {}
            ReaderKind::Variant => self.finished = true,
        }
        Ok(())
    }

    /// Read the basic value at the current position, advancing
    /// `value_pos` past it. Does not touch the type cursor; call
    /// `next_sibling` afterward.
    pub fn read_basic(&mut self) -> Result<Value, CodecError> {
        let code = self.current_type().ok_or(bad_signature())?;
        let buf = self.value_buf;
        let order = self.order;
        let mut cursor = self.value_pos;
        let value = match code {
            TypeCode::Byte => Value::Byte(codec::read_u8(buf, &mut cursor, order)?),
            TypeCode::Bool => Value::Bool(codec::read_bool(buf, &mut cursor, order)?),
            TypeCode::Int32 => Value::I32(codec::read_i32(buf, &mut cursor, order)?),
            TypeCode::UInt32 => Value::U32(codec::read_u32(buf, &mut cursor, order)?),
            TypeCode::Int64 => Value::I64(codec::read_i64(buf, &mut cursor, order)?),
            TypeCode::UInt64 => Value::U64(codec::read_u64(buf, &mut cursor, order)?),
            TypeCode::Double => Value::Double(codec::read_f64(buf, &mut cursor, order)?),
            TypeCode::String => {
                Value::Str(codec::read_string(buf, &mut cursor, order)?.to_string())
            }
            TypeCode::ObjectPath => {
                Value::ObjectPath(codec::read_string(buf, &mut cursor, order)?.to_string())
            }
            TypeCode::Signature => {
                Value::Signature(codec::read_signature(buf, &mut cursor)?.to_string())
            }
            _ => return Err(bad_signature()),
        };
        self.value_pos = cursor;
        Ok(value)
    }

    /// Read this basic value's corresponding dict-entry key variant.
    /// Only valid when `current_type` is a basic type inside a
    /// dict-entry key position; callers are expected to have already
    /// checked that via the entry's own signature.
    pub fn read_basic_key(&mut self) -> Result<DictKey, CodecError> {
        match self.read_basic()? {
            Value::Byte(v) => Ok(DictKey::Byte(v)),
            Value::Bool(v) => Ok(DictKey::Bool(v)),
            Value::I32(v) => Ok(DictKey::I32(v)),
            Value::U32(v) => Ok(DictKey::U32(v)),
            Value::I64(v) => Ok(DictKey::I64(v)),
            Value::U64(v) => Ok(DictKey::U64(v)),
            Value::Str(v) => Ok(DictKey::Str(v)),
            Value::ObjectPath(v) => Ok(DictKey::ObjectPath(v)),
            Value::Signature(v) => Ok(DictKey::Signature(v)),
            _ => Err(bad_signature()),
        }
    }

    /// Recurse into the container at the current position, returning a
    /// reader scoped to its contents. The parent's own cursor is left
    /// untouched until the caller passes the finished child back to
    /// [`TypeReader::end_recurse`].
    pub fn recurse_into_container(&self) -> Result<TypeReader<'a>, CodecError> {
        match self.current_type().ok_or(bad_signature())? {
            TypeCode::StructStart | TypeCode::DictEntryStart => {
                // `true` here only relaxes the dict-entry-must-be-an-array-element
                // check in the signature walker; the type string we're walking
                // was already validated when the signature was first parsed.
                let end =
                    type_end_at(self.type_str, self.type_pos, true).ok_or(bad_signature())?;
                let inner = &self.type_str[self.type_pos + 1..end - 1];
                let value_pos = codec::align_up(self.value_pos, 8);
                if value_pos > self.value_buf.len() {
                    return Err(CodecError::Truncated {
                        offset: self.value_pos,
                        needed: value_pos - self.value_pos,
                        available: self.value_buf.len().saturating_sub(self.value_pos),
                    });
                }
                Ok(TypeReader {
                    order: self.order,
                    kind: ReaderKind::Struct,
                    type_str: inner,
                    type_pos: 0,
                    value_buf: self.value_buf,
                    value_pos,
                    array_end: 0,
                    finished: inner.is_empty(),
                })
            }
            TypeCode::Array => {
                let elem_start = self.type_pos + 1;
                let elem_end =
                    type_end_at(self.type_str, elem_start, true).ok_or(bad_signature())?;
                let elem_sig = &self.type_str[elem_start..elem_end];
                let elem_align = TypeCode::from_byte(elem_sig.as_bytes()[0])
                    .ok_or(bad_signature())?
                    .alignment();
                let mut cursor = self.value_pos;
                let len = codec::read_u32(self.value_buf, &mut cursor, self.order)? as usize;
                let data_start = codec::align_up(cursor, elem_align);
                let data_end = data_start + len;
                if data_end > self.value_buf.len() {
                    return Err(CodecError::Truncated {
                        offset: data_start,
                        needed: len,
                        available: self.value_buf.len().saturating_sub(data_start),
                    });
                }
                Ok(TypeReader {
                    order: self.order,
                    kind: ReaderKind::Array,
                    type_str: elem_sig,
                    type_pos: 0,
                    value_buf: self.value_buf,
                    value_pos: data_start,
                    array_end: data_end,
                    finished: false,
                })
            }
            TypeCode::Variant => {
                let mut cursor = self.value_pos;
                let sig = codec::read_signature(self.value_buf, &mut cursor)?;
                let value_pos = codec::align_up(cursor, 8);
                if value_pos > self.value_buf.len() {
                    return Err(CodecError::Truncated {
                        offset: cursor,
                        needed: value_pos - cursor,
                        available: self.value_buf.len().saturating_sub(cursor),
                    });
                }
                Ok(TypeReader {
                    order: self.order,
                    kind: ReaderKind::Variant,
                    type_str: sig,
                    type_pos: 0,
                    value_buf: self.value_buf,
                    value_pos,
                    array_end: 0,
                    finished: sig.is_empty(),
                })
            }
            _ => Err(bad_signature()),
        }
    }

    /// Fully decode the value at the current position (recursing
    /// through any nested containers) without advancing past it. Call
    /// `next_sibling` afterward, same as `read_basic`.
    pub fn read_value(&mut self) -> Result<Value, CodecError> {
        let code = self.current_type().ok_or(bad_signature())?;
        if code.is_basic() && code != TypeCode::Variant {
            return self.read_basic();
        }
        match code {
            TypeCode::Variant => {
                let mut child = self.recurse_into_container()?;
                let inner = child.read_value()?;
                child.next_sibling()?;
                self.value_pos = child.value_pos;
                Ok(Value::Variant(Box::new(inner)))
            }
            TypeCode::StructStart => {
                let mut child = self.recurse_into_container()?;
                let mut fields = Vec::new();
                while child.current_type().is_some() {
                    fields.push(child.read_value()?);
                    child.next_sibling()?;
                }
                self.value_pos = child.value_pos;
                Ok(Value::Struct(fields))
            }
            TypeCode::Array => {
                let elem_start = self.type_pos + 1;
                let elem_end = type_end_at(self.type_str, elem_start, true).ok_or(bad_signature())?;
                let elem_sig = &self.type_str[elem_start..elem_end];
                let is_dict = elem_sig.as_bytes().first() == Some(&b'{');
                let mut child = self.recurse_into_container()?;
                if is_dict {
                    let inner = &elem_sig[1..elem_sig.len() - 1];
                    let key_end = type_end_at(inner, 0, false).ok_or(bad_signature())?;
                    let (key_sig, val_sig) = (inner[..key_end].to_string(), inner[key_end..].to_string());
                    let mut map = std::collections::BTreeMap::new();
                    while child.current_type().is_some() {
                        let mut entry = child.recurse_into_container()?;
                        let key = entry.read_basic_key()?;
                        entry.next_sibling()?;
                        let value = entry.read_value()?;
                        entry.next_sibling()?;
                        child.value_pos = entry.value_pos;
                        map.insert(key, value);
                        child.next_sibling()?;
                    }
                    self.value_pos = child.value_pos;
                    Ok(Value::Dict(key_sig, val_sig, map))
                } else {
                    let mut items = Vec::new();
                    while child.current_type().is_some() {
                        items.push(child.read_value()?);
                        child.next_sibling()?;
                    }
                    self.value_pos = child.value_pos;
                    Ok(Value::Array(elem_sig.to_string(), items))
                }
            }
            _ => Err(bad_signature()),
        }
    }
}

fn bad_signature() -> CodecError {
    CodecError::Truncated {
        offset: 0,
        needed: 0,
        available: 0,
    }
}

/// Decode a full message body given its signature and byte order.
/// `value_buf` is the body region only; `value_pos` 0 is its start
/// (already aligned by the framing layer).
pub fn decode_body(
    order: ByteOrder,
    signature: &str,
    value_buf: &[u8],
) -> Result<Vec<Value>, CodecError> {
    let mut reader = TypeReader::new_body(order, signature, value_buf, 0);
    let mut values = Vec::new();
    while reader.current_type().is_some() {
        values.push(reader.read_value()?);
        reader.next_sibling()?;
    }
    Ok(values)
}
