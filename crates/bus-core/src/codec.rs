//! Wire codec (C1) — align-aware pack/unpack of basic types in either
//! byte order, plus length-prefixed strings and signatures.

use thiserror::Error;

/// Explicit wire byte order, selected per message (`l` little, `B` big).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'l' => Some(ByteOrder::Little),
            b'B' => Some(ByteOrder::Big),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ByteOrder::Little => b'l',
            ByteOrder::Big => b'B',
        }
    }

}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer truncated: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string/signature missing nul terminator")]
    MissingNul,
    #[error("signature longer than 255 bytes")]
    SignatureTooLong,
}

/// Round `cursor` up to the next multiple of `alignment` (1, 4, or 8).
pub fn align_up(cursor: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (cursor + alignment - 1) & !(alignment - 1)
}

/// Append zero padding bytes so `buf.len()` becomes aligned to `alignment`.
pub fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    let target = align_up(buf.len(), alignment);
    buf.resize(target, 0);
}

/// Skip padding bytes in a decode cursor, verifying they are present
/// (i.e. the buffer is at least that long) without checking their
/// content (the source may legitimately write non-zero padding; only
/// encoders are required to zero it).
pub fn skip_padding(buf: &[u8], cursor: usize, alignment: usize) -> Result<usize, CodecError> {
    let target = align_up(cursor, alignment);
    if target > buf.len() {
        return Err(CodecError::Truncated {
            offset: cursor,
            needed: target - cursor,
            available: buf.len() - cursor,
        });
    }
    Ok(target)
}

macro_rules! basic_rw {
    ($write_name:ident, $read_name:ident, $ty:ty, $width:expr) => {
        pub fn $write_name(buf: &mut Vec<u8>, order: ByteOrder, value: $ty) {
            pad_to(buf, $width);
            let bytes = match order {
                ByteOrder::Little => value.to_le_bytes(),
                ByteOrder::Big => value.to_be_bytes(),
            };
            buf.extend_from_slice(&bytes);
        }

        pub fn $read_name(
            buf: &[u8],
            cursor: &mut usize,
            order: ByteOrder,
        ) -> Result<$ty, CodecError> {
            let start = skip_padding(buf, *cursor, $width)?;
            let end = start + $width;
            if end > buf.len() {
                return Err(CodecError::Truncated {
                    offset: start,
                    needed: $width,
                    available: buf.len().saturating_sub(start),
                });
            }
            let mut raw = [0u8; $width];
            raw.copy_from_slice(&buf[start..end]);
            let value = match order {
                ByteOrder::Little => <$ty>::from_le_bytes(raw),
                ByteOrder::Big => <$ty>::from_be_bytes(raw),
            };
            *cursor = end;
            Ok(value)
        }
    };
}

basic_rw!(write_u8, read_u8, u8, 1);
basic_rw!(write_i32, read_i32, i32, 4);
basic_rw!(write_u32, read_u32, u32, 4);
basic_rw!(write_i64, read_i64, i64, 8);
basic_rw!(write_u64, read_u64, u64, 8);

pub fn write_bool(buf: &mut Vec<u8>, order: ByteOrder, value: bool) {
    write_u32(buf, order, value as u32);
}

pub fn read_bool(buf: &[u8], cursor: &mut usize, order: ByteOrder) -> Result<bool, CodecError> {
    Ok(read_u32(buf, cursor, order)? != 0)
}

pub fn write_f64(buf: &mut Vec<u8>, order: ByteOrder, value: f64) {
    let bits = value.to_bits();
    write_u64(buf, order, bits);
}

pub fn read_f64(buf: &[u8], cursor: &mut usize, order: ByteOrder) -> Result<f64, CodecError> {
    let bits = read_u64(buf, cursor, order)?;
    Ok(f64::from_bits(bits))
}

/// Encode a string or object-path: 4-byte length, UTF-8 bytes, nul.
/// The nul terminator is not counted in the length.
pub fn write_string(buf: &mut Vec<u8>, order: ByteOrder, s: &str) {
    write_u32(buf, order, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

pub fn read_string<'a>(
    buf: &'a [u8],
    cursor: &mut usize,
    order: ByteOrder,
) -> Result<&'a str, CodecError> {
    let len = read_u32(buf, cursor, order)? as usize;
    let start = *cursor;
    let end = start + len;
    let nul = end;
    if nul >= buf.len() {
        return Err(CodecError::Truncated {
            offset: start,
            needed: len + 1,
            available: buf.len().saturating_sub(start),
        });
    }
    if buf[nul] != 0 {
        return Err(CodecError::MissingNul);
    }
    let s = std::str::from_utf8(&buf[start..end]).map_err(|_| CodecError::InvalidUtf8)?;
    *cursor = nul + 1;
    Ok(s)
}

/// Encode a signature: 1-byte length, ASCII signature, nul.
pub fn write_signature(buf: &mut Vec<u8>, sig: &str) -> Result<(), CodecError> {
    if sig.len() > 255 {
        return Err(CodecError::SignatureTooLong);
    }
    buf.push(sig.len() as u8);
    buf.extend_from_slice(sig.as_bytes());
    buf.push(0);
    Ok(())
}

pub fn read_signature<'a>(buf: &'a [u8], cursor: &mut usize) -> Result<&'a str, CodecError> {
    let start = *cursor;
    let len = *buf
        .get(start)
        .ok_or(CodecError::Truncated {
            offset: start,
            needed: 1,
            available: 0,
        })? as usize;
    let sig_start = start + 1;
    let sig_end = sig_start + len;
    let nul = sig_end;
    if nul >= buf.len() {
        return Err(CodecError::Truncated {
            offset: start,
            needed: len + 2,
            available: buf.len().saturating_sub(start),
        });
    }
    if buf[nul] != 0 {
        return Err(CodecError::MissingNul);
    }
    let s = std::str::from_utf8(&buf[sig_start..sig_end]).map_err(|_| CodecError::InvalidUtf8)?;
    *cursor = nul + 1;
    Ok(s)
}
