//! Wire message schema — the header/body split described in the
//! external interfaces section.
//!
//! Every message on the bus is preceded by this header. A peer can
//! fully describe and route a message before reading a single byte of
//! its body.

use crate::codec::{self, ByteOrder, CodecError};

/// Header field codes. Stable once assigned.
pub mod field_code {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unknown byte-order marker {0:#04x}")]
    UnknownByteOrder(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("header field {0} is not valid UTF-8 or missing its expected value")]
    BadHeaderField(u8),
    #[error("message declares a body but carries no signature header field")]
    MissingSignature,
    #[error("unknown header field code {0}")]
    UnknownFieldCode(u8),
}

/// One entry in the header's field array: a field code paired with the
/// single value it carries on the wire (a string for most fields, a
/// signature for the signature field, a uint32 for reply-serial).
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldValue {
    Str(String),
    Signature(String),
    U32(u32),
}

/// A single header field, already decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderField {
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
}

/// Fixed header plus the decoded header field array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub order: ByteOrder,
    pub message_type: MessageType,
    /// Bit 0: no-reply-expected.
    pub flags: u8,
    pub version: u8,
    pub body_length: u32,
    pub serial: u32,
    pub fields: HeaderField,
}

pub const NO_REPLY_EXPECTED: u8 = 0x01;
pub const PROTOCOL_VERSION: u8 = 1;

/// A fully-framed message: header plus opaque body bytes. The body is
/// kept as raw bytes here rather than eagerly decoded into `Value`s —
/// the dispatcher only needs `arg0` from most bodies and routes the
/// rest unopened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Message {
    pub fn method_call(serial: u32, path: &str, interface: Option<&str>, member: &str) -> Self {
        Message {
            header: Header {
                order: ByteOrder::Little,
                message_type: MessageType::MethodCall,
                flags: 0,
                version: PROTOCOL_VERSION,
                body_length: 0,
                serial,
                fields: HeaderField {
                    path: Some(path.to_string()),
                    interface: interface.map(str::to_string),
                    member: Some(member.to_string()),
                    ..Default::default()
                },
            },
            body: Vec::new(),
        }
    }

    pub fn method_return(serial: u32, reply_serial: u32) -> Self {
        Message {
            header: Header {
                order: ByteOrder::Little,
                message_type: MessageType::MethodReturn,
                flags: 0,
                version: PROTOCOL_VERSION,
                body_length: 0,
                serial,
                fields: HeaderField {
                    reply_serial: Some(reply_serial),
                    ..Default::default()
                },
            },
            body: Vec::new(),
        }
    }

    pub fn error(serial: u32, reply_serial: u32, error_name: &str) -> Self {
        Message {
            header: Header {
                order: ByteOrder::Little,
                message_type: MessageType::Error,
                flags: 0,
                version: PROTOCOL_VERSION,
                body_length: 0,
                serial,
                fields: HeaderField {
                    reply_serial: Some(reply_serial),
                    error_name: Some(error_name.to_string()),
                    ..Default::default()
                },
            },
            body: Vec::new(),
        }
    }

    pub fn signal(serial: u32, path: &str, interface: &str, member: &str) -> Self {
        Message {
            header: Header {
                order: ByteOrder::Little,
                message_type: MessageType::Signal,
                flags: 0,
                version: PROTOCOL_VERSION,
                body_length: 0,
                serial,
                fields: HeaderField {
                    path: Some(path.to_string()),
                    interface: Some(interface.to_string()),
                    member: Some(member.to_string()),
                    ..Default::default()
                },
            },
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, signature: &str, body: Vec<u8>) -> Self {
        self.header.fields.signature = Some(signature.to_string());
        self.header.body_length = body.len() as u32;
        self.body = body;
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.header.fields.destination = Some(destination.to_string());
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.header.fields.sender = Some(sender.to_string());
        self
    }

    /// Encode the full wire frame: fixed header, field array padded to
    /// an 8-byte boundary, then the body.
    pub fn encode(&self) -> Vec<u8> {
        let order = self.header.order;
        let mut buf = Vec::new();
        buf.push(order.to_byte());
        codec::write_u8(&mut buf, order, self.header.message_type as u8);
        codec::write_u8(&mut buf, order, self.header.flags);
        codec::write_u8(&mut buf, order, self.header.version);
        codec::write_u32(&mut buf, order, self.body.len() as u32);
        codec::write_u32(&mut buf, order, self.header.serial);

        let field_values = collect_fields(&self.header.fields);
        let mut fields_buf = Vec::new();
        codec::write_u32(&mut fields_buf, order, 0); // placeholder array length
        codec::pad_to(&mut fields_buf, 8);
        let data_start = fields_buf.len();
        for (code, value) in &field_values {
            codec::pad_to(&mut fields_buf, 8);
            codec::write_u8(&mut fields_buf, order, *code);
            match value {
                FieldValue::Str(s) => codec::write_string(&mut fields_buf, order, s),
                FieldValue::Signature(s) => {
                    codec::write_signature(&mut fields_buf, s).expect("header signature too long")
                }
                FieldValue::U32(v) => codec::write_u32(&mut fields_buf, order, *v),
            }
        }
        let data_len = (fields_buf.len() - data_start) as u32;
        let len_bytes = match order {
            ByteOrder::Little => data_len.to_le_bytes(),
            ByteOrder::Big => data_len.to_be_bytes(),
        };
        fields_buf[0..4].copy_from_slice(&len_bytes);

        buf.extend_from_slice(&fields_buf);
        codec::pad_to(&mut buf, 8);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode one complete frame from the front of `buf`. Returns the
    /// message and the number of bytes consumed, or `None` if `buf`
    /// does not yet hold a complete frame (the caller should keep
    /// reading and retry).
    pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, MessageError> {
        if buf.len() < 16 {
            return Ok(None);
        }
        let order = ByteOrder::from_byte(buf[0]).ok_or(MessageError::UnknownByteOrder(buf[0]))?;
        let message_type =
            MessageType::from_u8(buf[1]).ok_or(MessageError::UnknownMessageType(buf[1]))?;
        let flags = buf[2];
        let version = buf[3];

        let mut cursor = 4;
        let body_length = codec::read_u32(buf, &mut cursor, order)?;
        let serial = codec::read_u32(buf, &mut cursor, order)?;
        let fields_len = match codec::read_u32(buf, &mut cursor, order) {
            Ok(v) => v,
            Err(CodecError::Truncated { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        cursor = codec::align_up(cursor, 8);
        let fields_start = cursor;
        let fields_end = fields_start + fields_len as usize;
        if fields_end > buf.len() {
            return Ok(None);
        }

        let mut fields = HeaderField::default();
        let mut pos = fields_start;
        while pos < fields_end {
            pos = codec::align_up(pos, 8);
            if pos >= fields_end {
                break;
            }
            let code = buf[pos];
            let mut c = pos + 1;
            match code {
                field_code::PATH => fields.path = Some(codec::read_string(buf, &mut c, order)?.to_string()),
                field_code::INTERFACE => {
                    fields.interface = Some(codec::read_string(buf, &mut c, order)?.to_string())
                }
                field_code::MEMBER => {
                    fields.member = Some(codec::read_string(buf, &mut c, order)?.to_string())
                }
                field_code::ERROR_NAME => {
                    fields.error_name = Some(codec::read_string(buf, &mut c, order)?.to_string())
                }
                field_code::REPLY_SERIAL => {
                    fields.reply_serial = Some(codec::read_u32(buf, &mut c, order)?)
                }
                field_code::DESTINATION => {
                    fields.destination = Some(codec::read_string(buf, &mut c, order)?.to_string())
                }
                field_code::SENDER => {
                    fields.sender = Some(codec::read_string(buf, &mut c, order)?.to_string())
                }
                field_code::SIGNATURE => {
                    fields.signature = Some(codec::read_signature(buf, &mut c)?.to_string())
                }
                _ => return Err(MessageError::UnknownFieldCode(code)),
            }
            pos = c;
        }

        let body_start = codec::align_up(fields_end, 8);
        let body_end = body_start + body_length as usize;
        if body_end > buf.len() {
            return Ok(None);
        }
        if body_length > 0 && fields.signature.is_none() {
            return Err(MessageError::MissingSignature);
        }

        let header = Header {
            order,
            message_type,
            flags,
            version,
            body_length,
            serial,
            fields,
        };
        let body = buf[body_start..body_end].to_vec();
        Ok(Some((Message { header, body }, body_end)))
    }
}

fn collect_fields(fields: &HeaderField) -> Vec<(u8, FieldValue)> {
    let mut out = Vec::new();
    if let Some(v) = &fields.path {
        out.push((field_code::PATH, FieldValue::Str(v.clone())));
    }
    if let Some(v) = &fields.interface {
        out.push((field_code::INTERFACE, FieldValue::Str(v.clone())));
    }
    if let Some(v) = &fields.member {
        out.push((field_code::MEMBER, FieldValue::Str(v.clone())));
    }
    if let Some(v) = &fields.error_name {
        out.push((field_code::ERROR_NAME, FieldValue::Str(v.clone())));
    }
    if let Some(v) = fields.reply_serial {
        out.push((field_code::REPLY_SERIAL, FieldValue::U32(v)));
    }
    if let Some(v) = &fields.destination {
        out.push((field_code::DESTINATION, FieldValue::Str(v.clone())));
    }
    if let Some(v) = &fields.sender {
        out.push((field_code::SENDER, FieldValue::Str(v.clone())));
    }
    if let Some(v) = &fields.signature {
        out.push((field_code::SIGNATURE, FieldValue::Signature(v.clone())));
    }
    out
}
