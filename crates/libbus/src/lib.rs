//! Blocking client library for talking to a bus daemon over its Unix
//! domain socket.
//!
//! One `Connection` is one peer's end of the wire protocol: it does
//! the handshake, tracks its own serial counter, and separates
//! signals (queued for `next_message`) from method replies (matched
//! by `reply_serial` and returned directly from `call`).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use bus_core::codec::ByteOrder;
use bus_core::{Message, MessageType};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("malformed frame from peer: {0}")]
    Framing(#[from] bus_core::message::MessageError),
    #[error("malformed message body: {0}")]
    Body(#[from] bus_core::codec::CodecError),
    #[error("method call to {member} failed: {error_name}")]
    MethodError { member: String, error_name: String },
    #[error("Hello reply carried no unique name")]
    NoUniqueName,
}

const DRIVER_NAME: &str = "org.bus";
const DRIVER_PATH: &str = "/org/bus";
const DRIVER_INTERFACE: &str = "org.bus";

pub struct Connection {
    stream: UnixStream,
    read_buf: Vec<u8>,
    /// Signals read off the wire while waiting for a method reply,
    /// held until the caller asks for them via `next_message`.
    pending_signals: std::collections::VecDeque<Message>,
    next_serial: u32,
    unique_name: String,
}

impl Connection {
    /// Connect to the daemon at `path`, perform the handshake, and
    /// call `Hello` to obtain a unique name.
    pub fn open(path: &Path) -> Result<Self, ConnectionError> {
        let mut stream = UnixStream::connect(path)?;
        stream.write_all(&[0u8])?;

        let mut conn = Connection {
            stream,
            read_buf: Vec::new(),
            pending_signals: std::collections::VecDeque::new(),
            next_serial: 1,
            unique_name: String::new(),
        };

        let reply = conn.call_driver(DRIVER_PATH, DRIVER_INTERFACE, "Hello", None, Vec::new())?;
        let values = bus_core::reader::decode_body(
            reply.header.order,
            reply.header.fields.signature.as_deref().unwrap_or(""),
            &reply.body,
        )?;
        let name = match values.first() {
            Some(bus_core::Value::Str(s)) => s.clone(),
            _ => return Err(ConnectionError::NoUniqueName),
        };
        conn.unique_name = name;
        Ok(conn)
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn alloc_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Send a method call and block until its reply (or a matching
    /// error) arrives, queuing any signals seen in the meantime.
    pub fn call(
        &mut self,
        destination: &str,
        path: &str,
        interface: Option<&str>,
        member: &str,
        signature: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Message, ConnectionError> {
        let serial = self.alloc_serial();
        let mut msg = Message::method_call(serial, path, interface, member).with_destination(destination);
        if let Some(sig) = signature {
            msg = msg.with_body(sig, body);
        }
        self.send(&msg)?;
        self.await_reply(serial)
    }

    fn call_driver(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        signature: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Message, ConnectionError> {
        self.call(DRIVER_NAME, path, Some(interface), member, signature, body)
    }

    /// Send a signal; does not wait for anything, since signals carry
    /// no reply.
    pub fn emit_signal(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        signature: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let serial = self.alloc_serial();
        let mut msg = Message::signal(serial, path, interface, member);
        if let Some(sig) = signature {
            msg = msg.with_body(sig, body);
        }
        self.send(&msg)
    }

    pub fn add_match(&mut self, rule: &str) -> Result<(), ConnectionError> {
        let body = bus_core::writer::encode_body(ByteOrder::Little, &[bus_core::Value::Str(rule.to_string())])
            .expect("encoding a single string never fails");
        self.call_driver(DRIVER_PATH, DRIVER_INTERFACE, "AddMatch", Some("s"), body)?;
        Ok(())
    }

    pub fn remove_match(&mut self, rule: &str) -> Result<(), ConnectionError> {
        let body = bus_core::writer::encode_body(ByteOrder::Little, &[bus_core::Value::Str(rule.to_string())])
            .expect("encoding a single string never fails");
        self.call_driver(DRIVER_PATH, DRIVER_INTERFACE, "RemoveMatch", Some("s"), body)?;
        Ok(())
    }

    /// Return the next message intended for this peer: a queued
    /// signal if one is already buffered, otherwise the next frame
    /// read off the wire (which may itself be a signal or an
    /// unsolicited method call).
    pub fn next_message(&mut self) -> Result<Message, ConnectionError> {
        if let Some(msg) = self.pending_signals.pop_front() {
            return Ok(msg);
        }
        self.read_frame()
    }

    fn send(&mut self, msg: &Message) -> Result<(), ConnectionError> {
        self.stream.write_all(&msg.encode())?;
        Ok(())
    }

    /// Read frames until one is a method return or error whose
    /// `reply_serial` matches; anything else seen along the way is a
    /// signal and gets queued for `next_message`.
    fn await_reply(&mut self, serial: u32) -> Result<Message, ConnectionError> {
        loop {
            let msg = self.read_frame()?;
            match msg.header.message_type {
                MessageType::MethodReturn if msg.header.fields.reply_serial == Some(serial) => return Ok(msg),
                MessageType::Error if msg.header.fields.reply_serial == Some(serial) => {
                    return Err(ConnectionError::MethodError {
                        member: msg.header.fields.member.clone().unwrap_or_default(),
                        error_name: msg.header.fields.error_name.clone().unwrap_or_default(),
                    });
                }
                _ => self.pending_signals.push_back(msg),
            }
        }
    }

    fn read_frame(&mut self) -> Result<Message, ConnectionError> {
        loop {
            if let Some((msg, consumed)) = Message::decode(&self.read_buf)? {
                self.read_buf.drain(..consumed);
                return Ok(msg);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ConnectionError::Closed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}
