//! bus-core — wire codec, recursive type system, message model, and config.
//! Every other bus crate depends on this one.

pub mod codec;
pub mod config;
pub mod message;
pub mod reader;
pub mod signature;
pub mod value;
pub mod writer;

pub use message::{Header, HeaderField, Message, MessageType};
pub use signature::{Signature, TypeCode};
pub use value::{DictKey, Value};
