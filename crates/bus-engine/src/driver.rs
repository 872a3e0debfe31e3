//! The bus driver — the pseudo-service at `org.bus` / `/org/bus` that
//! answers `Hello`, name ownership, and match-rule method calls
//! in-process rather than being forwarded anywhere.

use bus_core::codec::ByteOrder;
use bus_core::value::Value;
use bus_core::{writer, Message};

use crate::match_rule::{MatchRule, MatchRuleError};
use crate::registry::{self, ConnId, NameRegistry};

pub const DRIVER_NAME: &str = "org.bus";
pub const DRIVER_PATH: &str = "/org/bus";
pub const DRIVER_INTERFACE: &str = "org.bus";

/// A well-known name changing hands, reported so the dispatcher can
/// emit `NameOwnerChanged` signals after the driver call's own reply
/// is queued.
pub struct OwnerChange {
    pub name: String,
    pub old_owner: Option<String>,
    pub new_owner: Option<String>,
}

pub struct DriverResult {
    pub reply: Message,
    pub owner_changes: Vec<OwnerChange>,
    /// `AddMatch`/`RemoveMatch` validate and parse the rule here, but
    /// applying it to the sender's connection is the dispatcher's job
    /// (the driver has no connection table of its own).
    pub match_change: Option<MatchChange>,
    /// Names the caller itself just acquired (`Hello`'s unique name,
    /// or a well-known name it became the owner of via
    /// `RequestName`): the dispatcher sends each of these a
    /// `NameAcquired` signal directly, not through the matchmaker.
    pub acquired: Vec<String>,
}

pub enum MatchChange {
    Add(MatchRule),
    Remove(MatchRule),
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unknown driver method {0}")]
    UnknownMethod(String),
    #[error("missing or malformed argument {0}")]
    BadArgument(&'static str),
    #[error(transparent)]
    MatchRule(#[from] MatchRuleError),
}

/// Handle one method call addressed to the driver. `sender` must
/// already have a unique name allocated (true for every call except
/// `Hello` itself, which allocates it).
pub fn handle(
    registry: &mut NameRegistry,
    next_serial: &mut u32,
    sender: ConnId,
    msg: &Message,
) -> Result<DriverResult, DriverError> {
    let member = msg
        .header
        .fields
        .member
        .as_deref()
        .ok_or(DriverError::UnknownMethod(String::new()))?;
    let args = decode_args(msg);

    let mut owner_changes = Vec::new();
    let mut match_change = None;
    let mut acquired = Vec::new();

    let reply = match member {
        "Hello" => {
            let unique = registry.allocate_unique_name(sender);
            acquired.push(unique.clone());
            let body = writer::encode_body(ByteOrder::Little, &[Value::Str(unique)]).unwrap();
            reply_of(next_serial, msg, "s", body)
        }
        "RequestName" => {
            let name = args
                .first()
                .and_then(as_str)
                .ok_or(DriverError::BadArgument("name"))?;
            let flags = args
                .get(1)
                .and_then(as_u32)
                .ok_or(DriverError::BadArgument("flags"))?;
            let (result, evicted) = registry.request_name(sender, name, flags);
            if let Some(old_conn) = evicted {
                owner_changes.push(OwnerChange {
                    name: name.to_string(),
                    old_owner: registry.unique_name_of(old_conn).map(str::to_string),
                    new_owner: registry.unique_name_of(sender).map(str::to_string),
                });
                acquired.push(name.to_string());
            } else if result == registry::RequestNameReply::PrimaryOwner {
                owner_changes.push(OwnerChange {
                    name: name.to_string(),
                    old_owner: None,
                    new_owner: registry.unique_name_of(sender).map(str::to_string),
                });
                acquired.push(name.to_string());
            }
            u32_reply(next_serial, msg, result as u32)
        }
        "ReleaseName" => {
            let name = args
                .first()
                .and_then(as_str)
                .ok_or(DriverError::BadArgument("name"))?;
            let owner_before = registry.unique_name_of(sender).map(str::to_string);
            let (result, promoted) = registry.release_name(sender, name);
            if result == registry::ReleaseNameReply::Released {
                owner_changes.push(OwnerChange {
                    name: name.to_string(),
                    old_owner: owner_before,
                    new_owner: promoted.and_then(|c| registry.unique_name_of(c).map(str::to_string)),
                });
            }
            u32_reply(next_serial, msg, result as u32)
        }
        "ListNames" => {
            let names = registry.list_names();
            let body = writer::encode_body(
                ByteOrder::Little,
                &[Value::Array("s".to_string(), names.into_iter().map(Value::Str).collect())],
            )
            .unwrap();
            reply_of(next_serial, msg, "as", body)
        }
        "NameHasOwner" => {
            let name = args
                .first()
                .and_then(as_str)
                .ok_or(DriverError::BadArgument("name"))?;
            let body = writer::encode_body(ByteOrder::Little, &[Value::Bool(registry.has_owner(name))])
                .unwrap();
            reply_of(next_serial, msg, "b", body)
        }
        "GetNameOwner" => {
            let name = args
                .first()
                .and_then(as_str)
                .ok_or(DriverError::BadArgument("name"))?;
            match registry.name_owner(name).and_then(|c| registry.unique_name_of(c)) {
                Some(owner) => {
                    let body =
                        writer::encode_body(ByteOrder::Little, &[Value::Str(owner.to_string())])
                            .unwrap();
                    reply_of(next_serial, msg, "s", body)
                }
                None => error_of(next_serial, msg, "org.bus.Error.NameHasNoOwner"),
            }
        }
        "AddMatch" => {
            let rule_str = args.first().and_then(as_str).ok_or(DriverError::BadArgument("rule"))?;
            let rule = MatchRule::parse(rule_str)?;
            match_change = Some(MatchChange::Add(rule));
            empty_reply(next_serial, msg)
        }
        "RemoveMatch" => {
            let rule_str = args.first().and_then(as_str).ok_or(DriverError::BadArgument("rule"))?;
            let rule = MatchRule::parse(rule_str)?;
            match_change = Some(MatchChange::Remove(rule));
            empty_reply(next_serial, msg)
        }
        "StartServiceByName" => {
            // Activation (spawning a service process on demand) is out
            // of scope; a name with no current owner simply has none.
            error_of(next_serial, msg, "org.bus.Error.ServiceUnknown")
        }
        other => return Err(DriverError::UnknownMethod(other.to_string())),
    };

    Ok(DriverResult {
        reply,
        owner_changes,
        match_change,
        acquired,
    })
}

fn decode_args(msg: &Message) -> Vec<Value> {
    let Some(sig) = msg.header.fields.signature.as_deref() else {
        return Vec::new();
    };
    bus_core::reader::decode_body(msg.header.order, sig, &msg.body).unwrap_or_default()
}

fn as_str(v: &Value) -> Option<&str> {
    match v {
        Value::Str(s) | Value::ObjectPath(s) => Some(s),
        _ => None,
    }
}

fn as_u32(v: &Value) -> Option<u32> {
    match v {
        Value::U32(n) => Some(*n),
        _ => None,
    }
}

fn next(next_serial: &mut u32) -> u32 {
    let s = *next_serial;
    *next_serial += 1;
    s
}

fn reply_of(next_serial: &mut u32, call: &Message, signature: &str, body: Vec<u8>) -> Message {
    Message::method_return(next(next_serial), call.header.serial)
        .with_sender(DRIVER_NAME)
        .with_destination(call.header.fields.sender.as_deref().unwrap_or(""))
        .with_body(signature, body)
}

fn empty_reply(next_serial: &mut u32, call: &Message) -> Message {
    Message::method_return(next(next_serial), call.header.serial)
        .with_sender(DRIVER_NAME)
        .with_destination(call.header.fields.sender.as_deref().unwrap_or(""))
}

fn u32_reply(next_serial: &mut u32, call: &Message, value: u32) -> Message {
    let body = writer::encode_body(ByteOrder::Little, &[Value::U32(value)]).unwrap();
    reply_of(next_serial, call, "u", body)
}

fn error_of(next_serial: &mut u32, call: &Message, error_name: &str) -> Message {
    Message::error(next(next_serial), call.header.serial, error_name)
        .with_sender(DRIVER_NAME)
        .with_destination(call.header.fields.sender.as_deref().unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_call(serial: u32) -> Message {
        Message::method_call(serial, DRIVER_PATH, Some(DRIVER_INTERFACE), "Hello")
            .with_destination(DRIVER_NAME)
    }

    #[test]
    fn hello_allocates_unique_name() {
        let mut registry = NameRegistry::new();
        let mut serial = 1;
        let result = handle(&mut registry, &mut serial, 7, &hello_call(1)).unwrap();
        assert_eq!(result.reply.header.fields.signature.as_deref(), Some("s"));
        let decoded =
            bus_core::reader::decode_body(ByteOrder::Little, "s", &result.reply.body).unwrap();
        assert_eq!(decoded, vec![Value::Str(":1.1".to_string())]);
    }

    #[test]
    fn request_name_reports_owner_change() {
        let mut registry = NameRegistry::new();
        let mut serial = 1;
        registry.allocate_unique_name(7);
        let body = writer::encode_body(
            ByteOrder::Little,
            &[Value::Str("org.bus.Test".into()), Value::U32(0)],
        )
        .unwrap();
        let call = Message::method_call(2, DRIVER_PATH, Some(DRIVER_INTERFACE), "RequestName")
            .with_destination(DRIVER_NAME)
            .with_sender(":1.1")
            .with_body("su", body);
        let result = handle(&mut registry, &mut serial, 7, &call).unwrap();
        assert_eq!(result.owner_changes.len(), 1);
        assert_eq!(result.owner_changes[0].new_owner.as_deref(), Some(":1.1"));
    }

    #[test]
    fn get_name_owner_unknown_name_errors() {
        let mut registry = NameRegistry::new();
        let mut serial = 1;
        let body = writer::encode_body(ByteOrder::Little, &[Value::Str("org.nope".into())]).unwrap();
        let call = Message::method_call(3, DRIVER_PATH, Some(DRIVER_INTERFACE), "GetNameOwner")
            .with_destination(DRIVER_NAME)
            .with_body("s", body);
        let result = handle(&mut registry, &mut serial, 7, &call).unwrap();
        assert_eq!(result.reply.header.message_type, bus_core::MessageType::Error);
        assert_eq!(
            result.reply.header.fields.error_name.as_deref(),
            Some("org.bus.Error.NameHasNoOwner")
        );
    }
}
