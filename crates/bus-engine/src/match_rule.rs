//! Match rules — the filter language `AddMatch`/`RemoveMatch` accept,
//! and the linear-scan matcher the dispatcher runs every signal
//! through.

use bus_core::{Header, MessageType};

/// A parsed match rule. Every present field must match exactly for a
/// message to pass; absent fields place no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub message_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub destination: Option<String>,
    /// First body argument, if it's a string — the one arg0 filter
    /// real match rules support without decoding the whole body.
    pub arg0: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MatchRuleError {
    #[error("unknown match rule key '{0}'")]
    UnknownKey(String),
    #[error("match rule entry '{0}' is missing a quoted value")]
    BadValue(String),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
}

impl MatchRule {
    /// Parse a rule string of the form
    /// `type='signal',interface='org.bus.Test',member='Changed'`.
    pub fn parse(rule: &str) -> Result<Self, MatchRuleError> {
        let mut out = MatchRule::default();
        if rule.trim().is_empty() {
            return Ok(out);
        }
        for entry in rule.split(',') {
            let entry = entry.trim();
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| MatchRuleError::BadValue(entry.to_string()))?;
            let value = value.trim();
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(|| MatchRuleError::BadValue(entry.to_string()))?;
            match key.trim() {
                "type" => {
                    out.message_type = Some(match value {
                        "method_call" => MessageType::MethodCall,
                        "method_return" => MessageType::MethodReturn,
                        "error" => MessageType::Error,
                        "signal" => MessageType::Signal,
                        other => return Err(MatchRuleError::UnknownType(other.to_string())),
                    })
                }
                "sender" => out.sender = Some(value.to_string()),
                "interface" => out.interface = Some(value.to_string()),
                "member" => out.member = Some(value.to_string()),
                "path" => out.path = Some(value.to_string()),
                "destination" => out.destination = Some(value.to_string()),
                "arg0" => out.arg0 = Some(value.to_string()),
                other => return Err(MatchRuleError::UnknownKey(other.to_string())),
            }
        }
        Ok(out)
    }

    /// Does this rule match a header, given the sender's resolved
    /// unique name and (if already decoded) the message's arg0?
    pub fn matches(&self, header: &Header, sender_unique: &str, arg0: Option<&str>) -> bool {
        if let Some(t) = self.message_type {
            if t != header.message_type {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if sender != sender_unique && Some(sender.as_str()) != header.fields.sender.as_deref() {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if header.fields.interface.as_deref() != Some(interface.as_str()) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if header.fields.member.as_deref() != Some(member.as_str()) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if header.fields.path.as_deref() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(destination) = &self.destination {
            if header.fields.destination.as_deref() != Some(destination.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.arg0 {
            if arg0 != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_core::MessageType;

    fn header(message_type: MessageType) -> Header {
        Header {
            order: bus_core::codec::ByteOrder::Little,
            message_type,
            flags: 0,
            version: 1,
            body_length: 0,
            serial: 1,
            fields: Default::default(),
        }
    }

    #[test]
    fn parses_multi_key_rule() {
        let rule =
            MatchRule::parse("type='signal',interface='org.bus.Test',member='Changed'").unwrap();
        assert_eq!(rule.message_type, Some(MessageType::Signal));
        assert_eq!(rule.interface.as_deref(), Some("org.bus.Test"));
        assert_eq!(rule.member.as_deref(), Some("Changed"));
    }

    #[test]
    fn rejects_unknown_key() {
        assert!(matches!(
            MatchRule::parse("bogus='x'"),
            Err(MatchRuleError::UnknownKey(_))
        ));
    }

    #[test]
    fn empty_rule_matches_everything() {
        let rule = MatchRule::parse("").unwrap();
        assert!(rule.matches(&header(MessageType::Signal), ":1.1", None));
        assert!(rule.matches(&header(MessageType::MethodCall), ":1.1", None));
    }

    #[test]
    fn type_mismatch_fails() {
        let rule = MatchRule::parse("type='signal'").unwrap();
        assert!(!rule.matches(&header(MessageType::MethodCall), ":1.1", None));
    }

    #[test]
    fn arg0_filter_respected() {
        let rule = MatchRule::parse("arg0='org.bus.Thing'").unwrap();
        let h = header(MessageType::Signal);
        assert!(!rule.matches(&h, ":1.1", None));
        assert!(!rule.matches(&h, ":1.1", Some("other")));
        assert!(rule.matches(&h, ":1.1", Some("org.bus.Thing")));
    }
}
