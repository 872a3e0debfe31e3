//! The dispatcher (C5): stamps the sender, routes driver calls,
//! resolves destinations, checks policy, fans signals out through the
//! matchmaker, and commits the result transactionally — falling back
//! to a no-memory reply if even that can't be queued.

use std::collections::HashMap;

use bus_core::{Message, MessageType};

use crate::connection::{Connection, Transaction, TransactionError};
use crate::driver::{self, DriverError, MatchChange, OwnerChange, DRIVER_INTERFACE, DRIVER_NAME, DRIVER_PATH};
use crate::registry::{ConnId, NameRegistry};

/// Host-provided policy hook. Kept as a trait so the engine doesn't
/// need to know how a concrete deployment decides who may talk to
/// whom; `busd` wires a concrete implementation from `BusConfig`.
pub trait Context {
    /// Return `true` if `sender` is allowed to send this message to
    /// `destination` (`None` destination means a signal broadcast).
    fn check_policy(&self, sender: ConnId, destination: Option<ConnId>, message: &Message) -> bool;
}

/// A permissive context — every send is allowed. Matches
/// `PolicyConfig::allow_all`.
pub struct AllowAll;

impl Context for AllowAll {
    fn check_policy(&self, _sender: ConnId, _destination: Option<ConnId>, _message: &Message) -> bool {
        true
    }
}

pub struct Dispatcher {
    pub registry: NameRegistry,
    pub connections: HashMap<ConnId, Connection>,
    next_serial: u32,
    /// Set the moment any transaction fails to commit for lack of
    /// outgoing buffer room; drained by the event loop, which uses it
    /// to back off dispatching for a while.
    oom_hit: bool,
    max_match_rules: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Dispatcher {
    pub fn new(max_match_rules: usize) -> Self {
        Dispatcher {
            registry: NameRegistry::new(),
            connections: HashMap::new(),
            next_serial: 1,
            oom_hit: false,
            max_match_rules,
        }
    }

    /// Read and clear the OOM flag. `true` means some dispatch since
    /// the last call hit a full outgoing buffer.
    pub fn take_oom(&mut self) -> bool {
        std::mem::take(&mut self.oom_hit)
    }

    pub fn add_connection(&mut self, conn: Connection) {
        self.connections.insert(conn.id, conn);
    }

    /// Drop a connection and fan out `NameOwnerChanged` for every
    /// well-known name it released or handed off as a result.
    pub fn remove_connection(&mut self, conn_id: ConnId) {
        let old_owner_unique = self.registry.unique_name_of(conn_id).map(str::to_string);
        tracing::debug!(conn_id, unique_name = old_owner_unique.as_deref().unwrap_or(""), "connection removed");
        self.connections.remove(&conn_id);
        let changes = self.registry.disconnect(conn_id);
        for (name, new_conn) in changes {
            let new_owner = new_conn.and_then(|c| self.registry.unique_name_of(c).map(str::to_string));
            self.emit_name_owner_changed(&name, old_owner_unique.clone(), new_owner);
        }
    }

    /// Run one incoming message through the full dispatch pipeline.
    /// Any replies/signals generated as a side effect (driver replies,
    /// `NameOwnerChanged`) are queued on the relevant connections'
    /// outgoing buffers before this returns. Returns `false` if the
    /// connection committed a protocol violation and must be
    /// disconnected; the caller owes it no reply in that case.
    pub fn dispatch(&mut self, ctx: &dyn Context, sender: ConnId, mut message: Message) -> bool {
        // Step 0: a connection with no unique name yet has not completed
        // `Hello` and may send nothing else — anything else is a
        // protocol violation.
        let is_hello_call = message.header.message_type == MessageType::MethodCall
            && message.header.fields.destination.as_deref() == Some(DRIVER_NAME)
            && message.header.fields.member.as_deref() == Some("Hello");
        if self.registry.unique_name_of(sender).is_none() && !is_hello_call {
            tracing::warn!(conn_id = sender, "message sent before Hello; disconnecting");
            return false;
        }

        // Step 1: stamp the real sender, overriding anything the peer claimed.
        let sender_unique = self
            .registry
            .unique_name_of(sender)
            .map(str::to_string)
            .unwrap_or_default();
        message.header.fields.sender = Some(sender_unique.clone());

        let destination = message.header.fields.destination.clone();

        // Step 2: driver calls are handled in-process, never forwarded.
        if destination.as_deref() == Some(DRIVER_NAME) && message.header.message_type == MessageType::MethodCall
        {
            let mut result = match driver::handle(&mut self.registry, &mut self.next_serial, sender, &message) {
                Ok(result) => result,
                Err(err) => {
                    // Every driver-call failure still owes the sender a
                    // reply — a blocking client's `call` would otherwise
                    // wait forever for a method-return that never comes.
                    let error_name = match err {
                        DriverError::UnknownMethod(_) => "org.bus.Error.UnknownMethod",
                        DriverError::BadArgument(_) | DriverError::MatchRule(_) => "org.bus.Error.InvalidArgs",
                    };
                    self.reply_error(sender, message.header.serial, error_name);
                    return true;
                }
            };
            if let Some(change) = result.match_change.take() {
                self.apply_match_change(sender, change, &mut result.reply);
            }
            let mut txn = Transaction::new();
            txn.add(sender, result.reply.encode());
            for name in &result.acquired {
                txn.add(sender, self.name_acquired_signal(name).encode());
            }
            self.commit_or_recover(txn, sender, message.header.serial);
            for change in result.owner_changes {
                self.emit_owner_change(change);
            }
            return true;
        }

        // Step 3/4: resolve destination and check policy.
        let dest_conn = destination.as_deref().and_then(|d| self.registry.name_owner(d));
        if !ctx.check_policy(sender, dest_conn, &message) {
            tracing::info!(
                sender = %sender_unique,
                destination = destination.as_deref().unwrap_or(""),
                member = message.header.fields.member.as_deref().unwrap_or(""),
                "policy denied send"
            );
            self.reply_error(sender, message.header.serial, "org.bus.Error.AccessDenied");
            return true;
        }

        match message.header.message_type {
            MessageType::Signal => {
                self.fan_out_signal(sender, &sender_unique, message);
            }
            MessageType::MethodCall | MessageType::MethodReturn | MessageType::Error => match dest_conn {
                Some(target) => {
                    let mut txn = Transaction::new();
                    txn.add(target, message.encode());
                    self.commit_or_recover(txn, sender, message.header.serial);
                }
                None => {
                    if message.header.message_type == MessageType::MethodCall {
                        self.reply_error(sender, message.header.serial, "org.bus.Error.ServiceDoesNotExist");
                    }
                    // method returns/errors with no resolvable destination are dropped silently
                }
            },
        }
        true
    }

    /// Apply an `AddMatch`/`RemoveMatch` decision to the sender's
    /// connection, downgrading `reply` to an error if adding would
    /// exceed the per-connection rule limit.
    fn apply_match_change(&mut self, sender: ConnId, change: MatchChange, reply: &mut Message) {
        let limit = self.max_match_rules;
        let Some(conn) = self.connections.get_mut(&sender) else {
            return;
        };
        match change {
            MatchChange::Add(rule) => {
                if !conn.try_add_match(rule, limit) {
                    let serial = self.next_serial;
                    self.next_serial += 1;
                    let reply_serial = reply.header.fields.reply_serial.unwrap_or(0);
                    *reply = Message::error(serial, reply_serial, "org.bus.Error.LimitsExceeded")
                        .with_sender(DRIVER_NAME);
                }
            }
            MatchChange::Remove(rule) => {
                conn.remove_match(&rule);
            }
        }
    }

    /// Sent directly to a connection that just acquired a name
    /// (`Hello`'s unique name, or a well-known name via
    /// `RequestName`) — unicast, not run through the matchmaker.
    fn name_acquired_signal(&mut self, name: &str) -> Message {
        let serial = self.next_serial;
        self.next_serial += 1;
        let body = bus_core::writer::encode_body(
            bus_core::codec::ByteOrder::Little,
            &[bus_core::value::Value::Str(name.to_string())],
        )
        .unwrap();
        Message::signal(serial, DRIVER_PATH, DRIVER_INTERFACE, "NameAcquired")
            .with_sender(DRIVER_NAME)
            .with_body("s", body)
    }

    /// Broadcast a signal to every connection whose match rules are
    /// satisfied, excluding the sender itself — a connection never
    /// gets its own broadcast back, even if it subscribed to the
    /// exact rule that would otherwise match it.
    fn fan_out_signal(&mut self, sender: ConnId, sender_unique: &str, message: Message) {
        let mut txn = Transaction::new();
        let encoded = message.encode();
        let arg0 = arg0_str(&message);
        for conn in self.connections.values() {
            if conn.id == sender {
                continue;
            }
            let matched = conn
                .match_rules()
                .any(|rule| rule.matches(&message.header, sender_unique, arg0.as_deref()));
            if matched {
                txn.add(conn.id, encoded.clone());
            }
        }
        if !txn.is_empty() {
            self.commit_or_recover(txn, sender, message.header.serial);
        }
    }

    /// Commit a transaction; on failure fall back to a no-memory
    /// reply to the sender (mirrors a real bus's documented last
    /// resort when it can't queue something it has already decided to
    /// send).
    fn commit_or_recover(&mut self, txn: Transaction, sender: ConnId, reply_serial: u32) {
        if let Err(TransactionError::NoMemory(_)) = txn.commit(&mut self.connections) {
            self.oom_hit = true;
            if let Some(conn) = self.connections.get_mut(&sender) {
                conn.send_no_memory(reply_serial);
            }
        }
    }

    fn reply_error(&mut self, sender: ConnId, reply_serial: u32, error_name: &str) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let msg = Message::error(serial, reply_serial, error_name).with_sender(DRIVER_NAME);
        let mut txn = Transaction::new();
        txn.add(sender, msg.encode());
        self.commit_or_recover(txn, sender, reply_serial);
    }

    fn emit_owner_change(&mut self, change: OwnerChange) {
        self.emit_name_owner_changed(&change.name, change.old_owner, change.new_owner);
    }

    fn emit_name_owner_changed(&mut self, name: &str, old_owner: Option<String>, new_owner: Option<String>) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let body = bus_core::writer::encode_body(
            bus_core::codec::ByteOrder::Little,
            &[
                bus_core::value::Value::Str(name.to_string()),
                bus_core::value::Value::Str(old_owner.unwrap_or_default()),
                bus_core::value::Value::Str(new_owner.unwrap_or_default()),
            ],
        )
        .unwrap();
        let signal = Message::signal(serial, "/org/bus", "org.bus", "NameOwnerChanged")
            .with_sender(DRIVER_NAME)
            .with_body("sss", body);
        self.fan_out_signal(0, DRIVER_NAME, signal);
    }
}

fn arg0_str(message: &Message) -> Option<String> {
    let sig = message.header.fields.signature.as_deref()?;
    let values = bus_core::reader::decode_body(message.header.order, sig, &message.body).ok()?;
    match values.first()? {
        bus_core::value::Value::Str(s) | bus_core::value::Value::ObjectPath(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_rule::MatchRule;
    use bus_core::reader::decode_body;
    use bus_core::codec::ByteOrder;
    use bus_core::value::Value;

    fn hello(conn: &mut Dispatcher, id: ConnId) -> String {
        conn.add_connection(Connection::new(id, 1 << 20));
        let call = Message::method_call(1, driver::DRIVER_PATH, Some(driver::DRIVER_INTERFACE), "Hello")
            .with_destination(DRIVER_NAME);
        conn.dispatch(&AllowAll, id, call);
        conn.registry.unique_name_of(id).unwrap().to_string()
    }

    #[test]
    fn hello_round_trip_assigns_and_replies_with_unique_name() {
        let mut d = Dispatcher::default();
        let unique = hello(&mut d, 1);
        assert_eq!(unique, ":1.1");
        let out = &d.connections[&1].outgoing;
        let (reply, _) = Message::decode(out).unwrap().unwrap();
        let body = decode_body(ByteOrder::Little, "s", &reply.body).unwrap();
        assert_eq!(body, vec![Value::Str(":1.1".to_string())]);
    }

    /// A connection that hasn't called `Hello` yet has no unique name;
    /// anything but `Hello` from it is a protocol violation.
    #[test]
    fn non_hello_call_before_hello_is_rejected() {
        let mut d = Dispatcher::default();
        d.add_connection(Connection::new(1, 1 << 20));
        let call = Message::method_call(1, driver::DRIVER_PATH, Some(driver::DRIVER_INTERFACE), "ListNames")
            .with_destination(DRIVER_NAME);
        assert!(!d.dispatch(&AllowAll, 1, call));
        assert!(d.connections[&1].outgoing.is_empty());
    }

    #[test]
    fn hello_itself_is_accepted_before_hello() {
        let mut d = Dispatcher::default();
        d.add_connection(Connection::new(1, 1 << 20));
        let call = Message::method_call(1, driver::DRIVER_PATH, Some(driver::DRIVER_INTERFACE), "Hello")
            .with_destination(DRIVER_NAME);
        assert!(d.dispatch(&AllowAll, 1, call));
        assert!(d.registry.unique_name_of(1).is_some());
    }

    /// After the method-return, the caller also gets a `NameAcquired`
    /// signal carrying the same name, sent directly rather than
    /// through the matchmaker.
    #[test]
    fn hello_is_followed_by_name_acquired_signal() {
        let mut d = Dispatcher::default();
        hello(&mut d, 1);
        let out = &d.connections[&1].outgoing;
        let (_reply, consumed) = Message::decode(out).unwrap().unwrap();
        let (signal, _) = Message::decode(&out[consumed..]).unwrap().unwrap();
        assert_eq!(signal.header.message_type, MessageType::Signal);
        assert_eq!(signal.header.fields.member.as_deref(), Some("NameAcquired"));
        let body = decode_body(ByteOrder::Little, "s", &signal.body).unwrap();
        assert_eq!(body, vec![Value::Str(":1.1".to_string())]);
    }

    #[test]
    fn method_call_to_unknown_destination_gets_service_does_not_exist_error() {
        let mut d = Dispatcher::default();
        hello(&mut d, 1);
        d.connections.get_mut(&1).unwrap().outgoing.clear();
        let call = Message::method_call(2, "/x", None, "M").with_destination("org.nope.Service");
        d.dispatch(&AllowAll, 1, call);
        let out = &d.connections[&1].outgoing;
        let (reply, _) = Message::decode(out).unwrap().unwrap();
        assert_eq!(reply.header.message_type, MessageType::Error);
        assert_eq!(
            reply.header.fields.error_name.as_deref(),
            Some("org.bus.Error.ServiceDoesNotExist")
        );
    }

    /// Three subscribers to the same broad rule; the emitter, despite
    /// matching its own rule, never receives its own broadcast back.
    #[test]
    fn emitter_never_receives_its_own_broadcast_signal() {
        let mut d = Dispatcher::default();
        hello(&mut d, 1);
        hello(&mut d, 2);
        hello(&mut d, 3);
        for id in [1, 2, 3] {
            d.connections
                .get_mut(&id)
                .unwrap()
                .add_match(MatchRule::parse("type='signal'").unwrap());
            d.connections.get_mut(&id).unwrap().outgoing.clear();
        }

        let signal = Message::signal(10, "/a", "a.b", "Announce");
        d.dispatch(&AllowAll, 1, signal);

        assert!(d.connections[&1].outgoing.is_empty());
        assert!(!d.connections[&2].outgoing.is_empty());
        assert!(!d.connections[&3].outgoing.is_empty());
    }

    #[test]
    fn signal_fans_out_to_matching_subscriber() {
        let mut d = Dispatcher::default();
        hello(&mut d, 1);
        hello(&mut d, 2);
        d.connections
            .get_mut(&2)
            .unwrap()
            .add_match(MatchRule::parse("type='signal',member='Tick'").unwrap());
        d.connections.get_mut(&1).unwrap().outgoing.clear();
        d.connections.get_mut(&2).unwrap().outgoing.clear();

        let signal = Message::signal(5, "/a", "a.b", "Tick");
        d.dispatch(&AllowAll, 1, signal);

        assert!(d.connections[&1].outgoing.is_empty());
        assert!(!d.connections[&2].outgoing.is_empty());
        let (decoded, _) = Message::decode(&d.connections[&2].outgoing).unwrap().unwrap();
        assert_eq!(decoded.header.fields.member.as_deref(), Some("Tick"));
    }

    #[test]
    fn request_name_emits_name_owner_changed_to_subscriber() {
        let mut d = Dispatcher::default();
        hello(&mut d, 1);
        hello(&mut d, 2);
        d.connections.get_mut(&2).unwrap().add_match(
            MatchRule::parse("type='signal',member='NameOwnerChanged'").unwrap(),
        );
        d.connections.get_mut(&2).unwrap().outgoing.clear();

        let body = bus_core::writer::encode_body(
            ByteOrder::Little,
            &[Value::Str("org.bus.Test".into()), Value::U32(0)],
        )
        .unwrap();
        let call = Message::method_call(9, driver::DRIVER_PATH, Some(driver::DRIVER_INTERFACE), "RequestName")
            .with_destination(DRIVER_NAME)
            .with_body("su", body);
        d.dispatch(&AllowAll, 1, call);

        let (signal, _) = Message::decode(&d.connections[&2].outgoing).unwrap().unwrap();
        assert_eq!(signal.header.fields.member.as_deref(), Some("NameOwnerChanged"));
    }

    #[test]
    fn commit_falls_back_to_no_memory_reply() {
        let mut d = Dispatcher::default();
        hello(&mut d, 1);
        d.add_connection(Connection::new(2, 1)); // 1 byte of room, any real frame overflows
        d.registry.request_name(2, "org.bus.Test", 0);

        let call = Message::method_call(10, "/x", None, "M").with_destination("org.bus.Test");
        d.dispatch(&AllowAll, 1, call);

        let (reply, _) = Message::decode(&d.connections[&1].outgoing).unwrap().unwrap();
        assert_eq!(reply.header.message_type, MessageType::Error);
        assert_eq!(reply.header.fields.error_name.as_deref(), Some("org.bus.Error.NoMemory"));
    }

    /// `AddMatch` sent as a real driver call (not injected directly via
    /// `Connection::add_match`) must actually register the rule, or
    /// signal fan-out to that subscriber would silently never fire.
    #[test]
    fn add_match_call_registers_rule_on_sender_connection() {
        let mut d = Dispatcher::default();
        hello(&mut d, 1);
        d.connections[&1].outgoing.clear();

        let body = bus_core::writer::encode_body(
            ByteOrder::Little,
            &[Value::Str("type='signal',member='Tick'".to_string())],
        )
        .unwrap();
        let call = Message::method_call(2, driver::DRIVER_PATH, Some(driver::DRIVER_INTERFACE), "AddMatch")
            .with_destination(DRIVER_NAME)
            .with_body("s", body);
        d.dispatch(&AllowAll, 1, call);

        let (reply, _) = Message::decode(&d.connections[&1].outgoing).unwrap().unwrap();
        assert_eq!(reply.header.message_type, MessageType::MethodReturn);
        assert_eq!(d.connections[&1].match_rules().count(), 1);

        let signal = Message::signal(3, "/a", "a.b", "Tick");
        d.dispatch(&AllowAll, 2, signal);
        let (decoded, _) = Message::decode(&d.connections[&1].outgoing).unwrap().unwrap();
        assert_eq!(decoded.header.fields.member.as_deref(), Some("Tick"));
    }

    #[test]
    fn add_match_past_limit_replies_with_error_and_does_not_register() {
        let mut d = Dispatcher::new(1);
        hello(&mut d, 1);
        d.connections[&1].outgoing.clear();

        let add = |d: &mut Dispatcher, rule: &str, serial: u32| {
            let body =
                bus_core::writer::encode_body(ByteOrder::Little, &[Value::Str(rule.to_string())]).unwrap();
            let call = Message::method_call(serial, driver::DRIVER_PATH, Some(driver::DRIVER_INTERFACE), "AddMatch")
                .with_destination(DRIVER_NAME)
                .with_body("s", body);
            d.dispatch(&AllowAll, 1, call);
        };

        add(&mut d, "member='A'", 2);
        d.connections[&1].outgoing.clear();
        add(&mut d, "member='B'", 3);

        let (reply, _) = Message::decode(&d.connections[&1].outgoing).unwrap().unwrap();
        assert_eq!(reply.header.message_type, MessageType::Error);
        assert_eq!(
            reply.header.fields.error_name.as_deref(),
            Some("org.bus.Error.LimitsExceeded")
        );
        assert_eq!(d.connections[&1].match_rules().count(), 1);
    }
}
