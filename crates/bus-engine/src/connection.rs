//! Per-peer connection state (C4): incoming/outgoing buffers, a
//! preallocated no-memory reply, match rule bookkeeping, and the
//! transactional multi-recipient commit used by dispatch.

use std::collections::HashMap;

use bus_core::Message;

use crate::match_rule::MatchRule;
use crate::registry::ConnId;

/// The reply sent when a transaction can't be committed because a
/// recipient's outgoing queue is already full. Built once per
/// connection at connect time so sending it never itself requires the
/// allocation that's in short supply.
fn no_memory_reply(reply_serial: u32) -> Vec<u8> {
    Message::error(0, reply_serial, "org.bus.Error.NoMemory").encode()
}

pub struct Connection {
    pub id: ConnId,
    pub incoming: Vec<u8>,
    pub outgoing: Vec<u8>,
    pub max_outgoing_bytes: usize,
    /// `(rule, reference count)` — `AddMatch` on an existing rule bumps
    /// the count instead of duplicating it; `RemoveMatch` decrements
    /// and only actually removes at zero.
    match_rules: Vec<(MatchRule, u32)>,
}

impl Connection {
    pub fn new(id: ConnId, max_outgoing_bytes: usize) -> Self {
        Connection {
            id,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            max_outgoing_bytes,
            match_rules: Vec::new(),
        }
    }

    pub fn add_match(&mut self, rule: MatchRule) {
        if let Some(entry) = self.match_rules.iter_mut().find(|(r, _)| *r == rule) {
            entry.1 += 1;
        } else {
            self.match_rules.push((rule, 1));
        }
    }

    /// Like `add_match`, but refuses to grow the table past `limit`
    /// distinct rules. Bumping an existing rule's reference count is
    /// always allowed since it doesn't grow the table.
    pub fn try_add_match(&mut self, rule: MatchRule, limit: usize) -> bool {
        if self.match_rules.iter().any(|(r, _)| *r == rule) {
            self.add_match(rule);
            return true;
        }
        if self.match_rules.len() >= limit {
            return false;
        }
        self.add_match(rule);
        true
    }

    pub fn remove_match(&mut self, rule: &MatchRule) -> bool {
        if let Some(pos) = self.match_rules.iter().position(|(r, _)| r == rule) {
            let (_, count) = &mut self.match_rules[pos];
            *count -= 1;
            if *count == 0 {
                self.match_rules.remove(pos);
            }
            true
        } else {
            false
        }
    }

    pub fn match_rules(&self) -> impl Iterator<Item = &MatchRule> {
        self.match_rules.iter().map(|(r, _)| r)
    }

    /// Room left in the outgoing queue before it's considered full.
    fn remaining_capacity(&self) -> usize {
        self.max_outgoing_bytes.saturating_sub(self.outgoing.len())
    }

    /// Append the preallocated no-memory reply directly, bypassing
    /// transaction accounting — used when a transaction itself could
    /// not be committed.
    pub fn send_no_memory(&mut self, reply_serial: u32) {
        self.outgoing.extend_from_slice(&no_memory_reply(reply_serial));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("connection {0} has no room in its outgoing queue")]
    NoMemory(ConnId),
    #[error("transaction targets unknown connection {0}")]
    UnknownConnection(ConnId),
}

/// A set of encoded frames destined for one or more connections,
/// committed or cancelled as a unit. Used by the dispatcher so a
/// signal fan-out to N recipients either reaches all of them or none.
#[derive(Default)]
pub struct Transaction {
    frames: Vec<(ConnId, Vec<u8>)>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    pub fn add(&mut self, conn: ConnId, frame: Vec<u8>) {
        self.frames.push((conn, frame));
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Check every recipient has room, then append every frame.
    /// Nothing is written to any connection's outgoing buffer unless
    /// every recipient has room for its frame.
    pub fn commit(self, connections: &mut HashMap<ConnId, Connection>) -> Result<(), TransactionError> {
        for (conn_id, frame) in &self.frames {
            let conn = connections
                .get(conn_id)
                .ok_or(TransactionError::UnknownConnection(*conn_id))?;
            if frame.len() > conn.remaining_capacity() {
                return Err(TransactionError::NoMemory(*conn_id));
            }
        }
        for (conn_id, frame) in self.frames {
            // Presence was just verified above; the map isn't mutated
            // in between, so this lookup cannot fail.
            if let Some(conn) = connections.get_mut(&conn_id) {
                conn.outgoing.extend_from_slice(&frame);
            }
        }
        Ok(())
    }

    /// Discard all pending frames without touching any connection.
    pub fn cancel(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: ConnId, cap: usize) -> Connection {
        Connection::new(id, cap)
    }

    #[test]
    fn commit_delivers_to_all_recipients() {
        let mut connections = HashMap::new();
        connections.insert(1, conn(1, 1024));
        connections.insert(2, conn(2, 1024));

        let mut txn = Transaction::new();
        txn.add(1, vec![1, 2, 3]);
        txn.add(2, vec![4, 5, 6]);
        txn.commit(&mut connections).unwrap();

        assert_eq!(connections[&1].outgoing, vec![1, 2, 3]);
        assert_eq!(connections[&2].outgoing, vec![4, 5, 6]);
    }

    #[test]
    fn commit_is_all_or_nothing_on_oom() {
        let mut connections = HashMap::new();
        connections.insert(1, conn(1, 1024));
        connections.insert(2, conn(2, 2)); // too small for the frame below

        let mut txn = Transaction::new();
        txn.add(1, vec![1, 2, 3]);
        txn.add(2, vec![4, 5, 6]);
        let err = txn.commit(&mut connections).unwrap_err();
        assert!(matches!(err, TransactionError::NoMemory(2)));

        // Neither recipient should have received anything.
        assert!(connections[&1].outgoing.is_empty());
        assert!(connections[&2].outgoing.is_empty());
    }

    #[test]
    fn add_match_dedups_identical_rules() {
        let mut c = conn(1, 1024);
        let rule = MatchRule::parse("type='signal'").unwrap();
        c.add_match(rule.clone());
        c.add_match(rule.clone());
        assert_eq!(c.match_rules().count(), 1);
        assert!(c.remove_match(&rule));
        assert_eq!(c.match_rules().count(), 1);
        assert!(c.remove_match(&rule));
        assert_eq!(c.match_rules().count(), 0);
    }

    #[test]
    fn try_add_match_rejects_past_limit_but_allows_dedup() {
        let mut c = conn(1, 1024);
        let a = MatchRule::parse("member='A'").unwrap();
        let b = MatchRule::parse("member='B'").unwrap();
        assert!(c.try_add_match(a.clone(), 1));
        assert!(!c.try_add_match(b, 1));
        // Re-adding the same rule never counts as growth.
        assert!(c.try_add_match(a, 1));
        assert_eq!(c.match_rules().count(), 1);
    }
}
