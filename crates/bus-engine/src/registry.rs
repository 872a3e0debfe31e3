//! Name registry — unique name allocation and well-known name
//! ownership, including the replacement/queueing rules `RequestName`
//! and `ReleaseName` expose on the driver.

use std::collections::{HashMap, VecDeque};

/// Opaque handle for a connection, assigned by the engine when it
/// accepts a transport-level peer. Not meaningful outside one running
/// daemon.
pub type ConnId = u64;

pub const ALLOW_REPLACEMENT: u32 = 0x1;
pub const REPLACE_EXISTING: u32 = 0x2;
pub const DO_NOT_QUEUE: u32 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

#[derive(Debug, Clone)]
struct QueuedRequest {
    conn: ConnId,
    allow_replacement: bool,
}

#[derive(Debug, Clone)]
struct NameOwner {
    conn: ConnId,
    allow_replacement: bool,
    queue: VecDeque<QueuedRequest>,
}

/// Unique name allocator and well-known name ownership table. Every
/// connection gets exactly one unique name (`:1.N`) for its lifetime;
/// well-known names are owned by at most one connection at a time,
/// with queued waiters behind it per the replacement flags.
#[derive(Debug, Default)]
pub struct NameRegistry {
    next_unique: u64,
    unique_names: HashMap<ConnId, String>,
    owners: HashMap<String, NameOwner>,
}

impl NameRegistry {
    pub fn new() -> Self {
        NameRegistry {
            next_unique: 1,
            unique_names: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Assign and record a fresh unique name for a newly connected peer.
    pub fn allocate_unique_name(&mut self, conn: ConnId) -> String {
        let name = format!(":1.{}", self.next_unique);
        self.next_unique += 1;
        self.unique_names.insert(conn, name.clone());
        name
    }

    pub fn unique_name_of(&self, conn: ConnId) -> Option<&str> {
        self.unique_names.get(&conn).map(String::as_str)
    }

    pub fn conn_for_unique_name(&self, name: &str) -> Option<ConnId> {
        self.unique_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    /// Resolve a bus name (well-known or unique) to its current owning
    /// connection, if any.
    pub fn name_owner(&self, name: &str) -> Option<ConnId> {
        if name.starts_with(':') {
            return self.conn_for_unique_name(name);
        }
        self.owners.get(name).map(|o| o.conn)
    }

    pub fn has_owner(&self, name: &str) -> bool {
        self.name_owner(name).is_some()
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.unique_names.values().cloned().collect();
        names.extend(self.owners.keys().cloned());
        names.sort();
        names
    }

    /// `RequestName`. Returns the reply code, plus the connection (if
    /// any) that lost ownership as a result (a replacement), so the
    /// caller can emit `NameOwnerChanged`.
    pub fn request_name(
        &mut self,
        conn: ConnId,
        name: &str,
        flags: u32,
    ) -> (RequestNameReply, Option<ConnId>) {
        let allow_replacement = flags & ALLOW_REPLACEMENT != 0;
        let replace_existing = flags & REPLACE_EXISTING != 0;
        let do_not_queue = flags & DO_NOT_QUEUE != 0;

        match self.owners.get_mut(name) {
            None => {
                self.owners.insert(
                    name.to_string(),
                    NameOwner {
                        conn,
                        allow_replacement,
                        queue: VecDeque::new(),
                    },
                );
                (RequestNameReply::PrimaryOwner, None)
            }
            Some(owner) if owner.conn == conn => (RequestNameReply::AlreadyOwner, None),
            Some(owner) if replace_existing && owner.allow_replacement => {
                let previous = owner.conn;
                owner.conn = conn;
                owner.allow_replacement = allow_replacement;
                owner.queue.retain(|q| q.conn != conn);
                (RequestNameReply::PrimaryOwner, Some(previous))
            }
            Some(owner) => {
                if do_not_queue {
                    (RequestNameReply::Exists, None)
                } else {
                    owner.queue.retain(|q| q.conn != conn);
                    owner.queue.push_back(QueuedRequest {
                        conn,
                        allow_replacement,
                    });
                    (RequestNameReply::InQueue, None)
                }
            }
        }
    }

    /// `ReleaseName`. Returns the reply code plus the connection (if
    /// any) that became the new owner by being next in queue.
    pub fn release_name(&mut self, conn: ConnId, name: &str) -> (ReleaseNameReply, Option<ConnId>) {
        let Some(owner) = self.owners.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, None);
        };
        if owner.conn != conn {
            owner.queue.retain(|q| q.conn != conn);
            return (ReleaseNameReply::NotOwner, None);
        }
        match owner.queue.pop_front() {
            Some(next) => {
                owner.conn = next.conn;
                owner.allow_replacement = next.allow_replacement;
                (ReleaseNameReply::Released, Some(next.conn))
            }
            None => {
                self.owners.remove(name);
                (ReleaseNameReply::Released, None)
            }
        }
    }

    /// Drop all state for a disconnecting connection. Returns the
    /// well-known names it owned (now released) and any connections
    /// promoted from queue to owner as a result, so the caller can
    /// emit `NameOwnerChanged` for each.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<(String, Option<ConnId>)> {
        self.unique_names.remove(&conn);
        let mut changes = Vec::new();
        let names: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, o)| o.conn == conn || o.queue.iter().any(|q| q.conn == conn))
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            if self.owners.get(&name).map(|o| o.conn) == Some(conn) {
                let (_, new_owner) = self.release_name(conn, &name);
                changes.push((name, new_owner));
            } else if let Some(owner) = self.owners.get_mut(&name) {
                owner.queue.retain(|q| q.conn != conn);
            }
        }
        changes
    }
}
