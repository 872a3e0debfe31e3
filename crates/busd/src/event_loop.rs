//! Single-threaded cooperative event loop (C3).
//!
//! Everything here runs on one thread: the listening socket, every
//! accepted peer, repeating timeouts, and a FIFO dispatch queue of
//! connections with at least one fully buffered incoming frame. Each
//! iteration runs in a fixed order — due timeouts, then ready sockets,
//! then one pass over the dispatch queue — so a connection that is
//! both due for a timeout and has pending dispatch work never sees
//! the two reordered.
//!
//! `poll(2)` is used directly rather than an async runtime: exactly
//! one thread ever touches connection state here, so there's no
//! shared state for a multi-task runtime to protect — pulling one in
//! would only reintroduce the problem this design avoids.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bus_core::Message;
use bus_engine::{Connection, ConnId, Context, Dispatcher};

use crate::transport::{Listener, PeerConnection};

pub type TimeoutId = u64;

struct TimeoutEntry {
    id: TimeoutId,
    interval: Duration,
    next_fire: Instant,
    callback: Box<dyn FnMut()>,
}

pub struct EventLoop {
    listener: Listener,
    peers: HashMap<ConnId, PeerConnection>,
    next_conn_id: ConnId,
    pub dispatcher: Dispatcher,
    ctx: Box<dyn Context>,
    timeouts: Vec<TimeoutEntry>,
    next_timeout_id: TimeoutId,
    dispatch_queue: VecDeque<ConnId>,
    /// Set when a commit most recently failed for lack of outgoing
    /// buffer room; dispatch is skipped until this deadline passes,
    /// giving receivers a chance to drain.
    oom_until: Option<Instant>,
    oom_retry_interval: Duration,
    max_outgoing_bytes: usize,
    run_depth: u32,
    quit_requested: bool,
}

impl EventLoop {
    pub fn new(
        listener: Listener,
        dispatcher: Dispatcher,
        ctx: Box<dyn Context>,
        oom_retry_interval: Duration,
        max_outgoing_bytes: usize,
    ) -> Self {
        EventLoop {
            listener,
            peers: HashMap::new(),
            next_conn_id: 1,
            dispatcher,
            ctx,
            timeouts: Vec::new(),
            next_timeout_id: 1,
            dispatch_queue: VecDeque::new(),
            oom_until: None,
            oom_retry_interval,
            max_outgoing_bytes,
            run_depth: 0,
            quit_requested: false,
        }
    }

    pub fn add_timeout(&mut self, interval: Duration, callback: impl FnMut() + 'static) -> TimeoutId {
        let id = self.next_timeout_id;
        self.next_timeout_id += 1;
        self.timeouts.push(TimeoutEntry {
            id,
            interval,
            next_fire: Instant::now() + interval,
            callback: Box::new(callback),
        });
        id
    }

    pub fn remove_timeout(&mut self, id: TimeoutId) {
        self.timeouts.retain(|t| t.id != id);
    }

    fn oom_active(&self, now: Instant) -> bool {
        self.oom_until.map(|until| now < until).unwrap_or(false)
    }

    /// Quit after the current iteration. With nested `run` calls the
    /// loop only actually stops once every level has called `quit` —
    /// a `run` invoked from inside a dispatched callback nests, and
    /// its `quit` unwinds only that inner level.
    pub fn quit(&mut self) {
        self.quit_requested = true;
    }

    pub fn run(&mut self) {
        self.run_depth += 1;
        let this_depth = self.run_depth;
        self.quit_requested = false;
        while !self.quit_requested && self.run_depth >= this_depth {
            self.iterate();
        }
        self.run_depth = self.run_depth.saturating_sub(1);
    }

    /// Fire due timeouts, service ready sockets, then drain one pass
    /// of the dispatch queue. Returns the number of messages
    /// dispatched, so tests and callers can observe progress.
    pub fn iterate(&mut self) -> usize {
        let now = Instant::now();
        self.fire_due_timeouts(now);
        self.poll_sockets();
        self.drain_dispatch_queue(now)
    }

    fn fire_due_timeouts(&mut self, now: Instant) {
        for entry in &mut self.timeouts {
            if now >= entry.next_fire {
                (entry.callback)();
                // Re-anchor on `now` instead of drifting forward from
                // the old deadline, so a long stall doesn't cause a
                // burst of catch-up fires.
                entry.next_fire = now + entry.interval;
            }
        }
    }

    fn poll_sockets(&mut self) {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.peers.len() + 1);
        fds.push(libc::pollfd {
            fd: self.listener.fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        let order: Vec<ConnId> = self.peers.keys().copied().collect();
        for id in &order {
            let peer = &self.peers[id];
            let mut events = libc::POLLIN;
            if self
                .dispatcher
                .connections
                .get(id)
                .map(|c| !c.outgoing.is_empty())
                .unwrap_or(false)
            {
                events |= libc::POLLOUT;
            }
            fds.push(libc::pollfd {
                fd: peer.fd(),
                events,
                revents: 0,
            });
        }

        let timeout_ms = self.next_timeout_deadline_ms();
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n <= 0 {
            return;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.accept_new_connections();
        }

        let mut closed = Vec::new();
        for (i, id) in order.iter().enumerate() {
            let revents = fds[i + 1].revents;
            if revents == 0 {
                continue;
            }
            if revents & libc::POLLOUT != 0 {
                if let (Some(peer), Some(conn)) = (self.peers.get_mut(id), self.dispatcher.connections.get_mut(id)) {
                    peer.flush_outgoing(&mut conn.outgoing);
                }
            }
            if revents & libc::POLLIN != 0 {
                let alive = match (self.peers.get_mut(id), self.dispatcher.connections.get_mut(id)) {
                    (Some(peer), Some(conn)) => peer.read_into(&mut conn.incoming),
                    _ => false,
                };
                if alive {
                    self.dispatch_queue.push_back(*id);
                } else {
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            self.peers.remove(&id);
            self.dispatcher.remove_connection(id);
        }
    }

    fn next_timeout_deadline_ms(&self) -> i32 {
        let now = Instant::now();
        self.timeouts
            .iter()
            .map(|t| t.next_fire.saturating_duration_since(now).as_millis() as i32)
            .min()
            .unwrap_or(1000)
            .max(0)
    }

    fn accept_new_connections(&mut self) {
        while let Some(socket) = self.listener.accept_one() {
            let id = self.next_conn_id;
            self.next_conn_id += 1;
            self.dispatcher.add_connection(Connection::new(id, self.max_outgoing_bytes));
            self.peers.insert(id, PeerConnection::from_accepted(socket, id));
        }
    }

    /// Decode and dispatch every complete frame sitting in the
    /// incoming buffer of each queued connection. Stops (leaving the
    /// rest of the queue for next time) the moment a commit hits the
    /// OOM back-off.
    fn drain_dispatch_queue(&mut self, now: Instant) -> usize {
        if self.oom_active(now) {
            return 0;
        }
        let mut dispatched = 0;
        while let Some(id) = self.dispatch_queue.pop_front() {
            let Some(conn) = self.dispatcher.connections.get_mut(&id) else {
                continue;
            };
            let mut buf = std::mem::take(&mut conn.incoming);
            let mut messages = Vec::new();
            let mut offset = 0;
            while let Ok(Some((msg, len))) = Message::decode(&buf[offset..]) {
                messages.push(msg);
                offset += len;
            }
            let remainder = buf.split_off(offset);
            if let Some(conn) = self.dispatcher.connections.get_mut(&id) {
                conn.incoming = remainder;
            }

            for msg in messages {
                let keep_connection = self.dispatcher.dispatch(self.ctx.as_ref(), id, msg);
                dispatched += 1;
                if !keep_connection {
                    self.peers.remove(&id);
                    self.dispatcher.remove_connection(id);
                    break;
                }
                if self.dispatcher.take_oom() {
                    self.oom_until = Some(Instant::now() + self.oom_retry_interval);
                    self.dispatch_queue.push_front(id);
                    return dispatched;
                }
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_engine::AllowAll;
    use std::path::Path;

    fn temp_socket_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("busd-event-loop-test-{name}-{}", std::process::id()))
    }

    fn new_loop(name: &str) -> EventLoop {
        let path = temp_socket_path(name);
        let listener = Listener::bind(&path).unwrap();
        EventLoop::new(
            listener,
            Dispatcher::default(),
            Box::new(AllowAll),
            Duration::from_millis(50),
            64 * 1024 * 1024,
        )
    }

    #[test]
    fn timeout_fires_after_interval_elapses() {
        let mut ev = new_loop("timeout");
        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let fired2 = fired.clone();
        ev.add_timeout(Duration::from_millis(1), move || fired2.set(fired2.get() + 1));
        std::thread::sleep(Duration::from_millis(5));
        ev.fire_due_timeouts(Instant::now());
        assert!(fired.get() >= 1);
    }

    #[test]
    fn bind_removes_stale_socket_file() {
        let path = temp_socket_path("rebind");
        let _ = std::fs::remove_file(&path);
        let _first = Listener::bind(&path).unwrap();
        assert!(Path::new(&path).exists());
        let _second = Listener::bind(&path).unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
