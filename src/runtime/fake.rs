//! Scripted in-memory network stack for tests.
//!
//! Events are queued by the test and delivered on `poll` with the same
//! hook filtering as the real stack. Every connection operation is recorded
//! so tests can assert on what the handler did.

use crate::runtime::token::{ConnId, EndpointId};
use crate::runtime::transport::{Hooks, NetStack, SessionHandler, StackError, Transport};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug)]
pub(crate) enum FakeEvent {
    Accept(Result<ConnId, StackError>),
    Sent(ConnId, usize),
    Received(ConnId, Option<Vec<u8>>),
    Idle(ConnId),
    Error(ConnId, StackError),
}

#[derive(Debug, Default)]
pub(crate) struct FakeStack {
    pub bind_error: Option<StackError>,
    pub listen_error: Option<StackError>,
    pub write_error: Option<StackError>,
    pub close_error: Option<StackError>,

    pub endpoint: Option<EndpointId>,
    pub listening: bool,
    pub accepting: bool,
    pub closed_endpoints: Vec<EndpointId>,

    pub live: HashSet<ConnId>,
    pub hooks: HashMap<ConnId, Hooks>,
    pub writes: Vec<(ConnId, Vec<u8>)>,
    pub acknowledged: usize,
    pub closed: Vec<ConnId>,
    pub aborted: Vec<ConnId>,

    pub queue: VecDeque<FakeEvent>,
    next_id: usize,
}

impl FakeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a live connection without announcing it.
    pub fn open(&mut self) -> ConnId {
        self.next_id += 1;
        let conn = ConnId(100 + self.next_id);
        self.live.insert(conn);
        conn
    }

    /// Queue an incoming client connection.
    pub fn connect(&mut self) -> ConnId {
        let conn = self.open();
        self.queue.push_back(FakeEvent::Accept(Ok(conn)));
        conn
    }

    pub fn push(&mut self, event: FakeEvent) {
        self.queue.push_back(event);
    }

    pub fn last_write(&self) -> Option<&[u8]> {
        self.writes.last().map(|(_, data)| data.as_slice())
    }

    /// Acknowledge the latest write and queue `reply` as the peer's response.
    pub fn reply_to_last_write(&mut self, reply: Vec<u8>) {
        if let Some((conn, data)) = self.writes.last() {
            let (conn, len) = (*conn, data.len());
            self.queue.push_back(FakeEvent::Sent(conn, len));
            self.queue.push_back(FakeEvent::Received(conn, Some(reply)));
        }
    }

    /// Behave like a compliant echo client for the latest write.
    pub fn echo_last_write(&mut self) {
        if let Some(data) = self.last_write().map(<[u8]>::to_vec) {
            self.reply_to_last_write(data);
        }
    }

    fn hooks_for(&self, conn: ConnId) -> Option<Hooks> {
        if self.live.contains(&conn) {
            Some(self.hooks.get(&conn).copied().unwrap_or_default())
        } else {
            None
        }
    }
}

impl Transport for FakeStack {
    fn register(&mut self, conn: ConnId, hooks: Hooks) {
        if self.live.contains(&conn) {
            self.hooks.insert(conn, hooks);
        }
    }

    fn write(&mut self, conn: ConnId, data: &[u8]) -> Result<(), StackError> {
        if !self.live.contains(&conn) {
            return Err(StackError::NotConnected);
        }
        if let Some(err) = self.write_error.take() {
            return Err(err);
        }
        self.writes.push((conn, data.to_vec()));
        Ok(())
    }

    fn acknowledge(&mut self, _conn: ConnId, len: usize) {
        self.acknowledged += len;
    }

    fn close(&mut self, conn: ConnId) -> Result<(), StackError> {
        if !self.live.contains(&conn) {
            return Err(StackError::NotConnected);
        }
        if let Some(err) = self.close_error.take() {
            return Err(err);
        }
        self.live.remove(&conn);
        self.closed.push(conn);
        Ok(())
    }

    fn abort(&mut self, conn: ConnId) {
        if self.live.remove(&conn) {
            self.aborted.push(conn);
        }
    }
}

impl NetStack for FakeStack {
    fn bind(&mut self, _addr: SocketAddr) -> Result<EndpointId, StackError> {
        if let Some(err) = self.bind_error.take() {
            return Err(err);
        }
        let endpoint = EndpointId(1);
        self.endpoint = Some(endpoint);
        Ok(endpoint)
    }

    fn listen(&mut self, _endpoint: EndpointId, _backlog: u32) -> Result<(), StackError> {
        if let Some(err) = self.listen_error.take() {
            return Err(err);
        }
        self.listening = true;
        Ok(())
    }

    fn set_accept(&mut self, _endpoint: EndpointId, enabled: bool) {
        self.accepting = enabled;
    }

    fn close_endpoint(&mut self, endpoint: EndpointId) {
        if self.endpoint.take().is_some() {
            self.listening = false;
            self.accepting = false;
            self.closed_endpoints.push(endpoint);
        }
    }

    fn local_addr(&self, _endpoint: EndpointId) -> Option<SocketAddr> {
        self.endpoint.map(|_| SocketAddr::from(([127, 0, 0, 1], 4242)))
    }

    fn poll(
        &mut self,
        handler: &mut dyn SessionHandler,
        _timeout: Option<Duration>,
    ) -> io::Result<()> {
        while let Some(event) = self.queue.pop_front() {
            match event {
                FakeEvent::Accept(accepted) => {
                    let Some(endpoint) = self.endpoint.filter(|_| self.accepting) else {
                        continue;
                    };
                    let conn = accepted.ok();
                    if handler.on_accepted(self, endpoint, accepted).is_err() {
                        if let Some(conn) = conn {
                            self.abort(conn);
                        }
                    }
                }
                FakeEvent::Sent(conn, len) => {
                    if self.hooks_for(conn).is_some_and(|h| h.sent) {
                        handler.on_sent(self, conn, len);
                    }
                }
                FakeEvent::Received(conn, data) => {
                    if self.hooks_for(conn).is_some_and(|h| h.received) {
                        handler.on_received(self, conn, data.as_deref());
                    }
                }
                FakeEvent::Idle(conn) => {
                    if self.hooks_for(conn).is_some_and(|h| h.idle_ticks.is_some()) {
                        handler.on_idle(self, conn);
                    }
                }
                FakeEvent::Error(conn, err) => {
                    if self.hooks_for(conn).is_some_and(|h| h.error) {
                        self.live.remove(&conn);
                        handler.on_error(conn, err);
                    }
                }
            }
        }
        Ok(())
    }
}
