//! mio network stack.
//!
//! Readiness-based model: poll tells us when sockets are ready, we perform
//! non-blocking accept/read/write syscalls and turn the outcome into queued
//! events. The queue is then drained in FIFO order into the handler. Events
//! raised while a handler runs (a write issued from a callback, say) are
//! appended to the same queue and delivered after the current callback
//! returns, never from inside it.

use crate::config::Config;
use crate::runtime::connection::{ReadState, StackConnection};
use crate::runtime::token::{ConnId, EndpointId};
use crate::runtime::transport::{Hooks, NetStack, SessionHandler, StackError, Transport};
use bytes::{Bytes, BytesMut};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Largest single read handed to the handler.
const READ_CHUNK: usize = 4096;

/// Tunables for [`MioStack`].
#[derive(Debug, Clone, Copy)]
pub struct StackOptions {
    /// Length of one coarse timer tick.
    pub tick: Duration,
    /// Per-connection outbound buffer capacity.
    pub send_capacity: usize,
    /// Bytes delivered but not yet acknowledged before reading pauses.
    pub recv_window: usize,
    pub events_capacity: usize,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            send_capacity: 8192,
            recv_window: 4096,
            events_capacity: 64,
        }
    }
}

impl From<&Config> for StackOptions {
    fn from(config: &Config) -> Self {
        Self {
            tick: Duration::from_millis(config.tick_ms),
            send_capacity: config.send_buffer,
            recv_window: config.recv_window,
            ..Self::default()
        }
    }
}

enum EndpointState {
    Bound(Socket),
    Listening(TcpListener),
    Closed,
}

struct Endpoint {
    state: EndpointState,
    accept: bool,
}

enum Slot {
    Endpoint(Endpoint),
    Connection(StackConnection),
}

#[derive(Debug)]
enum StackEvent {
    Accepted(EndpointId, Result<ConnId, StackError>),
    Sent(ConnId, usize),
    Received(ConnId, Option<Bytes>),
    Idle(ConnId),
    Error(ConnId, StackError),
}

/// Network stack backed by mio (epoll on Linux, kqueue on macOS).
pub struct MioStack {
    poll: Poll,
    events: Events,
    slots: Slab<Slot>,
    queue: VecDeque<StackEvent>,
    /// Sockets needing an accept/read/flush pass outside of a readiness event.
    dirty: Vec<Token>,
    options: StackOptions,
    last_tick: Instant,
}

impl MioStack {
    pub fn new(mut options: StackOptions) -> io::Result<Self> {
        options.tick = options.tick.max(Duration::from_millis(1));
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(options.events_capacity.max(1)),
            slots: Slab::new(),
            queue: VecDeque::new(),
            dirty: Vec::new(),
            options,
            last_tick: Instant::now(),
        })
    }

    fn connection_mut(&mut self, conn: ConnId) -> Option<&mut StackConnection> {
        match self.slots.get_mut(conn.0) {
            Some(Slot::Connection(c)) => Some(c),
            _ => None,
        }
    }

    fn hooks(&self, conn: ConnId) -> Option<Hooks> {
        match self.slots.get(conn.0) {
            Some(Slot::Connection(c)) => Some(c.hooks),
            _ => None,
        }
    }

    fn accepting(&self, endpoint: EndpointId) -> bool {
        matches!(
            self.slots.get(endpoint.0),
            Some(Slot::Endpoint(Endpoint {
                state: EndpointState::Listening(_),
                accept: true,
            }))
        )
    }

    fn until_next_tick(&self) -> Duration {
        self.options.tick.saturating_sub(self.last_tick.elapsed())
    }

    /// Run the accept/flush/read pass for whatever owns `token`.
    fn service(&mut self, token: Token) {
        match self.slots.get(token.0) {
            Some(Slot::Endpoint(_)) => self.accept_ready(EndpointId(token.0)),
            Some(Slot::Connection(_)) => {
                let conn = ConnId::from(token);
                self.flush(conn);
                self.read_ready(conn);
            }
            None => {}
        }
    }

    fn service_dirty(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        dirty.dedup();
        for token in dirty {
            self.service(token);
        }
    }

    fn accept_ready(&mut self, endpoint: EndpointId) {
        loop {
            let accepted = match self.slots.get(endpoint.0) {
                Some(Slot::Endpoint(Endpoint {
                    state: EndpointState::Listening(listener),
                    accept: true,
                })) => listener.accept(),
                _ => return,
            };

            match accepted {
                Ok((mut stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let entry = self.slots.vacant_entry();
                    let conn = ConnId(entry.key());
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        conn.token(),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(%endpoint, error = %e, "Failed to register accepted connection");
                        self.queue
                            .push_back(StackEvent::Accepted(endpoint, Err(e.into())));
                        continue;
                    }
                    entry.insert(Slot::Connection(StackConnection::new(
                        stream,
                        self.options.send_capacity,
                        self.options.recv_window,
                    )));
                    debug!(%endpoint, %conn, peer = %peer, "Accepted connection");
                    self.queue.push_back(StackEvent::Accepted(endpoint, Ok(conn)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(%endpoint, error = %e, "Accept error");
                    self.queue
                        .push_back(StackEvent::Accepted(endpoint, Err(e.into())));
                    return;
                }
            }
        }
    }

    fn flush(&mut self, conn: ConnId) {
        let Some(c) = self.connection_mut(conn) else {
            return;
        };

        let mut sent = 0;
        let mut failure = None;
        while c.has_pending() {
            match c.send_pending() {
                Ok(0) => {
                    failure = Some(StackError::Buffer);
                    break;
                }
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e.into());
                    break;
                }
            }
        }

        if sent > 0 {
            trace!(%conn, sent, "Flushed outbound data");
            if c.hooks.sent {
                self.queue.push_back(StackEvent::Sent(conn, sent));
            }
        }
        if let Some(err) = failure {
            self.fail(conn, err);
        }
    }

    fn read_ready(&mut self, conn: ConnId) {
        loop {
            let Some(c) = self.connection_mut(conn) else {
                return;
            };
            if c.read_state != ReadState::Open {
                return;
            }

            let mut chunk = BytesMut::zeroed(c.window().min(READ_CHUNK));
            match c.stream.read(&mut chunk) {
                Ok(0) => {
                    c.read_state = ReadState::PeerClosed;
                    trace!(%conn, "Peer closed");
                    if c.hooks.received {
                        self.queue.push_back(StackEvent::Received(conn, None));
                    }
                    return;
                }
                Ok(n) => {
                    chunk.truncate(n);
                    trace!(%conn, len = n, "Read data");
                    if c.hooks.received {
                        c.delivered(n);
                        self.queue
                            .push_back(StackEvent::Received(conn, Some(chunk.freeze())));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(conn, e.into());
                    return;
                }
            }
        }
    }

    /// Release a connection after a socket error and report it if hooked.
    fn fail(&mut self, conn: ConnId, err: StackError) {
        if self.connection_mut(conn).is_none() {
            return;
        }
        if let Slot::Connection(mut c) = self.slots.remove(conn.0) {
            let _ = self.poll.registry().deregister(&mut c.stream);
            debug!(%conn, error = %err, "Connection failed");
            if c.hooks.error {
                self.queue.push_back(StackEvent::Error(conn, err));
            }
        }
    }

    fn advance_ticks(&mut self) {
        let elapsed = self.last_tick.elapsed();
        let ticks = (elapsed.as_nanos() / self.options.tick.as_nanos()) as u32;
        if ticks == 0 {
            return;
        }
        self.last_tick += self.options.tick * ticks;

        for (key, slot) in self.slots.iter_mut() {
            if let Slot::Connection(c) = slot {
                if c.tick(ticks) {
                    self.queue.push_back(StackEvent::Idle(ConnId(key)));
                }
            }
        }
    }

    fn dispatch(&mut self, handler: &mut dyn SessionHandler) {
        loop {
            self.service_dirty();
            let Some(event) = self.queue.pop_front() else {
                return;
            };
            self.deliver(handler, event);
        }
    }

    fn deliver(&mut self, handler: &mut dyn SessionHandler, event: StackEvent) {
        match event {
            StackEvent::Accepted(endpoint, accepted) => {
                let conn = accepted.ok();
                if !self.accepting(endpoint) {
                    if let Some(conn) = conn {
                        self.abort(conn);
                    }
                    return;
                }
                if let Err(e) = handler.on_accepted(self, endpoint, accepted) {
                    if let Some(conn) = conn {
                        debug!(%conn, error = %e, "Connection rejected");
                        self.abort(conn);
                    }
                }
            }
            StackEvent::Sent(conn, len) => {
                if self.hooks(conn).is_some_and(|h| h.sent) {
                    handler.on_sent(self, conn, len);
                }
            }
            StackEvent::Received(conn, data) => match self.hooks(conn) {
                Some(hooks) if hooks.received => handler.on_received(self, conn, data.as_deref()),
                Some(_) => {
                    if let Some(data) = data {
                        self.acknowledge(conn, data.len());
                    }
                }
                None => {}
            },
            StackEvent::Idle(conn) => {
                if self.hooks(conn).is_some_and(|h| h.idle_ticks.is_some()) {
                    handler.on_idle(self, conn);
                }
            }
            StackEvent::Error(conn, err) => handler.on_error(conn, err),
        }
    }
}

impl Transport for MioStack {
    fn register(&mut self, conn: ConnId, hooks: Hooks) {
        if let Some(c) = self.connection_mut(conn) {
            c.set_hooks(hooks);
        }
    }

    fn write(&mut self, conn: ConnId, data: &[u8]) -> Result<(), StackError> {
        let c = self.connection_mut(conn).ok_or(StackError::NotConnected)?;
        c.enqueue(data)?;
        self.dirty.push(conn.token());
        Ok(())
    }

    fn acknowledge(&mut self, conn: ConnId, len: usize) {
        if let Some(c) = self.connection_mut(conn) {
            if c.acknowledge(len) {
                self.dirty.push(conn.token());
            }
        }
    }

    fn close(&mut self, conn: ConnId) -> Result<(), StackError> {
        let c = self.connection_mut(conn).ok_or(StackError::NotConnected)?;
        while c.has_pending() {
            match c.send_pending() {
                Ok(n) if n > 0 => {}
                _ => break,
            }
        }
        c.stream.shutdown(Shutdown::Write)?;

        if let Slot::Connection(mut c) = self.slots.remove(conn.0) {
            let _ = self.poll.registry().deregister(&mut c.stream);
        }
        debug!(%conn, "Connection closed");
        Ok(())
    }

    fn abort(&mut self, conn: ConnId) {
        if self.connection_mut(conn).is_none() {
            return;
        }
        if let Slot::Connection(mut c) = self.slots.remove(conn.0) {
            let _ = SockRef::from(&c.stream).set_linger(Some(Duration::ZERO));
            let _ = self.poll.registry().deregister(&mut c.stream);
            debug!(%conn, "Connection aborted");
        }
    }
}

impl NetStack for MioStack {
    fn bind(&mut self, addr: SocketAddr) -> Result<EndpointId, StackError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let endpoint = EndpointId(self.slots.insert(Slot::Endpoint(Endpoint {
            state: EndpointState::Bound(socket),
            accept: false,
        })));
        debug!(%endpoint, addr = %addr, "Endpoint bound");
        Ok(endpoint)
    }

    fn listen(&mut self, endpoint: EndpointId, backlog: u32) -> Result<(), StackError> {
        let ep = match self.slots.get_mut(endpoint.0) {
            Some(Slot::Endpoint(ep)) => ep,
            _ => return Err(StackError::IllegalArgument),
        };

        let socket = match std::mem::replace(&mut ep.state, EndpointState::Closed) {
            EndpointState::Bound(socket) => socket,
            other => {
                ep.state = other;
                return Err(StackError::IsConnected);
            }
        };
        if let Err(e) = socket.listen(backlog as i32) {
            ep.state = EndpointState::Bound(socket);
            return Err(e.into());
        }

        let mut listener = TcpListener::from_std(socket.into());
        self.poll
            .registry()
            .register(&mut listener, endpoint.token(), Interest::READABLE)?;
        ep.state = EndpointState::Listening(listener);
        Ok(())
    }

    fn set_accept(&mut self, endpoint: EndpointId, enabled: bool) {
        if let Some(Slot::Endpoint(ep)) = self.slots.get_mut(endpoint.0) {
            ep.accept = enabled;
            if enabled {
                // Connections queued before enabling raise no new edge.
                self.dirty.push(endpoint.token());
            }
        }
    }

    fn close_endpoint(&mut self, endpoint: EndpointId) {
        if !matches!(self.slots.get(endpoint.0), Some(Slot::Endpoint(_))) {
            return;
        }
        if let Slot::Endpoint(ep) = self.slots.remove(endpoint.0) {
            if let EndpointState::Listening(mut listener) = ep.state {
                let _ = self.poll.registry().deregister(&mut listener);
            }
            debug!(%endpoint, "Endpoint closed");
        }
    }

    fn local_addr(&self, endpoint: EndpointId) -> Option<SocketAddr> {
        match self.slots.get(endpoint.0) {
            Some(Slot::Endpoint(ep)) => match &ep.state {
                EndpointState::Bound(socket) => socket.local_addr().ok()?.as_socket(),
                EndpointState::Listening(listener) => listener.local_addr().ok(),
                EndpointState::Closed => None,
            },
            _ => None,
        }
    }

    fn poll(
        &mut self,
        handler: &mut dyn SessionHandler,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        // Work queued since the last poll, e.g. a write made before polling.
        self.dispatch(handler);

        let next_tick = self.until_next_tick();
        let wait = timeout.map_or(next_tick, |t| t.min(next_tick));
        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in ready {
            self.service(token);
        }

        self.advance_ticks();
        self.dispatch(handler);
        Ok(())
    }
}
