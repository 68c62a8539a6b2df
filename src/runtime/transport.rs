//! Transport adapter interfaces.
//!
//! The network stack owns every endpoint and connection and delivers
//! events by calling into a [`SessionHandler`]. While a handler runs it is
//! given a [`Transport`], which is the only way to act on a connection from
//! inside a callback. `Transport` has no `poll`, so a callback
//! can never drive the stack and re-enter itself.

use crate::runtime::token::{ConnId, EndpointId};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Error reported by the network stack.
///
/// Codes follow the classic embedded TCP/IP stack numbering so results can
/// be compared across builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    OutOfMemory,
    Buffer,
    Timeout,
    Routing,
    InProgress,
    IllegalValue,
    WouldBlock,
    AddrInUse,
    AlreadyConnecting,
    IsConnected,
    NotConnected,
    Interface,
    /// Connection aborted locally.
    Aborted,
    /// Connection reset by the peer.
    Reset,
    Closed,
    IllegalArgument,
}

impl StackError {
    /// Stable negative integer code for this error.
    pub fn code(self) -> i32 {
        match self {
            StackError::OutOfMemory => -1,
            StackError::Buffer => -2,
            StackError::Timeout => -3,
            StackError::Routing => -4,
            StackError::InProgress => -5,
            StackError::IllegalValue => -6,
            StackError::WouldBlock => -7,
            StackError::AddrInUse => -8,
            StackError::AlreadyConnecting => -9,
            StackError::IsConnected => -10,
            StackError::NotConnected => -11,
            StackError::Interface => -12,
            StackError::Aborted => -13,
            StackError::Reset => -14,
            StackError::Closed => -15,
            StackError::IllegalArgument => -16,
        }
    }
}

impl From<io::Error> for StackError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => StackError::AddrInUse,
            io::ErrorKind::AddrNotAvailable => StackError::Interface,
            io::ErrorKind::ConnectionReset => StackError::Reset,
            io::ErrorKind::ConnectionAborted => StackError::Aborted,
            io::ErrorKind::BrokenPipe => StackError::Closed,
            io::ErrorKind::NotConnected => StackError::NotConnected,
            io::ErrorKind::TimedOut => StackError::Timeout,
            io::ErrorKind::WouldBlock => StackError::WouldBlock,
            io::ErrorKind::InvalidInput => StackError::IllegalArgument,
            io::ErrorKind::OutOfMemory => StackError::OutOfMemory,
            io::ErrorKind::WriteZero => StackError::Buffer,
            _ => StackError::IllegalValue,
        }
    }
}

impl std::fmt::Display for StackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (err {})", self, self.code())
    }
}

impl std::error::Error for StackError {}

/// Per-connection callback registration.
///
/// Each flag enables one hook. `idle_ticks` enables the idle hook at the
/// given cadence, measured in stack ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hooks {
    pub sent: bool,
    pub received: bool,
    pub error: bool,
    pub idle_ticks: Option<u32>,
}

impl Hooks {
    /// Every hook enabled, idle firing every `idle_ticks` ticks.
    pub fn all(idle_ticks: u32) -> Self {
        Self {
            sent: true,
            received: true,
            error: true,
            idle_ticks: Some(idle_ticks),
        }
    }

    /// No hooks: the stack drops events for this connection.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Connection operations available inside a callback.
pub trait Transport {
    /// Replace the hooks registered for `conn`.
    fn register(&mut self, conn: ConnId, hooks: Hooks);

    /// Clear every hook registered for `conn`.
    fn unregister(&mut self, conn: ConnId) {
        self.register(conn, Hooks::none());
    }

    /// Queue `data` for transmission. The stack copies the bytes.
    fn write(&mut self, conn: ConnId, data: &[u8]) -> Result<(), StackError>;

    /// Tell the stack `len` received bytes have been consumed.
    fn acknowledge(&mut self, conn: ConnId, len: usize);

    /// Graceful close. On error the connection is still owned by the caller.
    fn close(&mut self, conn: ConnId) -> Result<(), StackError>;

    /// Abortive close. Always releases the connection.
    fn abort(&mut self, conn: ConnId);
}

/// The host network stack: endpoints plus the event pump.
pub trait NetStack: Transport {
    /// Create an endpoint bound to `addr`. A failed bind releases the socket.
    fn bind(&mut self, addr: SocketAddr) -> Result<EndpointId, StackError>;

    /// Start listening with the given backlog depth.
    fn listen(&mut self, endpoint: EndpointId, backlog: u32) -> Result<(), StackError>;

    /// Enable or disable accept callbacks for `endpoint`.
    fn set_accept(&mut self, endpoint: EndpointId, enabled: bool);

    /// Release an endpoint. Unknown handles are ignored.
    fn close_endpoint(&mut self, endpoint: EndpointId);

    fn local_addr(&self, endpoint: EndpointId) -> Option<SocketAddr>;

    /// Wait up to `timeout` for activity and dispatch all resulting events.
    fn poll(&mut self, handler: &mut dyn SessionHandler, timeout: Option<Duration>)
        -> io::Result<()>;
}

/// Receiver of stack events.
pub trait SessionHandler {
    /// A connection arrived on `endpoint`, or accepting it failed.
    ///
    /// Returning an error for an accepted connection makes the stack abort it.
    fn on_accepted(
        &mut self,
        net: &mut dyn Transport,
        endpoint: EndpointId,
        accepted: Result<ConnId, StackError>,
    ) -> Result<(), StackError>;

    /// `len` more bytes of queued data left the stack.
    fn on_sent(&mut self, net: &mut dyn Transport, conn: ConnId, len: usize);

    /// Bytes arrived, or `None` when the peer closed its side.
    fn on_received(&mut self, net: &mut dyn Transport, conn: ConnId, data: Option<&[u8]>);

    /// The idle cadence for `conn` elapsed.
    fn on_idle(&mut self, net: &mut dyn Transport, conn: ConnId);

    /// `conn` failed. The stack has already released it.
    fn on_error(&mut self, conn: ConnId, err: StackError);
}
