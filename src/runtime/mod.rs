//! Transport adapter.
//!
//! Binds protocol logic to a callback-driven network stack:
//! - `NetStack`: endpoint lifecycle plus the event pump
//! - `Transport`: connection operations usable from inside callbacks
//! - `SessionHandler`: the receiver of accept/sent/received/idle/error events
//!
//! `MioStack` is the host implementation; tests use `FakeStack`.

mod connection;
pub mod mio;
mod token;
mod transport;

pub use self::mio::{MioStack, StackOptions};
pub use token::{ConnId, EndpointId};
pub use transport::{Hooks, NetStack, SessionHandler, StackError, Transport};

#[cfg(test)]
pub(crate) mod fake;
