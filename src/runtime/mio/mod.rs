//! mio-based network stack.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS), exposed
//! through the callback-driven [`NetStack`](crate::runtime::NetStack) interface.

mod event_loop;

pub use event_loop::{MioStack, StackOptions};
