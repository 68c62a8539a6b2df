//! Echo integrity test session.
//!
//! - `buffer`: fixed send/receive payload buffers
//! - `state`: phase, round counter, and the once-only result
//! - `machine`: the callback-driven protocol state machine

mod buffer;
mod machine;
mod state;

pub use buffer::BUF_SIZE;
pub use machine::{EchoSession, SessionOptions, IDLE_TICKS, TEST_ITERATIONS};
pub use state::{Phase, TestError};
