//! Test session state.
//!
//! Holds the protocol phase, the verified round counter, and the final
//! result. The result is written exactly once; after that the session is
//! terminal until it is explicitly reset for a new run.

use crate::runtime::StackError;

/// Status reported while no result is available yet.
pub const STATUS_PENDING: i32 = -1;

/// Where the session is in the accept/send/echo cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Listening; no client yet.
    AwaitingClient,
    /// Payload written, waiting for the stack to report it sent.
    Sending,
    /// Payload fully sent, collecting the echo.
    AwaitingEcho,
    /// All rounds verified.
    Completed,
    /// Terminated by an error.
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

/// Why a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestError {
    /// The stack reported an error instead of a connection.
    Accept(StackError),
    /// Queueing the payload failed.
    Write(StackError),
    /// Echoed bytes differ from the payload.
    Mismatch { round: u32, offset: usize },
    /// The peer sent more than one payload's worth in a round.
    Overrun { round: u32 },
    /// The peer closed before the test finished.
    PeerClosed,
    /// The idle cadence elapsed with no progress.
    Timeout,
    /// Asynchronous transport failure.
    Transport(StackError),
    /// The server was stopped mid-session.
    Cancelled,
}

impl TestError {
    /// Nonzero status code for this failure.
    pub fn code(self) -> i32 {
        match self {
            TestError::Accept(e) | TestError::Write(e) | TestError::Transport(e) => e.code(),
            TestError::Mismatch { .. } => 1,
            TestError::Overrun { .. } => 2,
            TestError::PeerClosed => 3,
            TestError::Timeout => 4,
            TestError::Cancelled => 5,
        }
    }
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Accept(e) => write!(f, "accept failed: {e}"),
            TestError::Write(e) => write!(f, "failed to write payload: {e}"),
            TestError::Mismatch { round, offset } => {
                write!(f, "echo mismatch in round {round} at offset {offset}")
            }
            TestError::Overrun { round } => write!(f, "echo overran the buffer in round {round}"),
            TestError::PeerClosed => write!(f, "peer closed the connection"),
            TestError::Timeout => write!(f, "no reply before the idle timeout"),
            TestError::Transport(e) => write!(f, "transport error: {e}"),
            TestError::Cancelled => write!(f, "session cancelled"),
        }
    }
}

impl std::error::Error for TestError {}

/// The in-progress test run.
#[derive(Debug)]
pub struct TestSession {
    phase: Phase,
    round_count: u32,
    result: Option<Result<(), TestError>>,
}

impl TestSession {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingClient,
            round_count: 0,
            result: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move between non-terminal phases. Ignored once terminal.
    pub fn enter(&mut self, phase: Phase) {
        debug_assert!(!phase.is_terminal(), "use conclude() for terminal phases");
        if !self.phase.is_terminal() {
            self.phase = phase;
        }
    }

    pub fn round_count(&self) -> u32 {
        self.round_count
    }

    /// Count one verified round and return the new total.
    pub fn record_round(&mut self) -> u32 {
        self.round_count += 1;
        self.round_count
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    /// Record the final result. Returns false if one was already recorded.
    pub fn conclude(&mut self, result: Result<(), TestError>) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.phase = match result {
            Ok(()) => Phase::Completed,
            Err(_) => Phase::Failed,
        };
        self.result = Some(result);
        true
    }

    pub fn result(&self) -> Option<Result<(), TestError>> {
        self.result
    }

    /// 0 on pass, the failure code on failure, `STATUS_PENDING` before completion.
    pub fn status(&self) -> i32 {
        match self.result {
            Some(Ok(())) => 0,
            Some(Err(e)) => e.code(),
            None => STATUS_PENDING,
        }
    }
}

impl Default for TestSession {
    fn default() -> Self {
        Self::new()
    }
}
