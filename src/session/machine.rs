//! Echo test protocol state machine.
//!
//! ```text
//! AwaitingClient --accept--> Sending --all sent--> AwaitingEcho
//!                               ^                      |
//!                               +----- echo ok --------+
//!                                                      |
//!                              echo ok, last round --> Completed
//! any non-terminal --mismatch/close/idle/error-------> Failed
//! ```
//!
//! Every transition happens inside a stack callback. Reaching a terminal
//! phase unregisters the hooks and closes the connection (abort if the
//! close is refused) before the result is recorded.

use crate::runtime::{ConnId, EndpointId, Hooks, SessionHandler, StackError, Transport};
use crate::session::buffer::{Fill, PayloadBuffers, BUF_SIZE};
use crate::session::state::{Phase, TestError, TestSession};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, trace, warn};

/// Verified rounds needed to pass.
pub const TEST_ITERATIONS: u32 = 10;

/// Nominal poll period, in stack ticks.
pub const POLL_PERIOD_TICKS: u32 = 5;

/// Idle cadence: twice the nominal poll period.
pub const IDLE_TICKS: u32 = POLL_PERIOD_TICKS * 2;

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub iterations: u32,
    pub idle_ticks: u32,
    /// Fixed payload seed; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            iterations: TEST_ITERATIONS,
            idle_ticks: IDLE_TICKS,
            seed: None,
        }
    }
}

/// How a connection was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Closed,
    /// Graceful close was refused and the connection was aborted instead.
    AbortedCleanup(StackError),
}

/// Releases `conn`: hooks first, then a graceful close, abort as last resort.
pub fn release(net: &mut dyn Transport, conn: ConnId) -> Teardown {
    net.unregister(conn);
    match net.close(conn) {
        Ok(()) => Teardown::Closed,
        Err(e) => {
            warn!(%conn, error = %e, "Close failed, aborting connection");
            net.abort(conn);
            Teardown::AbortedCleanup(e)
        }
    }
}

pub struct EchoSession {
    options: SessionOptions,
    state: TestSession,
    buffers: PayloadBuffers,
    conn: Option<ConnId>,
    /// Set by data events, cleared by each idle tick.
    activity: bool,
    rng: StdRng,
}

impl EchoSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            state: TestSession::new(),
            buffers: PayloadBuffers::new(),
            conn: None,
            activity: false,
            rng: seeded(options.seed),
        }
    }

    /// Discard the previous run. Must not be called with a live connection.
    pub fn reset(&mut self) {
        debug_assert!(self.conn.is_none(), "reset with a live connection");
        self.state = TestSession::new();
        self.buffers = PayloadBuffers::new();
        self.activity = false;
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn round_count(&self) -> u32 {
        self.state.round_count()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn result(&self) -> Option<Result<(), TestError>> {
        self.state.result()
    }

    pub fn status(&self) -> i32 {
        self.state.status()
    }

    pub fn connection(&self) -> Option<ConnId> {
        self.conn
    }

    /// End the session on explicit stop if a client is connected.
    pub fn cancel(&mut self, net: &mut dyn Transport) -> Option<Teardown> {
        if self.state.is_complete() || self.conn.is_none() {
            return None;
        }
        self.finish(net, Err(TestError::Cancelled))
    }

    fn owns(&self, conn: ConnId) -> bool {
        self.conn == Some(conn) && !self.state.is_complete()
    }

    fn send_round(&mut self, net: &mut dyn Transport, conn: ConnId) {
        self.buffers.refill(&mut self.rng);
        self.state.enter(Phase::Sending);
        debug!(
            %conn,
            round = self.state.round_count() + 1,
            bytes = BUF_SIZE,
            "Writing payload to client"
        );

        if let Err(e) = net.write(conn, self.buffers.payload()) {
            self.finish(net, Err(TestError::Write(e)));
        }
    }

    fn verify_round(&mut self, net: &mut dyn Transport, conn: ConnId) {
        if let Some(offset) = self.buffers.first_mismatch() {
            let round = self.state.round_count();
            self.finish(net, Err(TestError::Mismatch { round, offset }));
            return;
        }

        let rounds = self.state.record_round();
        debug!(%conn, round = rounds, "Echo verified");
        if rounds >= self.options.iterations {
            self.finish(net, Ok(()));
        } else {
            self.send_round(net, conn);
        }
    }

    /// Tear down the connection and record the result, once.
    fn finish(
        &mut self,
        net: &mut dyn Transport,
        result: Result<(), TestError>,
    ) -> Option<Teardown> {
        if self.state.is_complete() {
            return None;
        }
        let teardown = self.conn.take().map(|conn| release(net, conn));
        self.conclude(result);
        teardown
    }

    fn conclude(&mut self, result: Result<(), TestError>) {
        match result {
            Ok(()) => info!(rounds = self.state.round_count(), "Test passed"),
            Err(e) => warn!(
                rounds = self.state.round_count(),
                code = e.code(),
                error = %e,
                "Test failed"
            ),
        }
        let recorded = self.state.conclude(result);
        debug_assert!(recorded, "session result recorded twice");
    }
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

impl SessionHandler for EchoSession {
    fn on_accepted(
        &mut self,
        net: &mut dyn Transport,
        endpoint: EndpointId,
        accepted: Result<ConnId, StackError>,
    ) -> Result<(), StackError> {
        let conn = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%endpoint, error = %e, "Failure in accept");
                if self.state.phase() == Phase::AwaitingClient {
                    self.conclude(Err(TestError::Accept(e)));
                }
                return Err(e);
            }
        };

        if self.state.phase() != Phase::AwaitingClient || self.conn.is_some() {
            debug!(%conn, "Rejecting additional client");
            return Err(StackError::IsConnected);
        }

        info!(%conn, "Client connected");
        self.conn = Some(conn);
        self.activity = false;
        net.register(conn, Hooks::all(self.options.idle_ticks));
        self.send_round(net, conn);
        Ok(())
    }

    fn on_sent(&mut self, net: &mut dyn Transport, conn: ConnId, len: usize) {
        if !self.owns(conn) {
            return;
        }
        self.activity = true;

        if self.state.phase() != Phase::Sending {
            return;
        }
        let done = self.buffers.record_sent(len);
        trace!(%conn, len, sent_len = self.buffers.sent_len(), "Payload bytes sent");
        if done {
            self.state.enter(Phase::AwaitingEcho);
            debug!(%conn, "Waiting for echo from client");
            // A streaming echo may already have filled the receive side.
            if self.buffers.recv_len() == BUF_SIZE {
                self.verify_round(net, conn);
            }
        }
    }

    fn on_received(&mut self, net: &mut dyn Transport, conn: ConnId, data: Option<&[u8]>) {
        if !self.owns(conn) {
            return;
        }
        let Some(data) = data else {
            self.finish(net, Err(TestError::PeerClosed));
            return;
        };

        self.activity = true;
        net.acknowledge(conn, data.len());
        trace!(
            %conn,
            len = data.len(),
            recv_len = self.buffers.recv_len(),
            "Echo bytes received"
        );

        match self.buffers.append_received(data) {
            Fill::Partial => {}
            Fill::Full => {
                if self.buffers.all_sent() {
                    self.verify_round(net, conn);
                }
            }
            Fill::Overrun => {
                let round = self.state.round_count();
                self.finish(net, Err(TestError::Overrun { round }));
            }
        }
    }

    fn on_idle(&mut self, net: &mut dyn Transport, conn: ConnId) {
        if !self.owns(conn) || self.state.phase() == Phase::AwaitingClient {
            return;
        }
        if std::mem::take(&mut self.activity) {
            trace!(%conn, "Idle tick with progress");
            return;
        }
        self.finish(net, Err(TestError::Timeout));
    }

    fn on_error(&mut self, conn: ConnId, err: StackError) {
        if !self.owns(conn) {
            return;
        }
        // The stack already released the connection.
        self.conn = None;
        self.conclude(Err(TestError::Transport(err)));
    }
}
