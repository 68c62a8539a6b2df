//! Echo test server: listener lifecycle around one test session.
//!
//! Binds and listens on the configured address, hands accepted
//! connections to the session, and releases the endpoint once the
//! session reaches a result or the server is stopped.

use crate::runtime::{EndpointId, NetStack, StackError};
use crate::session::{EchoSession, Phase, SessionOptions, TestError};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Single-client design: one pending connection at most.
const LISTEN_BACKLOG: u32 = 1;

/// Server lifecycle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerError {
    AlreadyRunning,
    Bind(StackError),
    Listen(StackError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::AlreadyRunning => write!(f, "server already started"),
            ServerError::Bind(e) => write!(f, "failed to bind: {e}"),
            ServerError::Listen(e) => write!(f, "failed to listen: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Server instance
pub struct TestServer<S: NetStack> {
    stack: S,
    addr: SocketAddr,
    endpoint: Option<EndpointId>,
    session: EchoSession,
}

impl<S: NetStack> TestServer<S> {
    pub fn new(stack: S, addr: SocketAddr, options: SessionOptions) -> Self {
        Self {
            stack,
            addr,
            endpoint: None,
            session: EchoSession::new(options),
        }
    }

    /// Bind, listen, and start accepting a client.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.endpoint.is_some() {
            warn!("Server already started");
            return Err(ServerError::AlreadyRunning);
        }
        if self.session.phase() != Phase::AwaitingClient {
            self.session.reset();
        }

        info!(addr = %self.addr, "Starting server");
        let endpoint = self.stack.bind(self.addr).map_err(|e| {
            warn!(addr = %self.addr, error = %e, "Failed to bind");
            ServerError::Bind(e)
        })?;

        if let Err(e) = self.stack.listen(endpoint, LISTEN_BACKLOG) {
            warn!(error = %e, "Failed to listen");
            self.stack.close_endpoint(endpoint);
            return Err(ServerError::Listen(e));
        }

        self.stack.set_accept(endpoint, true);
        self.endpoint = Some(endpoint);
        if let Some(local) = self.stack.local_addr(endpoint) {
            info!(address = %local, "Server listening");
        }
        Ok(())
    }

    /// Close the client (if any) and release the endpoint. Safe to repeat.
    pub fn stop(&mut self) {
        if let Some(conn) = self.session.connection() {
            debug!(%conn, "Cancelling active session");
        }
        if let Some(teardown) = self.session.cancel(&mut self.stack) {
            debug!(?teardown, "Client connection released");
        }
        if let Some(endpoint) = self.endpoint.take() {
            self.stack.set_accept(endpoint, false);
            self.stack.close_endpoint(endpoint);
            info!("Server stopped");
        }
    }

    /// Drive the stack once. Releases the endpoint after the session concludes.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stack.poll(&mut self.session, timeout)?;
        if self.session.is_complete() && self.endpoint.is_some() {
            self.stop();
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.session.is_complete()
    }

    /// 0 on pass, nonzero failure code otherwise. Meaningful once complete.
    pub fn last_status(&self) -> i32 {
        self.session.status()
    }

    pub fn result(&self) -> Option<Result<(), TestError>> {
        self.session.result()
    }

    pub fn round_count(&self) -> u32 {
        self.session.round_count()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.and_then(|endpoint| self.stack.local_addr(endpoint))
    }

    /// Get a mutable reference to the stack for testing
    #[cfg(test)]
    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }
}

impl<S: NetStack> Drop for TestServer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{FakeEvent, FakeStack};
    use crate::runtime::{MioStack, StackOptions};
    use crate::session::{BUF_SIZE, TEST_ITERATIONS};
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread;
    use std::time::Instant;

    fn options() -> SessionOptions {
        SessionOptions {
            seed: Some(4242),
            ..Default::default()
        }
    }

    fn fake_server() -> TestServer<FakeStack> {
        let addr = "127.0.0.1:4242".parse().unwrap();
        TestServer::new(FakeStack::new(), addr, options())
    }

    fn poll(server: &mut TestServer<FakeStack>) {
        server.poll(Some(Duration::ZERO)).unwrap();
    }

    #[test]
    fn test_start_twice() {
        let mut server = fake_server();
        server.start().unwrap();
        assert!(server.is_running());
        assert_eq!(server.start(), Err(ServerError::AlreadyRunning));
    }

    #[test]
    fn test_bind_failure() {
        let mut server = fake_server();
        server.stack_mut().bind_error = Some(StackError::AddrInUse);

        assert_eq!(server.start(), Err(ServerError::Bind(StackError::AddrInUse)));
        assert!(!server.is_running());
    }

    #[test]
    fn test_listen_failure_releases_endpoint() {
        let mut server = fake_server();
        server.stack_mut().listen_error = Some(StackError::OutOfMemory);

        assert_eq!(
            server.start(),
            Err(ServerError::Listen(StackError::OutOfMemory))
        );
        assert!(!server.is_running());
        assert_eq!(server.stack_mut().closed_endpoints.len(), 1);
        assert!(server.stack_mut().endpoint.is_none());
    }

    #[test]
    fn test_full_session_through_stack() {
        let mut server = fake_server();
        server.start().unwrap();

        let conn = server.stack_mut().connect();
        poll(&mut server);
        assert_eq!(server.stack_mut().writes.len(), 1);

        for _ in 0..TEST_ITERATIONS {
            server.stack_mut().echo_last_write();
            poll(&mut server);
        }

        assert!(server.is_complete());
        assert_eq!(server.last_status(), 0);
        assert_eq!(server.round_count(), TEST_ITERATIONS);
        assert_eq!(server.stack_mut().writes.len(), TEST_ITERATIONS as usize);
        assert_eq!(server.stack_mut().closed, vec![conn]);
        assert!(!server.is_running());
    }

    #[test]
    fn test_mismatched_echo_through_stack() {
        let mut server = fake_server();
        server.start().unwrap();
        server.stack_mut().connect();
        poll(&mut server);

        let mut echo = server.stack_mut().last_write().unwrap().to_vec();
        echo[0] ^= 0xff;
        server.stack_mut().reply_to_last_write(echo);
        poll(&mut server);

        assert!(server.is_complete());
        assert_ne!(server.last_status(), 0);
        assert_eq!(server.round_count(), 0);
        assert_eq!(server.stack_mut().writes.len(), 1);
    }

    #[test]
    fn test_peer_closes_before_exchange() {
        let mut server = fake_server();
        server.start().unwrap();
        let conn = server.stack_mut().connect();
        server.stack_mut().push(FakeEvent::Received(conn, None));
        poll(&mut server);

        assert_eq!(server.result(), Some(Err(TestError::PeerClosed)));
        assert_eq!(server.last_status(), TestError::PeerClosed.code());
    }

    #[test]
    fn test_idle_timeout_through_stack() {
        let mut server = fake_server();
        server.start().unwrap();
        let conn = server.stack_mut().connect();
        poll(&mut server);

        server.stack_mut().push(FakeEvent::Sent(conn, BUF_SIZE));
        server.stack_mut().push(FakeEvent::Idle(conn));
        poll(&mut server);
        assert!(!server.is_complete());

        server.stack_mut().push(FakeEvent::Idle(conn));
        poll(&mut server);
        assert_eq!(server.result(), Some(Err(TestError::Timeout)));
    }

    #[test]
    fn test_transport_error_through_stack() {
        let mut server = fake_server();
        server.start().unwrap();
        let conn = server.stack_mut().connect();
        poll(&mut server);

        server
            .stack_mut()
            .push(FakeEvent::Error(conn, StackError::Reset));
        poll(&mut server);

        assert_eq!(server.last_status(), StackError::Reset.code());
        assert!(server.stack_mut().closed.is_empty());
    }

    #[test]
    fn test_peer_abort_concludes_and_stops() {
        let mut server = fake_server();
        server.start().unwrap();
        let conn = server.stack_mut().connect();
        poll(&mut server);

        server
            .stack_mut()
            .push(FakeEvent::Error(conn, StackError::Aborted));
        poll(&mut server);

        assert!(server.is_complete());
        assert_eq!(
            server.result(),
            Some(Err(TestError::Transport(StackError::Aborted)))
        );
        assert_eq!(server.last_status(), StackError::Aborted.code());
        assert!(!server.is_running());

        // Endpoint is gone, so a late client is never handed to the session.
        server.stack_mut().connect();
        poll(&mut server);
        assert!(server.stack_mut().aborted.is_empty());
        assert_eq!(server.stack_mut().writes.len(), 1);
    }

    #[test]
    fn test_accept_error_through_stack() {
        let mut server = fake_server();
        server.start().unwrap();
        server
            .stack_mut()
            .push(FakeEvent::Accept(Err(StackError::OutOfMemory)));
        poll(&mut server);

        assert_eq!(
            server.result(),
            Some(Err(TestError::Accept(StackError::OutOfMemory)))
        );
        assert!(!server.is_running());
    }

    #[test]
    fn test_second_client_aborted() {
        let mut server = fake_server();
        server.start().unwrap();
        server.stack_mut().connect();
        let second = server.stack_mut().connect();
        poll(&mut server);

        assert_eq!(server.stack_mut().aborted, vec![second]);
        assert!(!server.is_complete());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut server = fake_server();
        server.stop();

        server.start().unwrap();
        let conn = server.stack_mut().connect();
        poll(&mut server);

        server.stop();
        assert_eq!(server.result(), Some(Err(TestError::Cancelled)));
        assert_eq!(server.stack_mut().closed, vec![conn]);
        assert_eq!(server.stack_mut().closed_endpoints.len(), 1);

        server.stop();
        assert_eq!(server.stack_mut().closed, vec![conn]);
        assert_eq!(server.stack_mut().closed_endpoints.len(), 1);
        assert!(!server.is_running());
    }

    #[test]
    fn test_stop_without_client_leaves_session_pending() {
        let mut server = fake_server();
        server.start().unwrap();
        server.stop();

        assert!(!server.is_complete());
        assert!(!server.stack_mut().accepting);
    }

    #[test]
    fn test_restart_after_completion() {
        let mut server = fake_server();
        server.start().unwrap();
        let conn = server.stack_mut().connect();
        server.stack_mut().push(FakeEvent::Received(conn, None));
        poll(&mut server);
        assert!(server.is_complete());
        assert!(!server.is_running());

        server.start().unwrap();
        assert!(!server.is_complete());
        assert_eq!(server.round_count(), 0);
    }

    // Loopback sessions against a real socket stack.

    fn loopback_server(options: StackOptions, session: SessionOptions) -> TestServer<MioStack> {
        let stack = MioStack::new(options).unwrap();
        let mut server = TestServer::new(stack, "127.0.0.1:0".parse().unwrap(), session);
        server.start().unwrap();
        server
    }

    fn drive(server: &mut TestServer<MioStack>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !server.is_complete() {
            assert!(Instant::now() < deadline, "session did not finish");
            server.poll(Some(Duration::from_millis(10))).unwrap();
        }
    }

    /// Echo `rounds` payloads, flipping a byte in round `corrupt`.
    fn echo_client(
        addr: SocketAddr,
        rounds: u32,
        corrupt: Option<u32>,
    ) -> thread::JoinHandle<io::Result<()>> {
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr)?;
            stream.set_read_timeout(Some(Duration::from_secs(10)))?;
            let mut buf = [0u8; BUF_SIZE];
            for round in 0..rounds {
                stream.read_exact(&mut buf)?;
                if corrupt == Some(round) {
                    buf[BUF_SIZE / 2] ^= 0x5a;
                }
                stream.write_all(&buf)?;
            }
            Ok(())
        })
    }

    #[test]
    fn test_loopback_echo_passes() {
        let mut server = loopback_server(StackOptions::default(), options());
        let addr = server.local_addr().unwrap();

        let client = echo_client(addr, TEST_ITERATIONS, None);
        drive(&mut server);

        assert_eq!(server.last_status(), 0);
        assert_eq!(server.round_count(), TEST_ITERATIONS);
        assert!(!server.is_running());
        client.join().unwrap().unwrap();
    }

    #[test]
    fn test_loopback_corrupted_echo_fails() {
        let mut server = loopback_server(StackOptions::default(), options());
        let addr = server.local_addr().unwrap();

        let client = echo_client(addr, 3, Some(2));
        drive(&mut server);

        assert_eq!(
            server.result(),
            Some(Err(TestError::Mismatch {
                round: 2,
                offset: BUF_SIZE / 2
            }))
        );
        assert_eq!(server.round_count(), 2);
        let _ = client.join();
    }

    #[test]
    fn test_loopback_peer_half_close() {
        let mut server = loopback_server(StackOptions::default(), options());
        let addr = server.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        drive(&mut server);

        assert_eq!(server.result(), Some(Err(TestError::PeerClosed)));
        drop(client);
    }

    #[test]
    fn test_loopback_silent_client_times_out() {
        let stack_options = StackOptions {
            tick: Duration::from_millis(2),
            ..Default::default()
        };
        let mut server = loopback_server(stack_options, options());
        let addr = server.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        drive(&mut server);

        assert_eq!(server.result(), Some(Err(TestError::Timeout)));
        assert_eq!(server.round_count(), 0);
        drop(client);
    }
}
