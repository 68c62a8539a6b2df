//! Link association.
//!
//! Brings the network link up before the server starts, retrying a bounded
//! number of times. The radio (or whatever provides the link) sits behind
//! [`LinkDriver`]; the host build uses [`HostLink`].

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{info, warn};

/// Result of bringing the link up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    Connected,
    BadAuth,
    ConnectFailed,
    TimedOut,
    /// The driver could not be initialised; no attempt was made.
    InitFailed,
}

/// Outcome of a single connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptError {
    BadAuth,
    ConnectFailed,
    TimedOut,
}

impl From<AttemptError> for Association {
    fn from(e: AttemptError) -> Self {
        match e {
            AttemptError::BadAuth => Association::BadAuth,
            AttemptError::ConnectFailed => Association::ConnectFailed,
            AttemptError::TimedOut => Association::TimedOut,
        }
    }
}

pub trait LinkDriver {
    fn init(&mut self) -> Result<(), String>;

    fn connect(&mut self, timeout: Duration) -> Result<(), AttemptError>;
}

/// Try to associate up to `retries` times, returning on first success.
pub fn associate(driver: &mut dyn LinkDriver, retries: u32, timeout: Duration) -> Association {
    if let Err(e) = driver.init() {
        warn!(error = %e, "Failed to initialise link");
        return Association::InitFailed;
    }
    info!("Link initialised");

    let mut last = Association::ConnectFailed;
    for attempt in 1..=retries {
        match driver.connect(timeout) {
            Ok(()) => {
                info!(attempt, "Link connected");
                return Association::Connected;
            }
            Err(e) => {
                warn!(attempt, retries, error = ?e, "Failed to connect, retrying");
                last = e.into();
            }
        }
    }
    last
}

/// Host link: up when the listen address is assignable on this machine.
pub struct HostLink {
    addr: SocketAddr,
}

impl HostLink {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl LinkDriver for HostLink {
    fn init(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn connect(&mut self, _timeout: Duration) -> Result<(), AttemptError> {
        let ip: IpAddr = self.addr.ip();
        if ip.is_unspecified() {
            return Ok(());
        }
        UdpSocket::bind(SocketAddr::new(ip, 0))
            .map(|_| ())
            .map_err(|_| AttemptError::ConnectFailed)
    }
}
