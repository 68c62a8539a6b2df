//! echo-integrity: a TCP echo data-integrity test server
//!
//! Listens for a single client, streams random payloads to it, and checks
//! that every byte comes back unchanged.
//!
//! Features:
//! - Callback-driven network stack over mio
//! - Bounded link association before the server starts
//! - Configuration via CLI arguments or TOML file

mod config;
mod link;
mod runtime;
mod server;
mod session;

use config::Config;
use link::{Association, HostLink};
use runtime::MioStack;
use server::TestServer;
use std::time::Instant;
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        iterations = config.iterations,
        payload_bytes = session::BUF_SIZE,
        seed = ?config.seed,
        tick_ms = config.tick_ms,
        "Starting echo-integrity server"
    );

    let mut host_link = HostLink::new(config.listen);
    let association =
        link::associate(&mut host_link, config.link_retries, config.link_timeout());
    if association != Association::Connected {
        error!(?association, "Link association failed");
        std::process::exit(1);
    }

    let status = run(&config)?;
    if status != 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Drive the server until the session completes and return its status.
fn run(config: &Config) -> Result<i32, Box<dyn std::error::Error>> {
    let stack = MioStack::new(config.stack_options())?;
    let mut server = TestServer::new(stack, config.listen, config.session_options());
    server.start()?;

    if let Some(addr) = server.local_addr() {
        info!(%addr, "Waiting for client");
    }

    let period = config.loop_period();
    let mut heartbeat = Instant::now();
    // The server releases its endpoint once the session has a result.
    while server.is_running() {
        let deadline = heartbeat + period;
        loop {
            let now = Instant::now();
            if now >= deadline || !server.is_running() {
                break;
            }
            server.poll(Some(deadline - now))?;
        }
        heartbeat = Instant::now();
        trace!(rounds = server.round_count(), "Driver heartbeat");
    }

    let status = server.last_status();
    match server.result() {
        Some(Ok(())) => info!(rounds = server.round_count(), "Exiting with success"),
        Some(Err(e)) => error!(status, error = %e, "Exiting with failure"),
        None => warn!("Server stopped without a result"),
    }
    server.stop();
    Ok(status)
}
