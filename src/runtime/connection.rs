//! Stack-side connection record.
//!
//! Tracks the registered hooks, the outbound copy buffer, the receive
//! window, and the idle tick counter for one accepted socket.

use crate::runtime::transport::{Hooks, StackError};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Write};

/// Read-side state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Reading while the receive window is open.
    Open,
    /// Window exhausted; waiting for the handler to acknowledge.
    Paused,
    /// Peer sent FIN.
    PeerClosed,
}

/// A single accepted connection owned by the stack.
#[derive(Debug)]
pub struct StackConnection {
    pub stream: TcpStream,
    pub hooks: Hooks,
    pub read_state: ReadState,
    /// Bytes queued by `write` and not yet handed to the kernel.
    outbound: BytesMut,
    send_capacity: usize,
    /// Bytes delivered to the handler and not yet acknowledged.
    unacked: usize,
    recv_window: usize,
    idle_count: u32,
}

impl StackConnection {
    pub fn new(stream: TcpStream, send_capacity: usize, recv_window: usize) -> Self {
        Self {
            stream,
            hooks: Hooks::none(),
            read_state: ReadState::Open,
            outbound: BytesMut::with_capacity(send_capacity),
            send_capacity,
            unacked: 0,
            recv_window: recv_window.max(1),
            idle_count: 0,
        }
    }

    /// Copy `data` into the outbound buffer.
    pub fn enqueue(&mut self, data: &[u8]) -> Result<(), StackError> {
        if self.outbound.len() + data.len() > self.send_capacity {
            return Err(StackError::OutOfMemory);
        }
        self.outbound.extend_from_slice(data);
        Ok(())
    }

    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.outbound
    }

    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Hand as much of the outbound buffer to the kernel as it takes in one write.
    pub fn send_pending(&mut self) -> io::Result<usize> {
        let n = self.stream.write(&self.outbound)?;
        self.outbound.advance(n);
        Ok(n)
    }

    /// Remaining receive window in bytes.
    pub fn window(&self) -> usize {
        self.recv_window.saturating_sub(self.unacked)
    }

    /// Account for `n` bytes handed to the handler.
    pub fn delivered(&mut self, n: usize) {
        self.unacked += n;
        if self.window() == 0 {
            self.read_state = ReadState::Paused;
        }
    }

    /// Handler consumed `n` bytes. Returns true if reading should resume.
    pub fn acknowledge(&mut self, n: usize) -> bool {
        self.unacked = self.unacked.saturating_sub(n);
        if self.read_state == ReadState::Paused && self.window() > 0 {
            self.read_state = ReadState::Open;
            return true;
        }
        false
    }

    /// Replace hooks, restarting the idle cadence.
    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = hooks;
        self.idle_count = 0;
    }

    /// Advance the idle counter by `ticks`. Returns true when the idle hook is due.
    pub fn tick(&mut self, ticks: u32) -> bool {
        let Some(interval) = self.hooks.idle_ticks else {
            return false;
        };
        self.idle_count += ticks;
        if self.idle_count >= interval.max(1) {
            self.idle_count = 0;
            return true;
        }
        false
    }
}
