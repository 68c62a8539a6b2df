//! Send/receive payload buffers.
//!
//! Two fixed-capacity arrays with explicit length counters. Nothing here
//! grows: a round is exactly `BUF_SIZE` bytes out and `BUF_SIZE` bytes back.

use rand::RngCore;

/// Bytes per round trip.
pub const BUF_SIZE: usize = 2048;

/// Outcome of appending received bytes to the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// More bytes are expected this round.
    Partial,
    /// The receive buffer now holds exactly `BUF_SIZE` bytes.
    Full,
    /// The peer sent more than `BUF_SIZE` bytes this round.
    Overrun,
}

pub struct PayloadBuffers {
    send: [u8; BUF_SIZE],
    recv: [u8; BUF_SIZE],
    sent_len: usize,
    recv_len: usize,
}

impl PayloadBuffers {
    pub fn new() -> Self {
        Self {
            send: [0; BUF_SIZE],
            recv: [0; BUF_SIZE],
            sent_len: 0,
            recv_len: 0,
        }
    }

    /// Start a round: fresh random payload, both counters back to zero.
    pub fn refill(&mut self, rng: &mut impl RngCore) {
        rng.fill_bytes(&mut self.send);
        self.sent_len = 0;
        self.recv_len = 0;
    }

    pub fn payload(&self) -> &[u8] {
        &self.send
    }

    pub fn sent_len(&self) -> usize {
        self.sent_len
    }

    pub fn recv_len(&self) -> usize {
        self.recv_len
    }

    /// Count `len` acknowledged bytes. Returns true once the whole payload is out.
    pub fn record_sent(&mut self, len: usize) -> bool {
        self.sent_len = (self.sent_len + len).min(BUF_SIZE);
        self.sent_len == BUF_SIZE
    }

    pub fn all_sent(&self) -> bool {
        self.sent_len == BUF_SIZE
    }

    /// Copy incoming bytes up to the remaining capacity.
    pub fn append_received(&mut self, data: &[u8]) -> Fill {
        let room = BUF_SIZE - self.recv_len;
        let take = data.len().min(room);
        self.recv[self.recv_len..self.recv_len + take].copy_from_slice(&data[..take]);
        self.recv_len += take;

        if data.len() > room {
            Fill::Overrun
        } else if self.recv_len == BUF_SIZE {
            Fill::Full
        } else {
            Fill::Partial
        }
    }

    /// Offset of the first byte where the echo differs from the payload.
    pub fn first_mismatch(&self) -> Option<usize> {
        if self.send == self.recv {
            return None;
        }
        self.send.iter().zip(self.recv.iter()).position(|(a, b)| a != b)
    }
}

impl Default for PayloadBuffers {
    fn default() -> Self {
        Self::new()
    }
}
