//! Session-scoped byte accounting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe monotonic counter of bytes sent and received.
#[derive(Debug, Default)]
pub struct ByteCounter {
    received: AtomicU64,
    sent: AtomicU64,
}

impl ByteCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn count_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Received bytes in KiB.
    #[must_use]
    pub fn kibibytes_received(&self) -> f64 {
        self.received() as f64 / 1024.0
    }

    /// Sent bytes in KiB.
    #[must_use]
    pub fn kibibytes_sent(&self) -> f64 {
        self.sent() as f64 / 1024.0
    }
}

impl fmt::Display for ByteCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "received: {}; sent: {}", self.received(), self.sent())
    }
}
