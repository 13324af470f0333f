//! Per-bus counters. Counters only; anything fancier layers above the bus.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BusMetrics {
    pub frames_sent: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub connected_links: AtomicU64,
    pub auth_failures: AtomicU64,
    pub check_rejects: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dropped(&self, n: u64) {
        self.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    pub fn links(&self) -> u64 {
        self.connected_links.load(Ordering::Relaxed)
    }
}
