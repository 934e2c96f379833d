//! Per-reader cursor tracking and writer backpressure.
//!
//! A *guaranteed* reader registers a cursor here when it opens; the writer
//! treats the minimum of all registered cursors as the floor below which it
//! may not overwrite data, and blocks in `reserve` rather than lap a slow
//! guaranteed reader. Opportunistic readers never register and can be
//! lapped — [`crate::ring::Ring::acquire`] reports that as
//! [`crate::error::Kind::Overrun`] instead of silently losing data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tracks the set of guaranteed readers' absolute byte cursors for one ring.
#[derive(Default)]
pub struct GuaranteeManager {
    cursors: Vec<Arc<AtomicU64>>,
}

impl GuaranteeManager {
    pub fn new() -> Self {
        Self { cursors: Vec::new() }
    }

    /// Registers a new guaranteed reader starting at `initial` and returns
    /// the shared cursor it should update on every `release`.
    pub fn register(&mut self, initial: u64) -> Arc<AtomicU64> {
        let cursor = Arc::new(AtomicU64::new(initial));
        self.cursors.push(cursor.clone());
        cursor
    }

    /// Removes a guaranteed reader's cursor, typically called when the
    /// reader handle is dropped.
    pub fn unregister(&mut self, cursor: &Arc<AtomicU64>) {
        self.cursors.retain(|c| !Arc::ptr_eq(c, cursor));
    }

    /// The minimum cursor across all registered guaranteed readers, or
    /// `u64::MAX` if none are registered (no backpressure floor).
    pub fn min_guaranteed(&self) -> u64 {
        self.cursors.iter().map(|c| c.load(Ordering::Acquire)).min().unwrap_or(u64::MAX)
    }

    pub fn reader_count(&self) -> usize {
        self.cursors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_readers_means_no_floor() {
        let mgr = GuaranteeManager::new();
        assert_eq!(mgr.min_guaranteed(), u64::MAX);
    }

    #[test]
    fn floor_tracks_slowest_reader() {
        let mut mgr = GuaranteeManager::new();
        let a = mgr.register(10);
        let b = mgr.register(50);
        assert_eq!(mgr.min_guaranteed(), 10);
        a.store(100, Ordering::Release);
        assert_eq!(mgr.min_guaranteed(), 50);
        mgr.unregister(&b);
        assert_eq!(mgr.min_guaranteed(), 100);
    }
}
