use super::clock::Clock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Soft reservations on pieces whose blocks were recently handed out.
///
/// A lock only steers block selection away from a piece for `timeout`; once
/// it expires the piece can be handed out again, so a stalled peer never
/// pins a piece forever.
#[derive(Debug)]
pub struct PieceLocks {
    stamps: Mutex<HashMap<u32, Instant>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl PieceLocks {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            stamps: Mutex::new(HashMap::new()),
            timeout,
            clock,
        }
    }

    /// True if `piece` was stamped less than `timeout` ago.
    pub fn is_locked(&self, piece: u32) -> bool {
        let now = self.clock.now();
        self.stamps
            .lock()
            .get(&piece)
            .is_some_and(|&stamp| now.duration_since(stamp) < self.timeout)
    }

    /// Stamps `piece` with the current time.
    pub fn stamp(&self, piece: u32) {
        let now = self.clock.now();
        self.stamps.lock().insert(piece, now);
    }

    /// Drops the lock on `piece`, e.g. once it has been verified.
    pub fn release(&self, piece: u32) {
        self.stamps.lock().remove(&piece);
    }

    /// Forgets every expired stamp.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.stamps
            .lock()
            .retain(|_, stamp| now.duration_since(*stamp) < self.timeout);
    }

    pub fn len(&self) -> usize {
        self.stamps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.lock().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
