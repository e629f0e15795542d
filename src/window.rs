//! Fixed-resolution sliding counter over recent admissions attempts.

use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Number of buckets the window is divided into.
const SLOTS: usize = 10;

/// Count of events observed over a sliding duration, at `SLOTS` bucket
/// resolution.
///
/// `count()` is monotone within a single bucket and non-increasing across
/// passive time. Not thread-safe on its own; the owning cache's mutex
/// protects it.
#[derive(Debug)]
pub struct RollingWindow {
    slots: [u64; SLOTS],
    total: u64,
    tail: usize,
    last_roll: u64,
    slot_width: u64,
    clock: Arc<dyn Clock>,
}

impl RollingWindow {
    /// Create a window spanning `duration`, reading time from `clock`.
    pub fn new(duration: Duration, clock: Arc<dyn Clock>) -> Self {
        let duration = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self {
            slots: [0; SLOTS],
            total: 0,
            tail: 0,
            last_roll: clock.now_millis(),
            slot_width: (duration / SLOTS as u64).max(1),
            clock,
        }
    }

    /// Record one event in the current bucket.
    pub fn inc(&mut self) {
        self.roll();
        self.slots[self.tail] += 1;
        self.total += 1;
    }

    /// Events observed within the window ending now.
    pub fn count(&mut self) -> u64 {
        self.roll();
        self.total
    }

    fn clear(&mut self) {
        self.last_roll = self.clock.now_millis();
        self.slots = [0; SLOTS];
        self.tail = 0;
        self.total = 0;
    }

    /// Advance buckets up to the current time, retiring whole bucket-widths
    /// of history. Elapsed time beyond the full window wipes everything in
    /// one step.
    fn roll(&mut self) {
        let elapsed = self.clock.now_millis().saturating_sub(self.last_roll);
        let steps = elapsed / self.slot_width;

        if steps >= SLOTS as u64 {
            self.clear();
            return;
        }

        for _ in 0..steps {
            self.tail = (self.tail + 1) % SLOTS;
            self.total -= self.slots[self.tail];
            self.slots[self.tail] = 0;
            self.last_roll += self.slot_width;
        }
    }
}
