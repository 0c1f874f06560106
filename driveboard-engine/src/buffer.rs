//! Firmware receive-buffer credit tracking (spec.md §4.3).
//!
//! The firmware's UART receive buffer is `FIRMBUF_CAPACITY` bytes deep.
//! Every byte we send against it consumes one credit; the firmware
//! acknowledges consumption in `CHUNK`-sized bursts via
//! `CMD_CHUNK_PROCESSED`. We must never let outstanding (sent, not yet
//! acknowledged) bytes exceed capacity.

use std::collections::VecDeque;

pub const FIRMBUF_CAPACITY: usize = 254;
pub const CHUNK: usize = 16;

/// Tracks firmware buffer credits and the host-side queue of bytes still
/// waiting for a credit to free up.
#[derive(Debug)]
pub struct BufferTracker {
    used: usize,
    queue: VecDeque<u8>,
}

impl Default for BufferTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferTracker {
    pub fn new() -> Self {
        BufferTracker { used: 0, queue: VecDeque::new() }
    }

    /// Bytes the firmware has acknowledged consuming but not yet
    /// re-credited (i.e. outstanding on the wire).
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        FIRMBUF_CAPACITY.saturating_sub(self.used)
    }

    /// True once the firmware has reported progress and the host has
    /// nothing left queued behind the credit wall.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Queue bytes destined for the firmware. Does not itself claim
    /// credits; call [`BufferTracker::drain`] to move queued bytes onto
    /// the wire as credits allow.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.queue.extend(bytes.iter().copied());
    }

    /// Firmware reported `CMD_CHUNK_PROCESSED`: it freed one chunk's worth
    /// of receive buffer. If fewer than `CHUNK` bytes were ever credited
    /// to it, the firmware is acknowledging more than it was given — a
    /// protocol invariant violation (spec.md §4.3, §7.4) logged here
    /// rather than silently clamped to zero.
    pub fn on_chunk_processed(&mut self) {
        if self.used < CHUNK {
            tracing::error!(used = self.used, chunk = CHUNK, "chunk-processed acknowledgment exceeds outstanding credit");
        }
        self.used = self.used.saturating_sub(CHUNK);
    }

    /// Move as many queued bytes as current credit allows onto the wire,
    /// returning the bytes to actually transmit and accounting them as
    /// used. Called after every credit-changing event, matching the
    /// original's `_send_fwbuf` drain-on-every-event discipline.
    pub fn drain(&mut self) -> Vec<u8> {
        let available = self.available();
        if available == 0 || self.queue.is_empty() {
            return Vec::new();
        }
        let take = available.min(self.queue.len());
        let out: Vec<u8> = self.queue.drain(..take).collect();
        self.used += out.len();
        out
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.queue.clear();
    }

    /// Entering `Stopped`: the firmware discards whatever it has not yet
    /// consumed, so the host-side queue behind the credit wall is now
    /// stale and must be dropped too. Outstanding in-flight credit
    /// (`used`) is left alone; it still clears on the firmware's own
    /// acknowledgment cadence.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    #[cfg(test)]
    pub(crate) fn used_for_test_only_set(&mut self, used: usize) {
        self.used = used;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_only_up_to_available_credit() {
        let mut t = BufferTracker::new();
        t.used = FIRMBUF_CAPACITY - 4;
        t.enqueue(&[1, 2, 3, 4, 5, 6]);
        let out = t.drain();
        assert_eq!(out.len(), 4);
        assert_eq!(t.queued_len(), 2);
        assert_eq!(t.used(), FIRMBUF_CAPACITY);
    }

    #[test]
    fn chunk_processed_frees_credit_in_chunk_units() {
        let mut t = BufferTracker::new();
        t.used = 100;
        t.on_chunk_processed();
        assert_eq!(t.used(), 100 - CHUNK);
    }

    #[test]
    fn drained_means_queue_empty_even_if_credits_outstanding() {
        let mut t = BufferTracker::new();
        t.used = 10;
        assert!(t.is_drained());
        t.enqueue(&[1]);
        assert!(!t.is_drained());
    }

    #[test]
    fn chunk_processed_with_insufficient_credit_clamps_to_zero_instead_of_panicking() {
        let mut t = BufferTracker::new();
        t.used = CHUNK - 1;
        t.on_chunk_processed();
        assert_eq!(t.used(), 0, "an over-acknowledgment must clamp, not underflow");
    }
}
