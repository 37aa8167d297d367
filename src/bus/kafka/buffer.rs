//! Producer-side batching.

use std::time::Duration;

use tokio::time::Instant;

use super::transport::ProducerRecord;

/// Multiple of the flush threshold at which publishing is refused.
pub const HARD_LIMIT_FACTOR: usize = 10;

/// Records awaiting a flush.
///
/// Flush is due when the buffer reaches `max_size` records or the oldest
/// record has waited `linger`. Records leave only after a successful send.
#[derive(Debug)]
pub struct ProducerBuffer {
    records: Vec<ProducerRecord>,
    max_size: usize,
    linger: Duration,
    first_enqueued_at: Option<Instant>,
}

impl ProducerBuffer {
    pub fn new(max_size: usize, linger: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            records: Vec::with_capacity(max_size),
            max_size,
            linger,
            first_enqueued_at: None,
        }
    }

    pub fn push(&mut self, record: ProducerRecord) {
        if self.records.is_empty() {
            self.first_enqueued_at = Some(Instant::now());
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_size
    }

    /// Records beyond which publishing must fail instead of buffering.
    pub fn hard_limit(&self) -> usize {
        self.max_size.saturating_mul(HARD_LIMIT_FACTOR)
    }

    pub fn at_hard_limit(&self) -> bool {
        self.records.len() >= self.hard_limit()
    }

    /// When the oldest record's linger expires.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_enqueued_at.map(|at| at + self.linger)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if self.is_empty() {
            return false;
        }
        self.is_full() || self.deadline().is_some_and(|deadline| deadline <= now)
    }

    pub fn records(&self) -> &[ProducerRecord] {
        &self.records
    }

    /// Discard records after they were acknowledged.
    pub fn clear(&mut self) {
        self.records.clear();
        self.first_enqueued_at = None;
    }
}
