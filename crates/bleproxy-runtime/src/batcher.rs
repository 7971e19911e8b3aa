//! Advertisement batching
//!
//! Coalesces the advertisement firehose into bounded batches so one control
//! frame carries many advertisements. A batch is released when it reaches
//! the configured size or when its eldest entry has waited out the flush
//! interval; the owner drives the timer and calls [`Batcher::flush_if_due`].

use std::time::Duration;

use tokio::time::Instant;

use bleproxy_core::types::Advertisement;

/// Single-owner advertisement batch
pub struct Batcher {
    batch: Vec<Advertisement>,
    batch_size: usize,
    flush_interval: Duration,
    eldest_arrival: Option<Instant>,
}

impl Batcher {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch: Vec::with_capacity(batch_size),
            batch_size: batch_size.max(1),
            flush_interval,
            eldest_arrival: None,
        }
    }

    /// Append one advertisement. Returns a full batch when this arrival
    /// filled it.
    pub fn add(&mut self, adv: Advertisement) -> Option<Vec<Advertisement>> {
        if self.batch.is_empty() {
            self.eldest_arrival = Some(Instant::now());
        }
        self.batch.push(adv);
        if self.batch.len() >= self.batch_size {
            Some(self.take())
        } else {
            None
        }
    }

    /// Release the batch if the eldest entry has aged past the interval
    pub fn flush_if_due(&mut self) -> Option<Vec<Advertisement>> {
        let due = self
            .eldest_arrival
            .is_some_and(|at| at.elapsed() >= self.flush_interval);
        if due {
            Some(self.take())
        } else {
            None
        }
    }

    /// Release whatever is pending regardless of age
    pub fn force_flush(&mut self) -> Option<Vec<Advertisement>> {
        if self.batch.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    /// Deadline of the pending batch, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.eldest_arrival.map(|at| at + self.flush_interval)
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    fn take(&mut self) -> Vec<Advertisement> {
        self.eldest_arrival = None;
        std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
