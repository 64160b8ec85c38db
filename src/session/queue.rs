//! # Input Queue
//!
//! Bounded FIFO of payload chunks between the read loop (single producer) and
//! the input forwarder (single consumer). Capacity is fixed at creation.
//!
//! `try_enqueue` never waits: when the queue is full the newest chunk is
//! dropped and the caller is told so. Dropping never reorders the chunks that
//! were accepted.

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Log the first drop and then every Nth.
const DROP_LOG_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// Queue full; the chunk was discarded.
    Dropped,
    /// Queue already closed or its consumer is gone; the chunk was discarded.
    Closed,
}

pub struct InputQueue {
    tx: Option<mpsc::Sender<Bytes>>,
    capacity: usize,
    dropped: u64,
}

/// Consumer half, owned by the input forwarder.
pub type QueueReceiver = mpsc::Receiver<Bytes>;

impl InputQueue {
    /// Create a queue holding at most `capacity` chunks (minimum 1).
    pub fn new(capacity: usize) -> (Self, QueueReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Some(tx),
                capacity,
                dropped: 0,
            },
            rx,
        )
    }

    pub fn try_enqueue(&mut self, chunk: Bytes) -> Enqueue {
        let Some(tx) = &self.tx else {
            return Enqueue::Closed;
        };

        match tx.try_send(chunk) {
            Ok(()) => Enqueue::Accepted,
            Err(TrySendError::Full(chunk)) => {
                self.dropped += 1;
                if self.dropped % DROP_LOG_INTERVAL == 1 {
                    debug!(
                        dropped = self.dropped,
                        chunk_bytes = chunk.len(),
                        capacity = self.capacity,
                        "Input queue full, dropping newest chunk (back-pressure)"
                    );
                }
                Enqueue::Dropped
            }
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Close the producer side. The consumer still drains what is queued,
    /// then sees end-of-queue. Idempotent.
    pub fn close(&mut self) {
        self.tx.take();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
