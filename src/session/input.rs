//! # Input Forwarder
//!
//! Drains the input queue into the transcoder's input sink, one sequential
//! write per chunk, in arrival order. When the queue is closed and empty the
//! sink is shut down, which the transcoder sees as end-of-input.

use crate::error::SessionError;
use crate::session::queue::QueueReceiver;
use crate::session::signal::TerminationSignal;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub struct InputForwarder<W> {
    rx: QueueReceiver,
    sink: W,
    signal: TerminationSignal,
    forwarded: Arc<AtomicU64>,
}

impl<W> InputForwarder<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// `forwarded` is bumped after every successful write, so the count stays
    /// readable even if the task is aborted.
    pub fn new(
        rx: QueueReceiver,
        sink: W,
        signal: TerminationSignal,
        forwarded: Arc<AtomicU64>,
    ) -> Self {
        Self {
            rx,
            sink,
            signal,
            forwarded,
        }
    }

    pub async fn run(mut self) {
        while let Some(chunk) = self.rx.recv().await {
            if let Err(err) = self.sink.write_all(&chunk).await {
                warn!(error = %err, chunk_bytes = chunk.len(), "Write to transcoder input failed");
                self.signal.fail(SessionError::InputPipe(err.to_string()));
                return;
            }
            self.forwarded.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }

        // Queue closed and drained
        match self.sink.shutdown().await {
            Ok(()) => debug!(
                bytes = self.forwarded.load(Ordering::Relaxed),
                "Transcoder input closed"
            ),
            Err(err) => debug!(error = %err, "Closing transcoder input failed"),
        }
    }
}
