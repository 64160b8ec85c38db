//! # Output Forwarder
//!
//! Reads the transcoder's output one buffer at a time and sends each read as a
//! single binary message, in read order. End of stream fires
//! `Termination::Completed`; a failed send fires `OutputDelivery`.
//!
//! The forwarder keeps reading after other termination reasons fire, so output
//! the transcoder flushes during shutdown still reaches the client.

use crate::error::SessionError;
use crate::session::connection::Outbound;
use crate::session::signal::{Termination, TerminationSignal};

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

pub struct OutputForwarder<R> {
    source: R,
    outbound: Arc<dyn Outbound>,
    signal: TerminationSignal,
    buffer_size: usize,
    delivered: Arc<AtomicU64>,
}

impl<R> OutputForwarder<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(
        source: R,
        outbound: Arc<dyn Outbound>,
        signal: TerminationSignal,
        buffer_size: usize,
        delivered: Arc<AtomicU64>,
    ) -> Self {
        Self {
            source,
            outbound,
            signal,
            buffer_size: buffer_size.max(1),
            delivered,
        }
    }

    pub async fn run(mut self) {
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let n = match self.source.read(&mut buffer).await {
                Ok(0) => {
                    debug!(
                        bytes = self.delivered.load(Ordering::Relaxed),
                        "Transcoder output ended"
                    );
                    self.signal.fire(Termination::Completed);
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "Reading transcoder output failed");
                    self.signal.fail(SessionError::OutputDelivery(format!(
                        "transcoder output unreadable: {}",
                        err
                    )));
                    return;
                }
            };

            let chunk = Bytes::copy_from_slice(&buffer[..n]);
            if let Err(err) = self.outbound.send_binary(chunk).await {
                // Expected once the client is gone during teardown
                debug!(error = %err, "Delivering transcoded chunk failed");
                self.signal.fail(err);
                return;
            }
            self.delivered.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}
