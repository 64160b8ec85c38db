//! # Termination Signal
//!
//! Single-fire signal shared by every worker of a session. The first `fire()`
//! wins; later calls are no-ops and return `false`. The coordinator is the only
//! party that acts on it.

use crate::error::SessionError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The transcoder closed its output (normal end of stream)
    Completed,
    /// The client closed the connection or it went away
    ClientClosed,
    /// Cumulative payload exceeded the configured ceiling
    ByteLimit,
    /// A worker or the read loop hit an error
    Failed(SessionError),
}

impl Termination {
    pub fn error(&self) -> Option<&SessionError> {
        match self {
            Termination::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Completed => write!(f, "completed"),
            Termination::ClientClosed => write!(f, "client closed"),
            Termination::ByteLimit => write!(f, "byte limit reached"),
            Termination::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

#[derive(Clone)]
pub struct TerminationSignal {
    tx: Arc<watch::Sender<Option<Termination>>>,
}

impl TerminationSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record `reason` if nothing was recorded yet. Returns whether this call won.
    pub fn fire(&self, reason: Termination) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }

    /// Shorthand for `fire(Termination::Failed(err))`.
    pub fn fail(&self, err: SessionError) -> bool {
        self.fire(Termination::Failed(err))
    }

    pub fn get(&self) -> Option<Termination> {
        self.tx.borrow().clone()
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the signal fires and return the winning reason.
    pub async fn fired(&self) -> Termination {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            // The sender lives in `self`, so `changed()` cannot report a closed channel
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}
