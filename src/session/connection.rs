//! Duplex connection abstraction the coordinator reads from and writes to.
//!
//! The websocket actor pushes inbound frames into a `ChannelInbound` and
//! implements `Outbound` over its mailbox.

use crate::error::SessionError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One inbound message, classified by type.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    /// The client closed the connection.
    Close,
}

/// Read side of the connection. Single consumer: the coordinator's read loop.
#[async_trait]
pub trait Inbound: Send {
    /// Next message, `None` once the connection is gone.
    async fn recv(&mut self) -> Option<Result<Frame, SessionError>>;

    /// Stop accepting messages. Anything the connection sends afterwards is
    /// refused at the producer instead of piling up unread.
    fn close(&mut self);
}

/// Write side of the connection, shared by the output forwarder and the coordinator.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError>;

    async fn send_text(&self, text: String) -> Result<(), SessionError>;

    /// Close the connection. Called exactly once, at the end of teardown.
    async fn close(&self);
}

pub type FrameSender = mpsc::UnboundedSender<Result<Frame, SessionError>>;

/// `Inbound` over an unbounded channel. The producer never waits, so the
/// socket actor is never held up by a busy session.
pub struct ChannelInbound {
    rx: mpsc::UnboundedReceiver<Result<Frame, SessionError>>,
}

impl ChannelInbound {
    pub fn new() -> (FrameSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl Inbound for ChannelInbound {
    async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.rx.close();
    }
}
