//! # Streaming Session Module
//!
//! The per-connection bridge between a client and its transcoder process.
//!
//! ## Workers (one set per session):
//! - **Read loop** (coordinator): reads client messages, feeds the framer, enqueues payload
//! - **Input forwarder**: drains the input queue into the transcoder's stdin
//! - **Output forwarder**: sends transcoder output back to the client
//! - **Diagnostic drain** (process manager): logs the transcoder's stderr
//!
//! Workers talk to each other only through the bounded input queue and the
//! single-fire termination signal. Sessions share nothing with each other.

pub mod connection; // Inbound/Outbound connection traits
pub mod coordinator; // State machine, read loop and teardown
pub mod input; // Queue -> transcoder stdin
pub mod output; // Transcoder stdout -> client
pub mod queue; // Bounded drop-newest input queue
pub mod signal; // Single-fire termination signal

pub use connection::{Frame, Outbound};
pub use coordinator::{Coordinator, SessionReport};
pub use signal::Termination;
