//! # Audio Input Module
//!
//! Handles the inbound side of a session before anything reaches the transcoder.
//!
//! ## Key Components:
//! - **Container Header**: Parses and validates the 44-byte RIFF/WAVE header
//! - **Stream Framer**: Accumulates the first messages until the header is complete,
//!   then classifies all further bytes as raw PCM payload
//!
//! ## Inbound Wire Contract:
//! The first binary message(s) carry the header; everything after it is raw PCM,
//! concatenated in arrival order. Text messages are ignored.

pub mod framer; // Header accumulation and payload classification
pub mod header; // RIFF/WAVE header parsing and validation

pub use framer::{Ingested, StreamFramer};
pub use header::ContainerHeader;
