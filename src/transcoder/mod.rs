//! # Transcoder Module
//!
//! Everything about the external transcoding process: the command line it is
//! launched with and the process handle a session owns.

pub mod command; // Command line assembly from config + header
pub mod process; // Subprocess spawn, pipes, diagnostic drain and stop

pub use process::{StopOutcome, TranscoderProcess};
