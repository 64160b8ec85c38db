//! # Stream Validator/Framer
//!
//! Accumulates the first binary messages of a session until a full container
//! header is available, validates it once, and from then on classifies every
//! byte as raw PCM payload.
//!
//! ## States:
//! 1. **AwaitingHeader**: bytes accumulate in an internal buffer
//! 2. **Streaming**: header accepted, every chunk is payload
//! 3. **Rejected**: header failed validation, every further call returns the same error

use crate::audio::header::{ContainerHeader, HEADER_SIZE};
use crate::error::SessionError;
use bytes::{Buf, Bytes, BytesMut};

/// Outcome of one `ingest` call.
#[derive(Debug, PartialEq)]
pub enum Ingested {
    /// Not enough bytes for a header yet; nothing to forward.
    Pending,

    /// The header was validated by this call. Emitted exactly once.
    /// `payload` holds whatever followed the header in the buffer (may be empty).
    Header {
        header: ContainerHeader,
        payload: Bytes,
    },

    /// Raw payload after the header.
    Payload(Bytes),
}

#[derive(Debug)]
enum FramerState {
    AwaitingHeader(BytesMut),
    Streaming,
    Rejected(SessionError),
}

#[derive(Debug)]
pub struct StreamFramer {
    state: FramerState,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            state: FramerState::AwaitingHeader(BytesMut::with_capacity(HEADER_SIZE)),
        }
    }

    pub fn is_validated(&self) -> bool {
        matches!(self.state, FramerState::Streaming)
    }

    /// Feed one binary message into the framer.
    ///
    /// ## Returns:
    /// - **Ok(Pending)**: still waiting for `HEADER_SIZE` bytes
    /// - **Ok(Header)**: header parsed and accepted, plus leftover payload
    /// - **Ok(Payload)**: the chunk itself, unchanged
    /// - **Err(InvalidFormat)**: header rejected; no payload is ever produced afterwards
    pub fn ingest(&mut self, chunk: Bytes) -> Result<Ingested, SessionError> {
        let buffer = match &mut self.state {
            FramerState::Streaming => return Ok(Ingested::Payload(chunk)),
            FramerState::Rejected(err) => return Err(err.clone()),
            FramerState::AwaitingHeader(buffer) => buffer,
        };

        buffer.extend_from_slice(&chunk);
        if buffer.len() < HEADER_SIZE {
            return Ok(Ingested::Pending);
        }

        match ContainerHeader::parse(&buffer[..HEADER_SIZE]) {
            Ok(header) => {
                buffer.advance(HEADER_SIZE);
                let payload = buffer.split().freeze();
                self.state = FramerState::Streaming;
                Ok(Ingested::Header { header, payload })
            }
            Err(err) => {
                self.state = FramerState::Rejected(err.clone());
                Err(err)
            }
        }
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes() -> Vec<u8> {
        ContainerHeader::encode(2, 44100, 16, 0)
    }

    #[test]
    fn test_header_split_across_messages() {
        let bytes = header_bytes();
        let mut framer = StreamFramer::new();

        assert_eq!(
            framer.ingest(Bytes::copy_from_slice(&bytes[..10])).unwrap(),
            Ingested::Pending
        );
        assert_eq!(
            framer.ingest(Bytes::copy_from_slice(&bytes[10..43])).unwrap(),
            Ingested::Pending
        );
        assert!(!framer.is_validated());

        match framer.ingest(Bytes::copy_from_slice(&bytes[43..])).unwrap() {
            Ingested::Header { header, payload } => {
                assert_eq!(header.sample_rate, 44100);
                assert!(payload.is_empty());
            }
            other => panic!("expected header, got {:?}", other),
        }
        assert!(framer.is_validated());
    }

    #[test]
    fn test_exactly_header_size_consumed_before_payload() {
        let mut message = header_bytes();
        message.extend_from_slice(&[7u8; 100]);

        let mut framer = StreamFramer::new();
        match framer.ingest(Bytes::from(message)).unwrap() {
            Ingested::Header { payload, .. } => {
                assert_eq!(payload.len(), 100);
                assert!(payload.iter().all(|&b| b == 7));
            }
            other => panic!("expected header, got {:?}", other),
        }

        let next = Bytes::from_static(b"pcm");
        assert_eq!(
            framer.ingest(next.clone()).unwrap(),
            Ingested::Payload(next)
        );
    }

    #[test]
    fn test_header_emitted_once() {
        let mut framer = StreamFramer::new();
        let first = framer.ingest(Bytes::from(header_bytes())).unwrap();
        assert!(matches!(first, Ingested::Header { .. }));

        // A second header-looking message is plain payload now
        let second = framer.ingest(Bytes::from(header_bytes())).unwrap();
        assert!(matches!(second, Ingested::Payload(ref p) if p.len() == HEADER_SIZE));
    }

    #[test]
    fn test_rejected_header_never_yields_payload() {
        let mut bytes = header_bytes();
        bytes[8..12].copy_from_slice(b"WAVX");
        bytes.extend_from_slice(&[1u8; 64]);

        let mut framer = StreamFramer::new();
        assert!(matches!(
            framer.ingest(Bytes::from(bytes)),
            Err(SessionError::InvalidFormat(_))
        ));
        assert!(matches!(
            framer.ingest(Bytes::from_static(&[0u8; 128])),
            Err(SessionError::InvalidFormat(_))
        ));
    }
}
