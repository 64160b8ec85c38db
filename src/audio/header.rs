//! # Container Header
//!
//! Parses the fixed-size RIFF/WAVE header that opens every session.
//!
//! ## Layout (44 bytes, little-endian):
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0  | 4 | chunk id, literal `RIFF` |
//! | 4  | 4 | chunk size (u32) |
//! | 8  | 4 | format tag, literal `WAVE` |
//! | 12 | 4 | fmt sub-chunk id |
//! | 16 | 4 | fmt sub-chunk size (u32) |
//! | 20 | 2 | audio format (u16, 1 = integer PCM, 3 = IEEE float) |
//! | 22 | 2 | channel count (u16) |
//! | 24 | 4 | sample rate (u32) |
//! | 28 | 4 | byte rate (u32) |
//! | 32 | 2 | block align (u16) |
//! | 34 | 2 | bits per sample (u16) |
//! | 36 | 4 | data sub-chunk id |
//! | 40 | 4 | data size (u32) |
//!
//! Only the chunk id and format tag are checked against literals; sub-chunk ids
//! are carried through untouched.

use crate::error::SessionError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::{Cursor, Read};

pub const HEADER_SIZE: usize = 44;

const CHUNK_ID: &[u8; 4] = b"RIFF";
const FORMAT_TAG: &[u8; 4] = b"WAVE";

const FORMAT_PCM: u16 = 1;
const FORMAT_IEEE_FLOAT: u16 = 3;

/// Parsed container header. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub chunk_id: [u8; 4],
    pub format: [u8; 4],
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

/// Raw sample layout of the payload, named the way the transcoder names
/// its raw input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16Le,
    S24Le,
    S32Le,
    F32Le,
    F64Le,
}

impl SampleFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16Le => "s16le",
            SampleFormat::S24Le => "s24le",
            SampleFormat::S32Le => "s32le",
            SampleFormat::F32Le => "f32le",
            SampleFormat::F64Le => "f64le",
        }
    }
}

impl ContainerHeader {
    /// Parse and validate a header from the first `HEADER_SIZE` bytes of `bytes`.
    ///
    /// ## Returns:
    /// - **Ok(header)**: signature, format tag and sample layout are acceptable
    /// - **Err(InvalidFormat)**: anything else, including fewer than `HEADER_SIZE` bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() < HEADER_SIZE {
            return Err(SessionError::InvalidFormat(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let header = Self::read_fields(&bytes[..HEADER_SIZE])
            .map_err(|e| SessionError::InvalidFormat(format!("unreadable header: {}", e)))?;
        header.validate()?;
        Ok(header)
    }

    fn read_fields(bytes: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(bytes);

        let mut chunk_id = [0u8; 4];
        cursor.read_exact(&mut chunk_id)?;
        // Chunk size is ignored; a live stream has no final length
        cursor.read_u32::<LittleEndian>()?;
        let mut format = [0u8; 4];
        cursor.read_exact(&mut format)?;

        // "fmt " id and sub-chunk size
        let mut skip = [0u8; 8];
        cursor.read_exact(&mut skip)?;

        let audio_format = cursor.read_u16::<LittleEndian>()?;
        let channels = cursor.read_u16::<LittleEndian>()?;
        let sample_rate = cursor.read_u32::<LittleEndian>()?;
        let byte_rate = cursor.read_u32::<LittleEndian>()?;
        let block_align = cursor.read_u16::<LittleEndian>()?;
        let bits_per_sample = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            chunk_id,
            format,
            audio_format,
            channels,
            sample_rate,
            byte_rate,
            block_align,
            bits_per_sample,
        })
    }

    fn validate(&self) -> Result<(), SessionError> {
        if &self.chunk_id != CHUNK_ID {
            return Err(SessionError::InvalidFormat(format!(
                "expected chunk id RIFF, got {:?}",
                String::from_utf8_lossy(&self.chunk_id)
            )));
        }

        if &self.format != FORMAT_TAG {
            return Err(SessionError::InvalidFormat(format!(
                "expected format WAVE, got {:?}",
                String::from_utf8_lossy(&self.format)
            )));
        }

        if self.channels == 0 {
            return Err(SessionError::InvalidFormat("channel count is 0".to_string()));
        }

        if self.sample_rate == 0 {
            return Err(SessionError::InvalidFormat("sample rate is 0".to_string()));
        }

        self.sample_format()?;
        Ok(())
    }

    /// Map `(audio_format, bits_per_sample)` to the raw payload layout.
    pub fn sample_format(&self) -> Result<SampleFormat, SessionError> {
        match (self.audio_format, self.bits_per_sample) {
            (FORMAT_PCM, 8) => Ok(SampleFormat::U8),
            (FORMAT_PCM, 16) => Ok(SampleFormat::S16Le),
            (FORMAT_PCM, 24) => Ok(SampleFormat::S24Le),
            (FORMAT_PCM, 32) => Ok(SampleFormat::S32Le),
            (FORMAT_IEEE_FLOAT, 32) => Ok(SampleFormat::F32Le),
            (FORMAT_IEEE_FLOAT, 64) => Ok(SampleFormat::F64Le),
            (audio_format, bits) => Err(SessionError::InvalidFormat(format!(
                "unsupported sample format {} with {} bits per sample",
                audio_format, bits
            ))),
        }
    }

    /// Build a canonical 44-byte integer PCM header for test fixtures.
    #[cfg(test)]
    pub fn encode(channels: u16, sample_rate: u32, bits_per_sample: u16, data_size: u32) -> Vec<u8> {
        let block_align = channels * (bits_per_sample / 8);
        let byte_rate = sample_rate * block_align as u32;

        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(CHUNK_ID);
        out.extend_from_slice(&(36 + data_size).to_le_bytes());
        out.extend_from_slice(FORMAT_TAG);
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits_per_sample.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_size.to_le_bytes());
        out
    }
}

impl fmt::Display for ContainerHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} channel(s), {} Hz, {} bit",
            self.channels, self.sample_rate, self.bits_per_sample
        )
    }
}
