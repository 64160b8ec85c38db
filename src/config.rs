//! # Configuration Management
//!
//! Loads the gateway configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables `HOST`, `PORT`, `FFMPEG_PATH`, `BUFFER_SIZE`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_STREAM__MAX_SESSION_BYTES`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Sessions take a snapshot of the transcoder and stream sections when the
//! websocket is upgraded, so runtime updates only affect new sessions.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transcoder: TranscoderConfig,
    pub stream: StreamConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Target codec produced by the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCodec {
    /// AAC in fragmented, streamable MP4
    Aac,
    /// Lossless FLAC frames
    Flac,
}

impl OutputCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputCodec::Aac => "aac",
            OutputCodec::Flac => "flac",
        }
    }
}

/// External transcoder process settings.
///
/// ## Fields:
/// - `ffmpeg_path`: Executable to run
/// - `wrapper_args`: Launcher placed in front of `ffmpeg_path`, e.g. `["nice", "-n", "10"]`
/// - `codec`: Output codec (`aac` or `flac`)
/// - `bitrate_kbps`: AAC bitrate
/// - `frag_duration_us`: MP4 fragment duration handed to `-frag_duration`
/// - `movflags`: MP4 muxer flags for a streamable container
/// - `mux_delay_secs`: Maximum demux-decode delay (`-muxdelay`)
/// - `flac_compression_level`: FLAC compression level (0-12)
/// - `threads`: Optional encoder thread count
/// - `log_level`: Transcoder log level; its diagnostic output is logged at debug
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub ffmpeg_path: String,
    pub wrapper_args: Vec<String>,
    pub codec: OutputCodec,
    pub bitrate_kbps: u32,
    pub frag_duration_us: u32,
    pub movflags: String,
    pub mux_delay_secs: f64,
    pub flac_compression_level: u8,
    pub threads: Option<usize>,
    pub log_level: String,
}

/// Per-session streaming limits and timing.
///
/// ## Tuning guidelines:
/// - Larger `buffer_size`: fewer, bigger outbound messages
/// - Larger `input_queue_capacity`: more tolerance for a slow transcoder before chunks are dropped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Bytes read from the transcoder output per outbound message
    pub buffer_size: usize,

    /// Largest single websocket message accepted from a client
    pub max_message_bytes: usize,

    /// Pending PCM chunks held before new chunks are dropped
    pub input_queue_capacity: usize,

    /// Ceiling on payload bytes accepted from one client
    pub max_session_bytes: u64,

    /// How long teardown waits for the transcoder to exit before killing it
    pub stop_grace_ms: u64,

    /// Interval between websocket pings
    pub heartbeat_interval_secs: u64,

    /// Connection is dropped after this long without client traffic
    pub client_timeout_secs: u64,
}

impl StreamConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "/usr/bin/ffmpeg".to_string(),
            wrapper_args: Vec::new(),
            codec: OutputCodec::Aac,
            bitrate_kbps: 192,
            frag_duration_us: 500,
            movflags: "frag_keyframe+empty_moov+default_base_moof".to_string(),
            mux_delay_secs: 0.001,
            flac_compression_level: 8,
            threads: None,
            log_level: "warning".to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
            max_message_bytes: 1024 * 1024,
            input_queue_capacity: 2048,
            max_session_bytes: 50 * 1024 * 1024,
            stop_grace_ms: 2000,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            transcoder: TranscoderConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_TRANSCODER__CODEC=flac`: Switch the output codec
    /// - `APP_TRANSCODER__WRAPPER_ARGS="nice -n 10"`: Space-separated launcher
    /// - `FFMPEG_PATH=/opt/ffmpeg/bin/ffmpeg`: Transcoder executable
    /// - `BUFFER_SIZE=65536`: Output read size
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("transcoder.wrapper_args")
                    .try_parsing(true),
            );

        // Plain variables used by existing deployments
        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("FFMPEG_PATH", "transcoder.ffmpeg_path"),
            ("BUFFER_SIZE", "stream.buffer_size"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.transcoder.ffmpeg_path.trim().is_empty() {
            return Err(anyhow::anyhow!("Transcoder path cannot be empty"));
        }

        if self.transcoder.flac_compression_level > 12 {
            return Err(anyhow::anyhow!(
                "FLAC compression level must be between 0 and 12, got {}",
                self.transcoder.flac_compression_level
            ));
        }

        if self.transcoder.codec == OutputCodec::Aac && self.transcoder.bitrate_kbps == 0 {
            return Err(anyhow::anyhow!("AAC bitrate must be greater than 0"));
        }

        if self.stream.buffer_size == 0 {
            return Err(anyhow::anyhow!("Buffer size must be greater than 0"));
        }

        if self.stream.max_message_bytes == 0 {
            return Err(anyhow::anyhow!("Max message bytes must be greater than 0"));
        }

        if self.stream.input_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Input queue capacity must be greater than 0"));
        }

        if self.stream.max_session_bytes == 0 {
            return Err(anyhow::anyhow!("Max session bytes must be greater than 0"));
        }

        if self.stream.client_timeout_secs <= self.stream.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.stream.client_timeout_secs,
                self.stream.heartbeat_interval_secs
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON document (used for runtime config updates).
    ///
    /// Only the keys present in the document change, e.g.
    /// `{"stream": {"max_session_bytes": 1048576}}` leaves everything else untouched.
    /// The result is validated before it replaces `self`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Recursively overlay `patch` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
