//! Transcoder command line built from the configuration and the validated header.

use crate::audio::ContainerHeader;
use crate::config::{OutputCodec, TranscoderConfig};
use crate::error::SessionError;

/// Executable plus arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TranscoderCommand {
    /// Build the command for one session.
    ///
    /// The input side describes the raw PCM that follows the header
    /// (`-f s16le -ar 44100 -ac 2 -i pipe:0`); the output side depends on the
    /// configured codec and always writes to `pipe:1`.
    pub fn build(config: &TranscoderConfig, header: &ContainerHeader) -> Result<Self, SessionError> {
        let sample_format = header.sample_format()?;

        let mut argv: Vec<String> = config.wrapper_args.clone();
        argv.push(config.ffmpeg_path.clone());

        argv.extend(
            [
                "-hide_banner",
                "-nostats",
                "-loglevel",
                config.log_level.as_str(),
                "-f",
                sample_format.as_str(),
            ]
            .map(String::from),
        );
        argv.extend([
            "-ar".to_string(),
            header.sample_rate.to_string(),
            "-ac".to_string(),
            header.channels.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
        ]);

        match config.codec {
            OutputCodec::Aac => argv.extend([
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                format!("{}k", config.bitrate_kbps),
                "-f".to_string(),
                "mp4".to_string(),
                "-movflags".to_string(),
                config.movflags.clone(),
                "-frag_duration".to_string(),
                config.frag_duration_us.to_string(),
                "-muxdelay".to_string(),
                config.mux_delay_secs.to_string(),
            ]),
            OutputCodec::Flac => argv.extend([
                "-c:a".to_string(),
                "flac".to_string(),
                "-compression_level".to_string(),
                config.flac_compression_level.to_string(),
                "-f".to_string(),
                "flac".to_string(),
            ]),
        }

        if let Some(threads) = config.threads {
            argv.extend(["-threads".to_string(), threads.to_string()]);
        }
        argv.push("pipe:1".to_string());

        let program = argv.remove(0);
        Ok(Self { program, args: argv })
    }

    /// Command line as one string, for logging.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
