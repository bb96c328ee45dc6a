//! Encode dispatch: turn the frame sequence into a video.
//!
//! A [`CodecProfile`] fixes the encoder backend, how quality is controlled
//! and the output suffix. An [`EncodeJob`] captures everything one ffmpeg
//! invocation needs and renders it as an argument vector. No shell is
//! involved, so paths are passed through untouched.
//!
//! The encoder runs synchronously with no timeout. A non-zero exit is
//! reported and never retried.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::sequence::SEQUENCE_PATTERN;
use crate::timestamp::CaptureInstant;

/// Resolution tag embedded in every output file name.
pub const RESOLUTION_TAG: &str = "1080p";

/// Codec profiles the encoder can be driven with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecProfile {
    /// Software HEVC (libx265), constant rate factor.
    #[default]
    Hevc,
    /// Hardware HEVC (`VideoToolbox`), target bitrate.
    #[serde(alias = "hevc_vt")]
    HevcHardware,
    /// Software H.264 (libx264), constant rate factor.
    #[serde(alias = "x264")]
    H264,
}

impl CodecProfile {
    /// ffmpeg encoder name.
    pub fn encoder(self) -> &'static str {
        match self {
            Self::Hevc => "libx265",
            Self::HevcHardware => "hevc_videotoolbox",
            Self::H264 => "libx264",
        }
    }

    /// Output file suffix.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Hevc | Self::HevcHardware => "hevc",
            Self::H264 => "h264",
        }
    }

    /// The profile's quality setting, taken from configuration.
    pub fn quality(self, config: &Config) -> Quality {
        match self {
            Self::Hevc => Quality::Crf(config.crf_hevc),
            Self::HevcHardware => Quality::Bitrate(config.hardware_bitrate.clone()),
            Self::H264 => Quality::Crf(config.crf_h264),
        }
    }
}

impl fmt::Display for CodecProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hevc => "hevc",
            Self::HevcHardware => "hevc_hardware",
            Self::H264 => "h264",
        })
    }
}

/// How the encoder trades size for quality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quality {
    /// Constant rate factor: lower is better.
    Crf(u8),
    /// Target bitrate in ffmpeg notation, e.g. `6000K`.
    Bitrate(String),
}

/// Errors from running the encoder.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to run {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("encoder exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// One encoder invocation. Built once per run, after sequencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeJob {
    pub profile: CodecProfile,
    pub quality: Quality,
    pub framerate: u32,
    /// `<sequence>/seq-%08d.jpg`
    pub input: PathBuf,
    pub output: PathBuf,
}

impl EncodeJob {
    /// Build the job for a run whose newest frame is `latest`.
    pub fn new(config: &Config, latest: &CaptureInstant) -> Self {
        Self::with_date_suffix(config, &latest.date_suffix())
    }

    /// Build the job with an explicit date suffix, e.g. for previews.
    pub fn with_date_suffix(config: &Config, date_suffix: &str) -> Self {
        let profile = config.codec;
        Self {
            profile,
            quality: profile.quality(config),
            framerate: config.framerate,
            input: config.sequence_dir.join(SEQUENCE_PATTERN),
            output: config.output_dir.join(output_name(date_suffix, profile)),
        }
    }

    /// ffmpeg arguments, excluding the program name.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-framerate".into(),
            self.framerate.to_string().into(),
            "-i".into(),
            self.input.clone().into(),
            "-c:v".into(),
            self.profile.encoder().into(),
        ];

        match &self.quality {
            Quality::Crf(crf) => args.extend(["-crf".into(), crf.to_string().into()]),
            Quality::Bitrate(rate) => args.extend(["-b:v".into(), rate.into()]),
        }

        if self.profile == CodecProfile::Hevc {
            args.extend(["-profile:v".into(), "main".into()]);
        }
        if self.profile != CodecProfile::H264 {
            // Apple players only recognise HEVC in MP4 with the hvc1 tag.
            args.extend(["-tag:v".into(), "hvc1".into()]);
        }

        args.extend([
            "-movflags".into(),
            "+faststart".into(),
            "-an".into(),
            self.output.clone().into(),
        ]);
        args
    }
}

/// `timelapse_2024-03-01_1080p_hevc.mp4`
pub fn output_name(date_suffix: &str, profile: CodecProfile) -> String {
    format!(
        "timelapse{date_suffix}_{RESOLUTION_TAG}_{}.mp4",
        profile.suffix()
    )
}

/// Runs an encode job to completion.
pub trait Encoder {
    fn encode(&self, job: &EncodeJob) -> Result<(), EncodeError>;
}

/// The ffmpeg command-line encoder.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Ffmpeg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Render the full invocation for display.
    pub fn command_line(&self, job: &EncodeJob) -> String {
        std::iter::once(self.program.as_os_str().to_owned())
            .chain(job.args())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Encoder for Ffmpeg {
    fn encode(&self, job: &EncodeJob) -> Result<(), EncodeError> {
        log::debug!("running {}", self.command_line(job));

        let output = Command::new(&self.program)
            .args(job.args())
            .output()
            .map_err(|source| EncodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncodeError::Failed {
                status: output.status,
                stderr: tail(&stderr, 20),
            });
        }

        Ok(())
    }
}

/// The last `lines` lines of ffmpeg's chatter, where the actual error is.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
