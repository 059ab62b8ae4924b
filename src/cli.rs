use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::profile::{SampleFormat, DEFAULT_FADE_MS, DEFAULT_FRAME_SAMPLES};

#[derive(Parser, Debug)]
#[command(name = "fondue", version, about = "Continuous audio broadcasting daemon")]
pub struct Args {
    /// Path to the JSON source store
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,

    /// Initial source: a configured name or a literal URL/path. Without one
    /// the daemon starts on the synthesized fallback.
    #[arg(long)]
    pub source: Option<String>,

    /// Broadcast target: "wav:<path>" writes a file, "device" or
    /// "device:<name>" plays on a local output device
    #[arg(long, default_value = "device")]
    pub output: String,

    /// Output sample rate in Hz
    #[arg(long, default_value_t = 48_000)]
    pub sample_rate: u32,

    /// Samples per output frame per channel
    #[arg(long, default_value_t = DEFAULT_FRAME_SAMPLES)]
    pub frame_samples: usize,

    /// Output sample format: s16, f32 or f32p (planar)
    #[arg(long, default_value = "s16")]
    pub format: String,

    /// Mono output instead of stereo
    #[arg(long)]
    pub mono: bool,

    /// Crossfade length in milliseconds when switching sources
    #[arg(long, default_value_t = DEFAULT_FADE_MS)]
    pub fade_ms: i64,

    /// Run unpaced: push frames as fast as the sink accepts them
    #[arg(long)]
    pub freetime: bool,

    /// Substitute silence instead of white noise when a source fails
    #[arg(long)]
    pub silence_fallback: bool,
}

/// Where the encoded stream goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputTarget {
    Wav(PathBuf),
    Device(Option<String>),
}

pub fn parse_output(value: &str) -> Result<OutputTarget> {
    if let Some(path) = value.strip_prefix("wav:") {
        if path.is_empty() {
            bail!("wav output needs a path, e.g. wav:/tmp/out.wav");
        }
        return Ok(OutputTarget::Wav(PathBuf::from(path)));
    }
    if value == "device" {
        return Ok(OutputTarget::Device(None));
    }
    if let Some(name) = value.strip_prefix("device:") {
        return Ok(OutputTarget::Device(Some(name.to_string())));
    }
    bail!("unrecognized output target {value:?} (expected wav:<path> or device[:<name>])");
}

pub fn parse_format(value: &str) -> Result<SampleFormat> {
    match value {
        "s16" => Ok(SampleFormat::S16),
        "f32" => Ok(SampleFormat::F32),
        "f32p" => Ok(SampleFormat::F32Planar),
        other => bail!("unrecognized sample format {other:?} (expected s16, f32 or f32p)"),
    }
}
