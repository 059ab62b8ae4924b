//! Fondue, a continuous audio broadcasting daemon.
//!
//! One source at a time is decoded, normalized to a fixed output profile,
//! paced slightly ahead of wall-clock, and pushed to a sink. Operator
//! commands on stdin can switch sources (with a crossfade), edit the source
//! store, or shut the daemon down. When a source fails or runs out, a
//! synthesized fallback keeps the outbound stream alive.
//!
//! ## Threads
//! - **audio**: drives the decode → resample → pace → sink pipeline
//! - **control**: reads operator commands and arms incoming sources
//!
//! The two share a pair of atomic flags and one mutex-guarded staged-source
//! slot; see `engine`.

mod buffer;
mod cli;
mod clock;
mod config;
mod control;
mod decode;
mod engine;
mod frame;
mod input;
mod profile;
mod resample;
mod sink;
mod synth;

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::OutputTarget;
use crate::config::{ConfigStore, SourceSpec};
use crate::control::ControlContext;
use crate::engine::{ControlFlags, StagedSource};
use crate::input::InputStream;
use crate::profile::{ChannelLayout, OutputProfile, SynthMode, TimingMode};
use crate::sink::{AudioSink, DeviceSink, WavSink};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let profile = OutputProfile {
        sample_rate: args.sample_rate,
        channel_layout: if args.mono {
            ChannelLayout::Mono
        } else {
            ChannelLayout::Stereo
        },
        sample_format: cli::parse_format(&args.format)?,
        frame_samples: args.frame_samples,
    };
    let timing = if args.freetime {
        TimingMode::Freetime
    } else {
        TimingMode::Realtime
    };
    let fallback = if args.silence_fallback {
        SynthMode::Silence
    } else {
        SynthMode::WhiteNoise
    };

    // The sink must open; everything after this recovers in place.
    let mut sink: Box<dyn AudioSink> = match cli::parse_output(&args.output)? {
        OutputTarget::Wav(path) => Box::new(
            WavSink::create(&path, profile).context("open broadcast target")?,
        ),
        OutputTarget::Device(name) => Box::new(
            DeviceSink::open(name.as_deref(), profile).context("open broadcast target")?,
        ),
    };
    // The sink is the authority on the output shape from here on.
    let profile = sink.profile();
    tracing::info!(
        rate_hz = profile.sample_rate,
        channels = profile.channel_layout.count(),
        frame_samples = profile.frame_samples,
        "broadcasting"
    );

    let store = ConfigStore::load_or_default(&args.config)?;
    let source = initial_source(&args.source, &store, profile, timing, fallback)?;

    let flags = Arc::new(ControlFlags::new());
    let staged: Arc<StagedSource> = Arc::new(Mutex::new(None));

    {
        let flags = flags.clone();
        let _ = ctrlc::set_handler(move || {
            flags.request_stop();
        });
    }

    let audio = {
        let flags = flags.clone();
        let staged = staged.clone();
        let fade_ms = args.fade_ms;
        thread::spawn(move || {
            engine::run_audio(source, &staged, &mut *sink, &flags, fade_ms);
        })
    };

    // The control thread blocks on stdin; it is not joined, because the
    // process ends when the audio thread has finished the sink.
    {
        let flags = flags.clone();
        let staged = staged.clone();
        let config_path = args.config.clone();
        thread::spawn(move || {
            let ctx = ControlContext {
                config_path: &config_path,
                profile,
                timing,
                fallback,
            };
            control::run_control(io::stdin().lock(), &flags, &staged, &ctx);
        });
    }

    audio
        .join()
        .map_err(|_| anyhow::anyhow!("audio thread panicked"))?;
    tracing::info!("stream finished");
    Ok(())
}

/// Resolve and open the startup source. A failed open falls back to the
/// synthesized source rather than aborting the daemon.
fn initial_source(
    requested: &Option<String>,
    store: &ConfigStore,
    profile: OutputProfile,
    timing: TimingMode,
    fallback: SynthMode,
) -> Result<InputStream> {
    let Some(target) = requested else {
        tracing::info!("no initial source configured, starting on fallback audio");
        return InputStream::synthetic(profile, timing, fallback);
    };

    let spec = store
        .get(target)
        .cloned()
        .unwrap_or_else(|| SourceSpec::from_url(target.clone()));

    match InputStream::open(
        &spec.url,
        spec.format.as_deref(),
        &spec.options,
        profile,
        timing,
        fallback,
    ) {
        Ok(stream) => {
            tracing::info!(url = %spec.url, "streaming initial source");
            Ok(stream)
        }
        Err(e) => {
            tracing::warn!(url = %spec.url, "cannot open initial source, switching to fallback: {e:#}");
            InputStream::synthetic(profile, timing, fallback)
        }
    }
}
