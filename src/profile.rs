//! Output shapes, per-endpoint PCM specs, and engine tuning constants.

use std::time::Duration;

/// Samples per output frame per channel when the sink does not dictate one.
pub const DEFAULT_FRAME_SAMPLES: usize = 1024;

/// Crossfade length when a source switch is armed.
pub const DEFAULT_FADE_MS: i64 = 5000;

/// How many samples short of a full frame the pacing interval runs.
///
/// The loop therefore runs slightly ahead of real time; the sink's buffer
/// absorbs the surplus, and scheduler jitter never starves it.
pub const PACING_LEAD_SAMPLES: usize = 20;

/// Peak-to-peak amplitude of synthesized white noise on a 16-bit scale.
/// A full scale of 100 lands around -57 dBFS: audible, deliberately quiet.
pub const NOISE_FULL_SCALE: i16 = 100;

/// Sample formats the pipeline moves between stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// Interleaved 16-bit signed integer.
    S16,
    /// Interleaved 32-bit float.
    F32,
    /// Planar 32-bit float, one buffer per channel.
    F32Planar,
}

impl SampleFormat {
    pub fn is_planar(self) -> bool {
        matches!(self, SampleFormat::F32Planar)
    }
}

/// Output channel layouts. Input sides carry arbitrary channel counts and are
/// folded to the output layout by the resampler's channel mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn count(self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }
}

/// Whether the pacing clock holds the pipeline to wall-clock rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingMode {
    /// Sleep each iteration so output stays near (slightly ahead of) real time.
    Realtime,
    /// Never sleep; run as fast as the sink accepts frames.
    Freetime,
}

/// What the synthesized fallback source produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SynthMode {
    Silence,
    WhiteNoise,
}

/// One endpoint of a conversion: rate, sample format, channel count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmSpec {
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channels: usize,
}

/// The fixed shape every source is normalized to before it reaches the sink.
#[derive(Clone, Copy, Debug)]
pub struct OutputProfile {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
    pub frame_samples: usize,
}

impl OutputProfile {
    pub fn spec(&self) -> PcmSpec {
        PcmSpec {
            sample_rate: self.sample_rate,
            format: self.sample_format,
            channels: self.channel_layout.count(),
        }
    }

    /// Nominal wall-clock interval per output frame, minus the pacing lead.
    pub fn loop_duration(&self) -> Duration {
        let samples = self.frame_samples.saturating_sub(PACING_LEAD_SAMPLES).max(1);
        Duration::from_secs_f64(samples as f64 / self.sample_rate as f64)
    }
}

/// The fade/mix domain: planar float stereo at the profile's sample rate.
pub fn crossfade_spec(profile: &OutputProfile) -> PcmSpec {
    PcmSpec {
        sample_rate: profile.sample_rate,
        format: SampleFormat::F32Planar,
        channels: 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_duration_runs_ahead_of_nominal() {
        let profile = OutputProfile {
            sample_rate: 48_000,
            channel_layout: ChannelLayout::Stereo,
            sample_format: SampleFormat::S16,
            frame_samples: 1024,
        };
        let nominal = Duration::from_secs_f64(1024.0 / 48_000.0);
        let paced = profile.loop_duration();
        assert!(paced < nominal);
        assert!(paced > nominal.mul_f64(0.9));
    }

    #[test]
    fn crossfade_spec_is_planar_float_stereo() {
        let profile = OutputProfile {
            sample_rate: 44_100,
            channel_layout: ChannelLayout::Mono,
            sample_format: SampleFormat::S16,
            frame_samples: 512,
        };
        let spec = crossfade_spec(&profile);
        assert_eq!(spec.sample_rate, 44_100);
        assert_eq!(spec.format, SampleFormat::F32Planar);
        assert_eq!(spec.channels, 2);
    }
}
