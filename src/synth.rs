//! `SynthSource`: the never-failing fallback generator.
//!
//! Produces 16-bit interleaved stereo at the output sample rate; the stream's
//! resampler then shapes it to whatever the pipeline currently targets. White
//! noise is quiet by design: enough to show the chain is alive, not enough to
//! startle listeners.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::frame::PcmFrame;
use crate::profile::{SynthMode, NOISE_FULL_SCALE};

pub struct SynthSource {
    mode: SynthMode,
    rng: SmallRng,
}

impl SynthSource {
    pub fn new(mode: SynthMode) -> Self {
        Self {
            mode,
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Deterministic generator for tests.
    pub fn with_seed(mode: SynthMode, seed: u64) -> Self {
        Self {
            mode,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn mode(&self) -> SynthMode {
        self.mode
    }

    /// One frame of synthesized audio: `frames` samples per channel, stereo,
    /// 16-bit interleaved, at `sample_rate`. Both channels carry the same
    /// value per sample index.
    pub fn next_frame(&mut self, sample_rate: u32, frames: usize) -> PcmFrame {
        let half_scale = NOISE_FULL_SCALE / 2;
        let mut samples = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            let v: i16 = match self.mode {
                SynthMode::Silence => 0,
                SynthMode::WhiteNoise => self.rng.random_range(-half_scale..=half_scale),
            };
            samples.push(v);
            samples.push(v);
        }
        PcmFrame::from_i16(sample_rate, 2, samples)
    }
}
