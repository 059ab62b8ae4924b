//! `PcmFrame`, an owned writable block of PCM samples, plus the format and
//! channel conversions the pipeline needs between stages.
//!
//! Frames are value-like: cheap to reallocate and never shared. Conversions
//! go through interleaved `f32` as the common intermediate, matching the wire
//! format the decoder emits.

use anyhow::{ensure, Result};

use crate::profile::{PcmSpec, SampleFormat};

/// Sample storage for one frame. The variant fixes the frame's format.
#[derive(Clone, Debug)]
pub enum PcmData {
    /// Interleaved 16-bit signed.
    I16(Vec<i16>),
    /// Interleaved 32-bit float.
    F32(Vec<f32>),
    /// Planar 32-bit float, one buffer per channel.
    F32Planar(Vec<Vec<f32>>),
}

#[derive(Clone, Debug)]
pub struct PcmFrame {
    sample_rate: u32,
    channels: usize,
    frames: usize,
    data: PcmData,
}

impl PcmFrame {
    /// An all-zero frame in the given shape.
    pub fn silent(spec: PcmSpec, frames: usize) -> Self {
        let data = match spec.format {
            SampleFormat::S16 => PcmData::I16(vec![0; frames * spec.channels]),
            SampleFormat::F32 => PcmData::F32(vec![0.0; frames * spec.channels]),
            SampleFormat::F32Planar => {
                PcmData::F32Planar(vec![vec![0.0; frames]; spec.channels])
            }
        };
        Self {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            frames,
            data,
        }
    }

    /// Wrap interleaved 16-bit samples. `samples.len()` must be a multiple of
    /// `channels`.
    pub fn from_i16(sample_rate: u32, channels: usize, samples: Vec<i16>) -> Self {
        let frames = samples.len() / channels.max(1);
        Self {
            sample_rate,
            channels,
            frames,
            data: PcmData::I16(samples),
        }
    }

    /// Wrap interleaved `f32` samples.
    pub fn from_f32(sample_rate: u32, channels: usize, samples: Vec<f32>) -> Self {
        let frames = samples.len() / channels.max(1);
        Self {
            sample_rate,
            channels,
            frames,
            data: PcmData::F32(samples),
        }
    }

    /// Wrap planar `f32` channel buffers. All channels must share a length.
    pub fn from_planar_f32(sample_rate: u32, planes: Vec<Vec<f32>>) -> Self {
        let channels = planes.len();
        let frames = planes.first().map(|p| p.len()).unwrap_or(0);
        Self {
            sample_rate,
            channels,
            frames,
            data: PcmData::F32Planar(planes),
        }
    }

    pub fn spec(&self) -> PcmSpec {
        PcmSpec {
            sample_rate: self.sample_rate,
            format: self.format(),
            channels: self.channels,
        }
    }

    pub fn format(&self) -> SampleFormat {
        match self.data {
            PcmData::I16(_) => SampleFormat::S16,
            PcmData::F32(_) => SampleFormat::F32,
            PcmData::F32Planar(_) => SampleFormat::F32Planar,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Whole milliseconds this frame spans at its sample rate.
    pub fn duration_millis(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frames as i64 * 1000) / self.sample_rate as i64
    }

    pub fn data(&self) -> &PcmData {
        &self.data
    }

    /// Planar channel buffers, when this frame is planar float.
    pub fn planes(&self) -> Option<&[Vec<f32>]> {
        match &self.data {
            PcmData::F32Planar(p) => Some(p),
            _ => None,
        }
    }

    pub fn planes_mut(&mut self) -> Option<&mut [Vec<f32>]> {
        match &mut self.data {
            PcmData::F32Planar(p) => Some(p),
            _ => None,
        }
    }

    /// Copy out as interleaved `f32`, the pipeline's common intermediate.
    pub fn to_interleaved_f32(&self) -> Vec<f32> {
        match &self.data {
            PcmData::I16(s) => s.iter().map(|&v| i16_to_f32(v)).collect(),
            PcmData::F32(s) => s.clone(),
            PcmData::F32Planar(planes) => {
                let mut out = Vec::with_capacity(self.frames * self.channels);
                for i in 0..self.frames {
                    for plane in planes {
                        out.push(plane[i]);
                    }
                }
                out
            }
        }
    }
}

/// Encode interleaved `f32` (already at `spec.channels`) into a frame of
/// `spec.format`.
pub fn encode_interleaved_f32(spec: PcmSpec, samples: &[f32]) -> PcmFrame {
    match spec.format {
        SampleFormat::S16 => PcmFrame::from_i16(
            spec.sample_rate,
            spec.channels,
            samples.iter().map(|&v| f32_to_i16(v)).collect(),
        ),
        SampleFormat::F32 => {
            PcmFrame::from_f32(spec.sample_rate, spec.channels, samples.to_vec())
        }
        SampleFormat::F32Planar => {
            let frames = samples.len() / spec.channels.max(1);
            let mut planes = vec![Vec::with_capacity(frames); spec.channels];
            for (i, &v) in samples.iter().enumerate() {
                planes[i % spec.channels].push(v);
            }
            PcmFrame::from_planar_f32(spec.sample_rate, planes)
        }
    }
}

/// Map interleaved samples from `in_ch` to `out_ch` channels.
///
/// Mono → stereo duplicates, stereo → mono averages, anything else clamps to
/// the available channels.
pub fn map_channels(samples: &[f32], in_ch: usize, out_ch: usize) -> Vec<f32> {
    if in_ch == out_ch || in_ch == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / in_ch;
    let mut out = Vec::with_capacity(frames * out_ch);
    for f in 0..frames {
        let base = f * in_ch;
        for ch in 0..out_ch {
            let v = match (in_ch, out_ch) {
                (1, _) => samples[base],
                (2, 1) => 0.5 * (samples[base] + samples[base + 1]),
                _ => samples[base + ch.min(in_ch - 1)],
            };
            out.push(v);
        }
    }
    out
}

/// Convert a frame to another same-rate shape (format and/or channel count).
pub fn convert_frame(frame: &PcmFrame, spec: PcmSpec) -> Result<PcmFrame> {
    ensure!(
        frame.sample_rate() == spec.sample_rate,
        "same-rate conversion requested across rates ({} -> {})",
        frame.sample_rate(),
        spec.sample_rate
    );
    let interleaved = frame.to_interleaved_f32();
    let mapped = map_channels(&interleaved, frame.channels(), spec.channels);
    Ok(encode_interleaved_f32(spec, &mapped))
}

fn i16_to_f32(v: i16) -> f32 {
    v as f32 / 32_768.0
}

fn f32_to_i16(v: f32) -> i16 {
    (v * 32_767.0).clamp(-32_768.0, 32_767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(format: SampleFormat, channels: usize) -> PcmSpec {
        PcmSpec {
            sample_rate: 48_000,
            format,
            channels,
        }
    }

    #[test]
    fn silent_frame_has_requested_shape() {
        let frame = PcmFrame::silent(spec(SampleFormat::F32Planar, 2), 64);
        assert_eq!(frame.frames(), 64);
        assert_eq!(frame.channels(), 2);
        assert_eq!(frame.format(), SampleFormat::F32Planar);
        assert!(frame.planes().unwrap().iter().all(|p| p.len() == 64));
    }

    #[test]
    fn interleaved_roundtrip_through_planar() {
        let frame = PcmFrame::from_f32(48_000, 2, vec![0.1, -0.1, 0.2, -0.2]);
        let planar = convert_frame(&frame, spec(SampleFormat::F32Planar, 2)).unwrap();
        assert_eq!(planar.planes().unwrap()[0], vec![0.1, 0.2]);
        assert_eq!(planar.planes().unwrap()[1], vec![-0.1, -0.2]);
        assert_eq!(planar.to_interleaved_f32(), vec![0.1, -0.1, 0.2, -0.2]);
    }

    #[test]
    fn s16_scaling_is_symmetric() {
        let frame = PcmFrame::from_i16(48_000, 1, vec![0, 16_384, -16_384]);
        let f = frame.to_interleaved_f32();
        assert_eq!(f[0], 0.0);
        assert!((f[1] - 0.5).abs() < 1e-3);
        assert!((f[2] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        assert_eq!(map_channels(&[0.5, -0.5], 1, 2), vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn stereo_to_mono_averages() {
        assert_eq!(map_channels(&[1.0, 0.0, 0.0, 1.0], 2, 1), vec![0.5, 0.5]);
    }

    #[test]
    fn surround_clamps_to_available_channels() {
        // 3-channel input down to stereo keeps the first two channels.
        let mapped = map_channels(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 3, 2);
        assert_eq!(mapped, vec![0.1, 0.2, 0.4, 0.5]);
    }

    #[test]
    fn duration_millis_matches_rate() {
        let frame = PcmFrame::silent(spec(SampleFormat::S16, 2), 1024);
        assert_eq!(frame.duration_millis(), 21);
    }
}
