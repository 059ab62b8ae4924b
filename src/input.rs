//! `InputStream`, the core frame producer.
//!
//! Unifies decoded and synthesized sources behind one surface: decoder (or
//! synth) → primary resampler → FIFO → fixed-size output frames in the
//! profile shape. Entering a crossfade retargets the primary resampler and
//! FIFO to planar-float stereo; the dedicated crossfade resampler then shapes
//! mixed frames back to the profile so the sink contract never changes.
//!
//! Streams are move-only. There is no placeholder shape: absence is
//! expressed as `Option<InputStream>` at the staged-source slot.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::buffer::FrameBuffer;
use crate::clock::PacingClock;
use crate::decode::{Pull, SourceDecoder};
use crate::frame::PcmFrame;
use crate::profile::{crossfade_spec, OutputProfile, PcmSpec, SampleFormat, SynthMode, TimingMode};
use crate::resample::Resampler;
use crate::synth::SynthSource;

/// Why a stream could not produce a frame.
///
/// `Retry`-class conditions never surface here; they are absorbed inside the
/// decode loop. The engine reacts to both variants the same way (substitute
/// a synthetic source) but logs them differently.
#[derive(Debug)]
pub enum StreamError {
    /// The decoder ran out of packets and the flushed tail could not fill a
    /// final frame.
    EndOfSource,
    /// Decoder, resampler, or buffer refused to continue.
    Fatal(anyhow::Error),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::EndOfSource => write!(f, "end of source"),
            StreamError::Fatal(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for StreamError {}

fn fatal(msg: &'static str) -> StreamError {
    StreamError::Fatal(anyhow!(msg))
}

pub struct InputStream {
    url: Option<String>,
    decoder: Option<SourceDecoder>,
    resampler: Resampler,
    /// Shapes mixed crossfade frames back to the profile. Kept separate from
    /// the primary resampler so retargeting the fade domain never costs the
    /// main pipeline its tail samples.
    xfade_resampler: Resampler,
    buffer: FrameBuffer,
    current: PcmFrame,
    profile: OutputProfile,
    clock: PacingClock,
    synth: SynthSource,
    source_valid: bool,
    flushed: bool,
    in_crossfade: bool,
}

impl InputStream {
    /// Bind a stream to a decodable URL.
    pub fn open(
        url: &str,
        format_hint: Option<&str>,
        options: &BTreeMap<String, String>,
        profile: OutputProfile,
        timing: TimingMode,
        fallback: SynthMode,
    ) -> Result<Self> {
        let decoder = SourceDecoder::open(url, format_hint, options)?;
        let resampler = Resampler::new(decoder.spec(), profile.spec())?;
        Ok(Self {
            url: Some(url.to_string()),
            decoder: Some(decoder),
            resampler,
            xfade_resampler: Resampler::new(crossfade_spec(&profile), profile.spec())?,
            buffer: FrameBuffer::new(profile.spec()),
            current: PcmFrame::silent(profile.spec(), profile.frame_samples),
            profile,
            clock: PacingClock::new(&profile, timing),
            synth: SynthSource::new(fallback),
            source_valid: true,
            flushed: false,
            in_crossfade: false,
        })
    }

    /// A stream with no decoder that synthesizes its audio. Never fails to
    /// produce frames once constructed.
    pub fn synthetic(profile: OutputProfile, timing: TimingMode, mode: SynthMode) -> Result<Self> {
        let synth_spec = PcmSpec {
            sample_rate: profile.sample_rate,
            format: SampleFormat::S16,
            channels: 2,
        };
        let resampler = Resampler::new(synth_spec, profile.spec())?;
        Ok(Self {
            url: None,
            decoder: None,
            resampler,
            xfade_resampler: Resampler::new(crossfade_spec(&profile), profile.spec())?,
            buffer: FrameBuffer::new(profile.spec()),
            current: PcmFrame::silent(profile.spec(), profile.frame_samples),
            profile,
            clock: PacingClock::new(&profile, timing),
            synth: SynthSource::new(mode),
            source_valid: false,
            flushed: false,
            in_crossfade: false,
        })
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn profile(&self) -> OutputProfile {
        self.profile
    }

    pub fn timing_mode(&self) -> TimingMode {
        self.clock.mode()
    }

    /// The synth mode this stream falls back to (or runs on, if synthetic).
    pub fn fallback_mode(&self) -> SynthMode {
        self.synth.mode()
    }

    pub fn is_synthetic(&self) -> bool {
        !self.source_valid
    }

    /// Whether the pipeline currently targets the fade domain.
    pub fn in_crossfade(&self) -> bool {
        self.in_crossfade
    }

    /// The most recently produced frame, ready for the sink after a
    /// successful `get_one_output_frame` or `crossfade_frame`.
    pub fn current_frame(&self) -> &PcmFrame {
        &self.current
    }

    /// Fill `current_frame` with exactly `frame_samples` samples in the
    /// pipeline's current target shape.
    pub fn get_one_output_frame(&mut self) -> Result<(), StreamError> {
        if !self.source_valid {
            return self.synthesize_frame();
        }

        let want = self.profile.frame_samples;
        while self.buffer.len() < want {
            let pulled = match self.decoder.as_mut() {
                Some(decoder) => decoder.pull(),
                None => return Err(fatal("stream has no decoder")),
            };
            match pulled {
                Ok(Pull::Frame(raw)) => {
                    let emitted = self.resampler.push(&raw).map_err(StreamError::Fatal)?;
                    if emitted.frames() > 0 {
                        self.buffer.write(&emitted).map_err(StreamError::Fatal)?;
                    }
                }
                Ok(Pull::Retry) => continue,
                Ok(Pull::Eof) => {
                    if !self.flushed {
                        self.flushed = true;
                        self.flush_resampler().map_err(StreamError::Fatal)?;
                        if self.buffer.len() >= want {
                            break;
                        }
                    }
                    return Err(StreamError::EndOfSource);
                }
                Err(e) => return Err(StreamError::Fatal(e)),
            }
        }

        self.current = self.buffer.read(want).map_err(StreamError::Fatal)?;
        Ok(())
    }

    fn synthesize_frame(&mut self) -> Result<(), StreamError> {
        let raw = self
            .synth
            .next_frame(self.profile.sample_rate, self.profile.frame_samples);
        // Same-rate conversion: the frame count is preserved.
        self.current = self.resampler.push(&raw).map_err(StreamError::Fatal)?;
        Ok(())
    }

    /// Mix one frame of this (outgoing) stream against `incoming`.
    ///
    /// Both sides must be in the fade domain (planar-float stereo at the
    /// output rate), established by `init_crossfade` on each stream. The gain
    /// is the normalized fade progress at the start of the frame. After the
    /// mix, the frame is shaped back to the profile for the sink and
    /// `remaining_ms` is decremented by the frame's length.
    pub fn crossfade_frame(
        &mut self,
        incoming: &PcmFrame,
        remaining_ms: &mut i64,
        total_ms: i64,
    ) -> Result<(), StreamError> {
        self.get_one_output_frame()?;

        let progress = 1.0 - (*remaining_ms as f32 / total_ms.max(1) as f32);
        let frame_ms = self.current.duration_millis();
        {
            let own = self
                .current
                .planes_mut()
                .ok_or_else(|| fatal("crossfade requires planar float frames"))?;
            let inc = incoming
                .planes()
                .ok_or_else(|| fatal("incoming crossfade frame is not planar float"))?;
            for (own_plane, inc_plane) in own.iter_mut().zip(inc) {
                for (o, i) in own_plane.iter_mut().zip(inc_plane) {
                    *o = *o * (1.0 - progress) + *i * progress;
                }
            }
        }

        self.current = self
            .xfade_resampler
            .push(&self.current)
            .map_err(StreamError::Fatal)?;
        *remaining_ms -= frame_ms;
        Ok(())
    }

    /// Retarget the pipeline to the fade domain. Must run on both endpoints
    /// before any `crossfade_frame`.
    pub fn init_crossfade(&mut self) -> Result<()> {
        let fade = crossfade_spec(&self.profile);
        self.resampler.set_output(fade);
        self.resampler.reinit()?;
        self.buffer.retag(fade)?;
        self.in_crossfade = true;
        Ok(())
    }

    /// Restore the profile shape after a fade.
    pub fn end_crossfade(&mut self) -> Result<()> {
        self.resampler.set_output(self.profile.spec());
        self.resampler.reinit()?;
        self.buffer.retag(self.profile.spec())?;
        self.in_crossfade = false;
        Ok(())
    }

    /// Drain the primary resampler's staged tail into the FIFO.
    pub fn flush_resampler(&mut self) -> Result<()> {
        let tail = self.resampler.flush()?;
        if tail.frames() > 0 {
            self.buffer.write(&tail)?;
        }
        Ok(())
    }

    /// Pace the caller against this stream's loop interval.
    pub fn sleep(&self, deadline: &mut Instant) {
        self.clock.sleep(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::write_test_wav;
    use crate::profile::ChannelLayout;

    fn profile(format: SampleFormat, frame_samples: usize) -> OutputProfile {
        OutputProfile {
            sample_rate: 48_000,
            channel_layout: ChannelLayout::Stereo,
            sample_format: format,
            frame_samples,
        }
    }

    #[test]
    fn synthetic_stream_fills_profile_shaped_frames() {
        let profile = profile(SampleFormat::S16, 512);
        let mut stream =
            InputStream::synthetic(profile, TimingMode::Freetime, SynthMode::WhiteNoise).unwrap();
        assert!(stream.is_synthetic());

        stream.get_one_output_frame().unwrap();
        let frame = stream.current_frame();
        assert_eq!(frame.frames(), 512);
        assert_eq!(frame.spec(), profile.spec());
    }

    #[test]
    fn bound_stream_serves_frames_then_end_of_source() {
        let path = write_test_wav("input-eof.wav", 48_000, 2000);
        let profile = profile(SampleFormat::S16, 512);
        let mut stream = InputStream::open(
            path.to_str().unwrap(),
            None,
            &BTreeMap::new(),
            profile,
            TimingMode::Freetime,
            SynthMode::WhiteNoise,
        )
        .unwrap();

        let mut served = 0;
        loop {
            match stream.get_one_output_frame() {
                Ok(()) => {
                    assert_eq!(stream.current_frame().frames(), 512);
                    assert_eq!(stream.current_frame().spec(), profile.spec());
                    served += 1;
                }
                Err(StreamError::EndOfSource) => break,
                Err(StreamError::Fatal(e)) => panic!("unexpected fatal: {e:#}"),
            }
        }
        // 2000 source frames at the output rate fill three full 512-sample
        // frames; the 464-sample remainder cannot complete a fourth.
        assert_eq!(served, 3);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rate_converted_stream_flushes_its_tail_at_eof() {
        let path = write_test_wav("input-rate.wav", 44_100, 4410);
        let profile = profile(SampleFormat::S16, 512);
        let mut stream = InputStream::open(
            path.to_str().unwrap(),
            None,
            &BTreeMap::new(),
            profile,
            TimingMode::Freetime,
            SynthMode::WhiteNoise,
        )
        .unwrap();

        let mut served = 0;
        while stream.get_one_output_frame().is_ok() {
            served += 1;
        }
        // ~4800 output-rate frames minus the sinc delay: nine full frames.
        assert!((8..=10).contains(&served), "served {served} frames");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn crossfade_init_switches_to_the_fade_domain_and_back() {
        let profile = profile(SampleFormat::S16, 256);
        let mut stream =
            InputStream::synthetic(profile, TimingMode::Freetime, SynthMode::Silence).unwrap();

        assert!(!stream.in_crossfade());
        stream.init_crossfade().unwrap();
        assert!(stream.in_crossfade());
        stream.get_one_output_frame().unwrap();
        assert_eq!(stream.current_frame().format(), SampleFormat::F32Planar);
        assert_eq!(stream.current_frame().channels(), 2);
        assert_eq!(stream.current_frame().frames(), 256);

        stream.end_crossfade().unwrap();
        assert!(!stream.in_crossfade());
        stream.get_one_output_frame().unwrap();
        assert_eq!(stream.current_frame().spec(), profile.spec());
    }

    #[test]
    fn crossfade_start_equals_outgoing_signal() {
        let profile = profile(SampleFormat::S16, 256);
        let mut outgoing =
            InputStream::synthetic(profile, TimingMode::Freetime, SynthMode::Silence).unwrap();
        outgoing.init_crossfade().unwrap();

        let incoming = PcmFrame::from_planar_f32(48_000, vec![vec![0.5; 256]; 2]);
        let total = 1000;
        let mut remaining = total;
        outgoing
            .crossfade_frame(&incoming, &mut remaining, total)
            .unwrap();

        // At remaining == total the gain on the incoming side is zero, so the
        // mix is the outgoing silence.
        assert!(outgoing
            .current_frame()
            .to_interleaved_f32()
            .iter()
            .all(|&v| v.abs() < 1e-4));
        assert_eq!(remaining, total - 5);
    }

    #[test]
    fn crossfade_end_equals_incoming_signal() {
        let profile = profile(SampleFormat::S16, 256);
        let mut outgoing =
            InputStream::synthetic(profile, TimingMode::Freetime, SynthMode::Silence).unwrap();
        outgoing.init_crossfade().unwrap();

        let incoming = PcmFrame::from_planar_f32(48_000, vec![vec![0.5; 256]; 2]);
        let mut remaining = 0;
        outgoing.crossfade_frame(&incoming, &mut remaining, 1000).unwrap();

        assert!(outgoing
            .current_frame()
            .to_interleaved_f32()
            .iter()
            .all(|&v| (v - 0.5).abs() < 1e-3));
    }

    #[test]
    fn crossfade_frames_are_profile_shaped_for_the_sink() {
        let profile = profile(SampleFormat::S16, 256);
        let mut outgoing =
            InputStream::synthetic(profile, TimingMode::Freetime, SynthMode::Silence).unwrap();
        outgoing.init_crossfade().unwrap();

        let incoming = PcmFrame::from_planar_f32(48_000, vec![vec![0.25; 256]; 2]);
        let mut remaining = 500;
        outgoing.crossfade_frame(&incoming, &mut remaining, 1000).unwrap();

        // The crossfade resampler shaped the mixed frame back to the profile.
        assert_eq!(outgoing.current_frame().spec(), profile.spec());
    }
}
