//! `Resampler`: a stateful converter between (rate, format, layout) endpoints.
//!
//! Format and channel mapping are applied first, so rate conversion always
//! runs at the output channel count. Rate conversion uses Rubato's streaming
//! sinc resampler with a fixed input chunk; arbitrary incoming frame sizes
//! are staged until a full chunk is available, and `flush` drains the staged
//! remainder through a partial process call. Equal-rate conversions bypass
//! Rubato entirely and carry no delay.

use anyhow::{ensure, Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    calculate_cutoff, Async, FixedAsync, Indexing, Resampler as RubatoResampler,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::frame::{encode_interleaved_f32, map_channels, PcmFrame};
use crate::profile::PcmSpec;

/// Input chunk size in frames for the steady-state rate-conversion loop.
const CHUNK_FRAMES: usize = 1024;

pub struct Resampler {
    input: PcmSpec,
    output: PcmSpec,
    /// Present only when the endpoint rates differ.
    inner: Option<Box<dyn RubatoResampler<f32>>>,
    /// Interleaved staging at the output channel count, input rate.
    staging: Vec<f32>,
    scratch: Vec<f32>,
}

impl Resampler {
    pub fn new(input: PcmSpec, output: PcmSpec) -> Result<Self> {
        let mut resampler = Self {
            input,
            output,
            inner: None,
            staging: Vec::new(),
            scratch: Vec::new(),
        };
        resampler.reinit()?;
        Ok(resampler)
    }

    pub fn input(&self) -> PcmSpec {
        self.input
    }

    pub fn output(&self) -> PcmSpec {
        self.output
    }

    /// Change the input endpoint. Takes effect on the next `reinit`.
    pub fn set_input(&mut self, spec: PcmSpec) {
        self.input = spec;
    }

    /// Change the output endpoint. Takes effect on the next `reinit`.
    pub fn set_output(&mut self, spec: PcmSpec) {
        self.output = spec;
    }

    /// Rebuild the converter for the current endpoints. Any staged input is
    /// discarded, so callers drain with `flush` first when the tail matters.
    pub fn reinit(&mut self) -> Result<()> {
        self.staging.clear();
        if self.input.sample_rate == self.output.sample_rate {
            self.inner = None;
            self.scratch.clear();
            return Ok(());
        }

        let f_ratio = self.output.sample_rate as f64 / self.input.sample_rate as f64;
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let inner = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            CHUNK_FRAMES,
            self.output.channels,
            FixedAsync::Input,
        )
        .context("build sinc resampler")?;
        self.inner = Some(Box::new(inner));
        // Headroom for the worst-case output of one chunk.
        self.scratch = vec![0.0; self.output.channels * CHUNK_FRAMES * 3];
        Ok(())
    }

    /// Convert one frame, returning the output-shaped samples that became
    /// available (possibly zero frames while a chunk is still filling).
    pub fn push(&mut self, frame: &PcmFrame) -> Result<PcmFrame> {
        ensure!(
            frame.sample_rate() == self.input.sample_rate,
            "frame rate {} does not match resampler input rate {}",
            frame.sample_rate(),
            self.input.sample_rate
        );
        ensure!(
            frame.channels() == self.input.channels,
            "frame has {} channels, resampler input expects {}",
            frame.channels(),
            self.input.channels
        );

        let interleaved = frame.to_interleaved_f32();
        let mapped = map_channels(&interleaved, self.input.channels, self.output.channels);

        if self.inner.is_none() {
            return Ok(encode_interleaved_f32(self.output, &mapped));
        }

        self.staging.extend_from_slice(&mapped);
        let ch = self.output.channels;
        let mut produced: Vec<f32> = Vec::new();
        while self.staging.len() >= CHUNK_FRAMES * ch {
            let chunk: Vec<f32> = self.staging.drain(..CHUNK_FRAMES * ch).collect();
            let emitted = self.process_chunk(&chunk, None)?;
            produced.extend_from_slice(&emitted);
        }
        Ok(encode_interleaved_f32(self.output, &produced))
    }

    /// Drain staged input through a partial process call and return the tail.
    /// The converter stays initialized and empty afterwards.
    pub fn flush(&mut self) -> Result<PcmFrame> {
        let ch = self.output.channels;
        if self.inner.is_none() || self.staging.is_empty() {
            self.staging.clear();
            return Ok(encode_interleaved_f32(self.output, &[]));
        }
        let tail: Vec<f32> = self.staging.drain(..).collect();
        let tail_frames = tail.len() / ch;
        let emitted = self.process_chunk(&tail, Some(tail_frames))?;
        Ok(encode_interleaved_f32(self.output, &emitted))
    }

    fn process_chunk(&mut self, chunk: &[f32], partial_len: Option<usize>) -> Result<Vec<f32>> {
        let ch = self.output.channels;
        let frames = chunk.len() / ch;
        let inner = self
            .inner
            .as_mut()
            .expect("process_chunk requires an active rate converter");

        let input_adapter =
            InterleavedSlice::new(chunk, ch, frames).context("wrap resampler input")?;
        let capacity_frames = self.scratch.len() / ch;
        let mut output_adapter = InterleavedSlice::new_mut(&mut self.scratch, ch, capacity_frames)
            .context("wrap resampler output")?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };

        let (_consumed, emitted_frames) = inner
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .context("resampler process")?;

        Ok(self.scratch[..emitted_frames * ch].to_vec())
    }
}
