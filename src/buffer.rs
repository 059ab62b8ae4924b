//! A FIFO of PCM samples with strict (format, channel count) tagging.
//!
//! The buffer lives inside one `InputStream` and is only touched from the
//! audio thread, so unlike the sink queue it carries no lock. Reads are
//! all-or-nothing: a request for more frames than are buffered is an error,
//! never a short read.

use std::collections::VecDeque;

use anyhow::{bail, ensure, Result};

use crate::frame::{convert_frame, PcmData, PcmFrame};
use crate::profile::{PcmSpec, SampleFormat};

enum FifoData {
    I16(VecDeque<i16>),
    F32(VecDeque<f32>),
    F32Planar(Vec<VecDeque<f32>>),
}

impl FifoData {
    fn empty(spec: PcmSpec) -> Self {
        match spec.format {
            SampleFormat::S16 => FifoData::I16(VecDeque::new()),
            SampleFormat::F32 => FifoData::F32(VecDeque::new()),
            SampleFormat::F32Planar => {
                FifoData::F32Planar(vec![VecDeque::new(); spec.channels])
            }
        }
    }
}

pub struct FrameBuffer {
    spec: PcmSpec,
    data: FifoData,
}

impl FrameBuffer {
    pub fn new(spec: PcmSpec) -> Self {
        Self {
            spec,
            data: FifoData::empty(spec),
        }
    }

    pub fn spec(&self) -> PcmSpec {
        self.spec
    }

    /// Buffered frames (samples per channel). Exact.
    pub fn len(&self) -> usize {
        match &self.data {
            FifoData::I16(q) => q.len() / self.spec.channels.max(1),
            FifoData::F32(q) => q.len() / self.spec.channels.max(1),
            FifoData::F32Planar(planes) => planes.first().map(|p| p.len()).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        self.data = FifoData::empty(self.spec);
    }

    /// Append all samples of `frame`. The frame must match the buffer tag.
    pub fn write(&mut self, frame: &PcmFrame) -> Result<()> {
        ensure!(
            frame.format() == self.spec.format && frame.channels() == self.spec.channels,
            "frame shape {:?}/{}ch does not match buffer tag {:?}/{}ch",
            frame.format(),
            frame.channels(),
            self.spec.format,
            self.spec.channels
        );
        match (&mut self.data, frame.data()) {
            (FifoData::I16(q), PcmData::I16(s)) => q.extend(s.iter().copied()),
            (FifoData::F32(q), PcmData::F32(s)) => q.extend(s.iter().copied()),
            (FifoData::F32Planar(planes), PcmData::F32Planar(src)) => {
                for (plane, channel) in planes.iter_mut().zip(src) {
                    plane.extend(channel.iter().copied());
                }
            }
            _ => bail!("frame storage does not match buffer tag"),
        }
        Ok(())
    }

    /// Remove and return exactly `frames` frames, or fail leaving the buffer
    /// untouched.
    pub fn read(&mut self, frames: usize) -> Result<PcmFrame> {
        ensure!(
            frames <= self.len(),
            "requested {} frames but only {} buffered",
            frames,
            self.len()
        );
        let ch = self.spec.channels;
        let frame = match &mut self.data {
            FifoData::I16(q) => {
                let samples: Vec<i16> = q.drain(..frames * ch).collect();
                PcmFrame::from_i16(self.spec.sample_rate, ch, samples)
            }
            FifoData::F32(q) => {
                let samples: Vec<f32> = q.drain(..frames * ch).collect();
                PcmFrame::from_f32(self.spec.sample_rate, ch, samples)
            }
            FifoData::F32Planar(planes) => {
                let channels: Vec<Vec<f32>> = planes
                    .iter_mut()
                    .map(|p| p.drain(..frames).collect())
                    .collect();
                PcmFrame::from_planar_f32(self.spec.sample_rate, channels)
            }
        };
        Ok(frame)
    }

    /// Copy out the first `frames` frames without consuming them.
    pub fn peek(&self, frames: usize) -> Result<PcmFrame> {
        ensure!(
            frames <= self.len(),
            "requested {} frames but only {} buffered",
            frames,
            self.len()
        );
        let ch = self.spec.channels;
        let frame = match &self.data {
            FifoData::I16(q) => {
                let samples: Vec<i16> = q.iter().take(frames * ch).copied().collect();
                PcmFrame::from_i16(self.spec.sample_rate, ch, samples)
            }
            FifoData::F32(q) => {
                let samples: Vec<f32> = q.iter().take(frames * ch).copied().collect();
                PcmFrame::from_f32(self.spec.sample_rate, ch, samples)
            }
            FifoData::F32Planar(planes) => {
                let channels: Vec<Vec<f32>> = planes
                    .iter()
                    .map(|p| p.iter().take(frames).copied().collect())
                    .collect();
                PcmFrame::from_planar_f32(self.spec.sample_rate, channels)
            }
        };
        Ok(frame)
    }

    /// Re-tag the buffer to a new same-rate shape.
    ///
    /// Empty buffers just swap storage. Non-empty buffers drain their
    /// contents through a same-rate conversion so no samples are dropped
    /// (entering or leaving a crossfade mid-buffer).
    pub fn retag(&mut self, spec: PcmSpec) -> Result<()> {
        ensure!(
            spec.sample_rate == self.spec.sample_rate,
            "retag cannot change the sample rate ({} -> {})",
            self.spec.sample_rate,
            spec.sample_rate
        );
        if spec == self.spec {
            return Ok(());
        }
        if self.is_empty() {
            self.spec = spec;
            self.data = FifoData::empty(spec);
            return Ok(());
        }
        let buffered = self.read(self.len())?;
        let converted = convert_frame(&buffered, spec)?;
        self.spec = spec;
        self.data = FifoData::empty(spec);
        self.write(&converted)
    }
}
