//! Broadcast sinks.
//!
//! The engine only knows the [`AudioSink`] trait: frames arrive already in
//! the `OutputProfile` shape, and `finish` is called exactly once at
//! shutdown. Two implementations are provided: a WAV file writer and local
//! device playback through CPAL fed by a bounded queue.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use hound::{WavSpec, WavWriter};

use crate::frame::{PcmData, PcmFrame};
use crate::profile::{OutputProfile, SampleFormat};

pub trait AudioSink: Send {
    fn profile(&self) -> OutputProfile;

    /// Encode/write one profile-shaped frame. Expected to return well within
    /// one loop interval so the audio thread is never stalled.
    fn write_frame(&mut self, frame: &PcmFrame) -> Result<()>;

    /// Flush and close the output. Idempotent.
    fn finish(&mut self) -> Result<()>;
}

fn check_shape(profile: &OutputProfile, frame: &PcmFrame) -> Result<()> {
    let spec = profile.spec();
    if frame.spec() != spec {
        bail!(
            "sink expects {:?}, got {:?}",
            spec,
            frame.spec()
        );
    }
    Ok(())
}

// ── WAV file sink ────────────────────────────────────────────────────────

/// Writes the outbound stream to a RIFF/WAV file.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    profile: OutputProfile,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(path: P, profile: OutputProfile) -> Result<Self> {
        let spec = match profile.sample_format {
            SampleFormat::S16 => WavSpec {
                channels: profile.channel_layout.count() as u16,
                sample_rate: profile.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
            SampleFormat::F32 | SampleFormat::F32Planar => WavSpec {
                channels: profile.channel_layout.count() as u16,
                sample_rate: profile.sample_rate,
                bits_per_sample: 32,
                sample_format: hound::SampleFormat::Float,
            },
        };
        let writer = WavWriter::create(path.as_ref(), spec)
            .with_context(|| format!("create wav output {:?}", path.as_ref()))?;
        Ok(Self {
            writer: Some(writer),
            profile,
        })
    }
}

impl AudioSink for WavSink {
    fn profile(&self) -> OutputProfile {
        self.profile
    }

    fn write_frame(&mut self, frame: &PcmFrame) -> Result<()> {
        check_shape(&self.profile, frame)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("wav sink already finished"))?;
        match frame.data() {
            PcmData::I16(samples) => {
                for &s in samples {
                    writer.write_sample(s)?;
                }
            }
            PcmData::F32(samples) => {
                for &s in samples {
                    writer.write_sample(s)?;
                }
            }
            PcmData::F32Planar(planes) => {
                // WAV is interleaved on disk.
                for i in 0..frame.frames() {
                    for plane in planes {
                        writer.write_sample(plane[i])?;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("finalize wav output")?;
        }
        Ok(())
    }
}

// ── Device sink ──────────────────────────────────────────────────────────

/// Bounded interleaved-`f32` queue between the audio thread and the device
/// callback. Pushes block when full; the callback pops without blocking and
/// fills underruns with silence.
struct SinkQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_samples: usize,
}

struct QueueInner {
    queue: VecDeque<f32>,
    done: bool,
}

impl SinkQueue {
    fn new(max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
            max_samples,
        }
    }

    fn push_blocking(&self, samples: &[f32]) {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();
            while g.queue.len() >= self.max_samples && !g.done {
                g = self.cv.wait(g).unwrap();
            }
            if g.done {
                return;
            }
            while offset < samples.len() && g.queue.len() < self.max_samples {
                g.queue.push_back(samples[offset]);
                offset += 1;
            }
            drop(g);
            self.cv.notify_all();
        }
    }

    /// Pop up to `out.len()` samples into `out`, zero-filling the rest.
    /// Never blocks; safe for the device callback.
    fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut g = match self.inner.try_lock() {
            Ok(g) => g,
            Err(_) => {
                out.fill(0.0);
                return 0;
            }
        };
        let take = out.len().min(g.queue.len());
        for slot in out.iter_mut().take(take) {
            *slot = g.queue.pop_front().unwrap_or(0.0);
        }
        drop(g);
        self.cv.notify_all();
        out[take..].fill(0.0);
        take
    }

    fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Wait until the queue is closed and drained, up to `timeout`.
    fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.done && g.queue.is_empty() {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }
    }
}

/// Plays the outbound stream on a local output device.
///
/// The CPAL stream lives on a dedicated worker thread (it is not `Send`),
/// which parks until the queue is closed and drained.
pub struct DeviceSink {
    profile: OutputProfile,
    queue: Arc<SinkQueue>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DeviceSink {
    /// Open the default output device, or the first whose name contains
    /// `needle` (case-insensitive).
    pub fn open(needle: Option<&str>, profile: OutputProfile) -> Result<Self> {
        // Two seconds of buffered audio absorbs the pacing lead.
        let max_samples = profile.sample_rate as usize * profile.channel_layout.count() * 2;
        let queue = Arc::new(SinkQueue::new(max_samples));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let queue_for_worker = queue.clone();
        let needle = needle.map(str::to_owned);
        let worker = thread::spawn(move || {
            device_worker(needle.as_deref(), profile, queue_for_worker, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                profile,
                queue,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(anyhow!("device worker exited before reporting readiness"))
            }
        }
    }
}

impl AudioSink for DeviceSink {
    fn profile(&self) -> OutputProfile {
        self.profile
    }

    fn write_frame(&mut self, frame: &PcmFrame) -> Result<()> {
        check_shape(&self.profile, frame)?;
        if self.queue.is_done() {
            bail!("device sink already finished");
        }
        self.queue.push_blocking(&frame.to_interleaved_f32());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.queue.close();
        if !self.queue.wait_drained(Duration::from_secs(5)) {
            tracing::warn!("device sink did not drain before shutdown");
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn device_worker(
    needle: Option<&str>,
    profile: OutputProfile,
    queue: Arc<SinkQueue>,
    ready_tx: mpsc::Sender<Result<()>>,
) {
    let stream = match build_device_stream(needle, profile, queue.clone()) {
        Ok(s) => {
            let _ = ready_tx.send(Ok(()));
            s
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        tracing::error!("device stream start failed: {e}");
        queue.close();
        return;
    }

    // Keep the stream alive until everything queued has been played out.
    while !queue.wait_drained(Duration::from_secs(60)) {}
    drop(stream);
}

fn build_device_stream(
    needle: Option<&str>,
    profile: OutputProfile,
    queue: Arc<SinkQueue>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = pick_device(&host, needle)?;
    tracing::info!(device = %device.name()?, "output device");

    let config = pick_output_config(&device, profile.sample_rate)?;
    let stream_config: cpal::StreamConfig = config.clone().into();
    tracing::info!(
        rate_hz = stream_config.sample_rate.0,
        channels = stream_config.channels,
        "device output config"
    );

    let src_channels = profile.channel_layout.count();
    let dst_channels = stream_config.channels as usize;
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(
            &device,
            &stream_config,
            queue,
            src_channels,
            dst_channels,
            err_fn,
        )?,
        cpal::SampleFormat::I16 => build_stream::<i16>(
            &device,
            &stream_config,
            queue,
            src_channels,
            dst_channels,
            err_fn,
        )?,
        cpal::SampleFormat::I32 => build_stream::<i32>(
            &device,
            &stream_config,
            queue,
            src_channels,
            dst_channels,
            err_fn,
        )?,
        cpal::SampleFormat::U16 => build_stream::<u16>(
            &device,
            &stream_config,
            queue,
            src_channels,
            dst_channels,
            err_fn,
        )?,
        other => bail!("unsupported device sample format: {other:?}"),
    };
    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<SinkQueue>,
    src_channels: usize,
    dst_channels: usize,
    err_fn: fn(cpal::StreamError),
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / dst_channels;
            scratch.resize(frames * src_channels, 0.0);
            queue.pop_into(&mut scratch);

            for frame in 0..frames {
                let base = frame * src_channels;
                for ch in 0..dst_channels {
                    let v = match (src_channels, dst_channels) {
                        (1, _) => scratch[base],
                        (2, 1) => 0.5 * (scratch[base] + scratch[base + 1]),
                        _ => scratch[base + ch.min(src_channels - 1)],
                    };
                    data[frame * dst_channels + ch] =
                        <T as cpal::Sample>::from_sample::<f32>(v);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("no output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.name()
                .ok()
                .map(|n| n.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("no output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))
}

/// Choose an output config at the profile rate when the device supports it,
/// falling back to the device default otherwise.
fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    for range in &ranges {
        if range.min_sample_rate() <= cpal::SampleRate(target_rate)
            && cpal::SampleRate(target_rate) <= range.max_sample_rate()
        {
            return Ok(range.with_sample_rate(cpal::SampleRate(target_rate)));
        }
    }
    device
        .default_output_config()
        .context("no supported output configs")
}

// ── Test support ─────────────────────────────────────────────────────────
