//! `SourceDecoder`: demux + decode of one source URL into raw PCM frames.
//!
//! Uses Symphonia to probe the container, select the default audio track, and
//! decode packets into interleaved `f32`. Unlike a free-running decode
//! thread, this decoder is pulled one frame at a time: the engine's pacing
//! clock sets the cadence, so nothing here runs ahead of the pipeline.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::frame::PcmFrame;
use crate::profile::{PcmSpec, SampleFormat};

/// One pull from the decoder.
pub enum Pull {
    /// A decoded block of interleaved `f32` at the source spec.
    Frame(PcmFrame),
    /// Nothing this time (skipped packet, recoverable decode error); pull again.
    Retry,
    /// The source has no more packets.
    Eof,
}

pub struct SourceDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    spec: PcmSpec,
}

impl SourceDecoder {
    /// Open `url` and prepare its best audio stream for decoding.
    ///
    /// Only locally readable paths are supported (a `file://` prefix is
    /// stripped). `format_hint` overrides extension-based probing. The
    /// option map is accepted for forward compatibility and passed over
    /// opaquely; no keys are currently interpreted.
    pub fn open(
        url: &str,
        format_hint: Option<&str>,
        _options: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let file = File::open(path).with_context(|| format!("open source {path:?}"))?;

        let mut hint = Hint::new();
        if let Some(fmt) = format_hint {
            hint.with_extension(fmt);
        } else if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .with_context(|| format!("probe source {path:?}"))?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("no default audio track in {path:?}"))?;

        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| anyhow!("source does not declare a channel layout"))?
            .count();
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("source does not declare a sample rate"))?;
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .context("open audio decoder")?;

        Ok(Self {
            format,
            decoder,
            track_id,
            spec: PcmSpec {
                sample_rate,
                format: SampleFormat::F32,
                channels,
            },
        })
    }

    /// The spec frames from this decoder arrive in.
    pub fn spec(&self) -> PcmSpec {
        self.spec
    }

    /// Pull the next decoded frame.
    ///
    /// Packets for other tracks and packets the codec rejects surface as
    /// `Pull::Retry`; clean end of stream as `Pull::Eof`. Anything else is a
    /// fatal decoder error.
    pub fn pull(&mut self) -> Result<Pull> {
        let packet = match self.format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                return Ok(Pull::Eof);
            }
            Err(e) => return Err(anyhow::Error::new(e).context("read packet")),
        };

        if packet.track_id() != self.track_id {
            return Ok(Pull::Retry);
        }

        let decoded = match self.decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("skipping undecodable packet: {e}");
                return Ok(Pull::Retry);
            }
            Err(e) => return Err(anyhow::Error::new(e).context("decode packet")),
        };

        if decoded.frames() == 0 {
            return Ok(Pull::Retry);
        }

        let decoded_spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, decoded_spec);
        sample_buf.copy_interleaved_ref(decoded);

        Ok(Pull::Frame(PcmFrame::from_f32(
            decoded_spec.rate,
            decoded_spec.channels.count(),
            sample_buf.samples().to_vec(),
        )))
    }
}
