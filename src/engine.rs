//! The audio-thread state machine: normal streaming, crossfade, shutdown.
//!
//! Policy: recover locally, escalate to source replacement, never stop the
//! outbound stream while `stop` is false. A synthesized source is always a
//! valid substitute for a failed one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::input::{InputStream, StreamError};
use crate::profile::SynthMode;
use crate::sink::AudioSink;

/// Process-wide control block shared by the audio and control threads.
///
/// `stop` requests shutdown; clearing `normal_streaming` requests a crossfade
/// to whatever sits in the staged slot. Writers release, readers acquire, so
/// a flag written by the control thread is observed no later than the next
/// loop iteration.
pub struct ControlFlags {
    stop: AtomicBool,
    normal_streaming: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            normal_streaming: AtomicBool::new(true),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn set_normal_streaming(&self, value: bool) {
        self.normal_streaming.store(value, Ordering::Release);
    }

    pub fn normal_streaming(&self) -> bool {
        self.normal_streaming.load(Ordering::Acquire)
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// The staged incoming source, written by the control thread and consumed by
/// the audio thread. A leaf lock: nothing else is acquired while held.
pub type StagedSource = Mutex<Option<InputStream>>;

/// Drive the pipeline until `stop`. Owns the current source; the staged slot
/// only ever holds the incoming one.
pub fn run_audio(
    mut source: InputStream,
    staged: &StagedSource,
    sink: &mut dyn AudioSink,
    flags: &ControlFlags,
    fade_ms: i64,
) {
    let mut deadline = Instant::now();

    while !flags.should_stop() {
        if flags.normal_streaming() {
            continue_streaming(&mut source, sink, &mut deadline, flags);
        } else {
            let incoming = staged.lock().unwrap().take();
            if let Some(incoming) = incoming {
                source = crossfade(source, incoming, sink, &mut deadline, flags, fade_ms);
            }
            flags.set_normal_streaming(true);
        }
    }

    if let Err(e) = sink.finish() {
        tracing::error!("sink finish failed: {e:#}");
    }
}

/// Pull frames from one source and hand them to the sink until a crossfade is
/// armed or shutdown is requested. Source failures swap in the synthesized
/// fallback in place.
fn continue_streaming(
    source: &mut InputStream,
    sink: &mut dyn AudioSink,
    deadline: &mut Instant,
    flags: &ControlFlags,
) {
    while flags.normal_streaming() && !flags.should_stop() {
        match source.get_one_output_frame() {
            Ok(()) => {
                if let Err(e) = sink.write_frame(source.current_frame()) {
                    // A dropped frame beats a stopped stream.
                    tracing::warn!("sink refused frame: {e:#}");
                }
                source.sleep(deadline);
            }
            Err(err) => {
                match &err {
                    StreamError::EndOfSource => {
                        tracing::info!(url = source.url(), "source ended, switching to fallback")
                    }
                    StreamError::Fatal(_) => {
                        tracing::warn!(url = source.url(), error = %err, "source failed, switching to fallback")
                    }
                }
                match InputStream::synthetic(
                    source.profile(),
                    source.timing_mode(),
                    source.fallback_mode(),
                ) {
                    Ok(replacement) => *source = replacement,
                    Err(e) => {
                        // No source left to produce anything; shut down.
                        tracing::error!("fallback source construction failed: {e:#}");
                        flags.request_stop();
                        return;
                    }
                }
            }
        }
    }
}

/// Fade `outgoing` into `incoming` over `fade_ms` and return the winner.
///
/// Any failure before the fade starts keeps `outgoing`. Incoming failures
/// mid-fade abort back to `outgoing`. Outgoing failures mid-fade are replaced
/// with silence and the fade continues, so listeners hear the incoming source
/// rise against quiet. `stop` exits at the next frame boundary, handing the
/// incoming source back as current for the shutdown path.
fn crossfade(
    mut outgoing: InputStream,
    mut incoming: InputStream,
    sink: &mut dyn AudioSink,
    deadline: &mut Instant,
    flags: &ControlFlags,
    fade_ms: i64,
) -> InputStream {
    let total = fade_ms.max(1);
    let mut remaining = total;

    let init = outgoing
        .init_crossfade()
        .and_then(|_| incoming.init_crossfade());
    if let Err(e) = init {
        tracing::warn!("crossfade init failed: {e:#}; keeping current source");
        if let Err(e) = outgoing.end_crossfade() {
            tracing::error!("crossfade teardown failed: {e:#}");
        }
        return outgoing;
    }

    while remaining > 0 && !flags.should_stop() {
        if let Err(err) = incoming.get_one_output_frame() {
            tracing::warn!(
                url = incoming.url(),
                error = %err,
                "incoming source failed, aborting crossfade"
            );
            if let Err(e) = outgoing.end_crossfade() {
                tracing::error!("crossfade teardown failed: {e:#}");
            }
            return outgoing;
        }

        if let Err(err) =
            outgoing.crossfade_frame(incoming.current_frame(), &mut remaining, total)
        {
            tracing::warn!(
                url = outgoing.url(),
                error = %err,
                "outgoing source failed, fading against silence"
            );
            match silent_replacement(&outgoing) {
                Ok(replacement) => {
                    outgoing = replacement;
                    continue;
                }
                Err(e) => {
                    tracing::error!("silence replacement failed: {e:#}; adopting incoming source");
                    if let Err(e) = incoming.end_crossfade() {
                        tracing::error!("crossfade teardown failed: {e:#}");
                    }
                    return incoming;
                }
            }
        }

        if let Err(e) = sink.write_frame(outgoing.current_frame()) {
            tracing::warn!("sink refused frame: {e:#}");
        }
        outgoing.sleep(deadline);
    }

    if let Err(e) = incoming.end_crossfade() {
        tracing::error!("crossfade teardown failed: {e:#}");
    }
    incoming
}

/// A silence stream already retargeted to the fade domain, ready to stand in
/// for a failed outgoing source mid-fade.
fn silent_replacement(failed: &InputStream) -> anyhow::Result<InputStream> {
    let mut replacement = InputStream::synthetic(
        failed.profile(),
        failed.timing_mode(),
        SynthMode::Silence,
    )?;
    replacement.init_crossfade()?;
    Ok(replacement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PcmData;
    use crate::profile::{ChannelLayout, OutputProfile, SampleFormat, TimingMode};
    use crate::sink::testing::MemorySink;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn profile() -> OutputProfile {
        OutputProfile {
            sample_rate: 48_000,
            channel_layout: ChannelLayout::Stereo,
            sample_format: SampleFormat::S16,
            frame_samples: 256,
        }
    }

    fn synthetic(mode: SynthMode) -> InputStream {
        InputStream::synthetic(profile(), TimingMode::Freetime, mode).unwrap()
    }

    #[test]
    fn flags_default_to_streaming() {
        let flags = ControlFlags::new();
        assert!(!flags.should_stop());
        assert!(flags.normal_streaming());
    }

    #[test]
    fn run_audio_streams_until_stopped_and_finishes_sink() {
        let flags = Arc::new(ControlFlags::new());
        let staged: Arc<StagedSource> = Arc::new(Mutex::new(None));
        let mut sink = MemorySink::new(profile());

        let flags_for_stop = flags.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flags_for_stop.request_stop();
        });

        run_audio(
            synthetic(SynthMode::WhiteNoise),
            &staged,
            &mut sink,
            &flags,
            1000,
        );
        stopper.join().unwrap();

        assert!(sink.finished);
        // Freetime mode: plenty of frames in 50 ms.
        assert!(sink.frames.len() > 10);
        assert!(sink
            .frames
            .iter()
            .all(|f| f.frames() == 256 && f.spec() == profile().spec()));
    }

    #[test]
    fn crossfade_returns_incoming_and_restores_profile_shape() {
        let flags = ControlFlags::new();
        let mut sink = MemorySink::new(profile());
        let mut deadline = Instant::now();

        let winner = crossfade(
            synthetic(SynthMode::Silence),
            synthetic(SynthMode::WhiteNoise),
            &mut sink,
            &mut deadline,
            &flags,
            100,
        );

        // The incoming stream won and is back in the profile shape.
        assert!(winner.is_synthetic());
        let mut winner = winner;
        winner.get_one_output_frame().unwrap();
        assert_eq!(winner.current_frame().spec(), profile().spec());

        // 100 ms of fade at ~5 ms per 256-sample frame.
        assert_eq!(sink.frames.len(), 20);
        assert!(!sink.finished);
    }

    #[test]
    fn crossfade_mixes_toward_the_incoming_signal() {
        let flags = ControlFlags::new();
        let mut sink = MemorySink::new(profile());
        let mut deadline = Instant::now();

        // Silence fading into white noise: output power must grow.
        crossfade(
            synthetic(SynthMode::Silence),
            synthetic(SynthMode::WhiteNoise),
            &mut sink,
            &mut deadline,
            &flags,
            200,
        );

        let rms = |frame: &crate::frame::PcmFrame| -> f64 {
            let samples = match frame.data() {
                PcmData::I16(s) => s,
                _ => panic!("expected s16 frames at the sink"),
            };
            (samples.iter().map(|&v| (v as f64).powi(2)).sum::<f64>()
                / samples.len() as f64)
                .sqrt()
        };

        let first = rms(&sink.frames[0]);
        let last = rms(sink.frames.last().unwrap());
        assert!(
            last > first,
            "fade did not rise: first rms {first}, last rms {last}"
        );
    }

    #[test]
    fn crossfade_stop_exits_at_a_frame_boundary() {
        let flags = ControlFlags::new();
        flags.request_stop();
        let mut sink = MemorySink::new(profile());
        let mut deadline = Instant::now();

        let winner = crossfade(
            synthetic(SynthMode::Silence),
            synthetic(SynthMode::WhiteNoise),
            &mut sink,
            &mut deadline,
            &flags,
            5000,
        );

        // Stopped before any frame was mixed; the incoming source is adopted
        // so shutdown proceeds from a consistent state.
        assert!(sink.frames.is_empty());
        assert!(winner.is_synthetic());
    }

    #[test]
    fn armed_source_is_adopted_after_the_fade() {
        let flags = Arc::new(ControlFlags::new());
        let staged: Arc<StagedSource> = Arc::new(Mutex::new(None));
        let mut sink = MemorySink::new(profile());

        // Arm an incoming source, then let the engine fade and stop.
        *staged.lock().unwrap() = Some(synthetic(SynthMode::WhiteNoise));
        flags.set_normal_streaming(false);

        let flags_for_stop = flags.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            flags_for_stop.request_stop();
        });

        run_audio(synthetic(SynthMode::Silence), &staged, &mut sink, &flags, 50);
        stopper.join().unwrap();

        assert!(staged.lock().unwrap().is_none());
        assert!(flags.normal_streaming());
        assert!(sink.finished);
        assert!(!sink.frames.is_empty());
    }

    #[test]
    fn liveness_under_continuous_source_failure() {
        // A bound stream whose file disappears after open is hard to stage;
        // instead, exercise the substitution path by streaming a source that
        // immediately reports end-of-source.
        let path = crate::decode::tests::write_test_wav("engine-live.wav", 48_000, 64);
        let source = InputStream::open(
            path.to_str().unwrap(),
            None,
            &std::collections::BTreeMap::new(),
            profile(),
            TimingMode::Freetime,
            SynthMode::WhiteNoise,
        )
        .unwrap();

        let flags = Arc::new(ControlFlags::new());
        let staged: Arc<StagedSource> = Arc::new(Mutex::new(None));
        let mut sink = MemorySink::new(profile());

        let flags_for_stop = flags.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flags_for_stop.request_stop();
        });

        run_audio(source, &staged, &mut sink, &flags, 1000);
        stopper.join().unwrap();

        // The 64-frame source could not fill a single 256-sample frame; the
        // engine substituted the fallback and kept emitting regardless.
        assert!(!sink.frames.is_empty());
        let _ = std::fs::remove_file(path);
    }
}
