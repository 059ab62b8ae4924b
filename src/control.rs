//! The operator control surface: newline-delimited commands on stdin.
//!
//! Commands:
//! - `kill`: request shutdown
//! - `list-sources`: print configured sources
//! - `add-source <name> <url>`: add to the store and persist
//! - `remove-source <name>`: remove from the store and persist
//! - `switch <name-or-url>`: arm an incoming source for a crossfade

use std::io::BufRead;
use std::path::Path;

use crate::config::{ConfigStore, SourceSpec};
use crate::engine::{ControlFlags, StagedSource};
use crate::input::InputStream;
use crate::profile::{OutputProfile, SynthMode, TimingMode};

pub struct ControlContext<'a> {
    pub config_path: &'a Path,
    pub profile: OutputProfile,
    pub timing: TimingMode,
    pub fallback: SynthMode,
}

/// Read commands from `input` until `kill`, EOF, or a read error.
///
/// On EOF the daemon keeps streaming; only `kill` (or a signal) stops it.
pub fn run_control<R: BufRead>(
    input: R,
    flags: &ControlFlags,
    staged: &StagedSource,
    ctx: &ControlContext<'_>,
) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("control input error: {e}");
                break;
            }
        };

        handle_command(&line, flags, staged, ctx);

        if flags.should_stop() {
            break;
        }
    }
}

fn handle_command(
    line: &str,
    flags: &ControlFlags,
    staged: &StagedSource,
    ctx: &ControlContext<'_>,
) {
    let mut parts = line.split_whitespace();
    match parts.next() {
        None => {}
        Some("kill") => {
            tracing::info!("shutdown requested");
            flags.request_stop();
        }
        Some("list-sources") => match ConfigStore::load_or_default(ctx.config_path) {
            Ok(store) => {
                if store.is_empty() {
                    println!("no sources configured");
                }
                for (name, spec) in store.iter() {
                    println!("{name} : {}", spec.url);
                }
            }
            Err(e) => tracing::warn!("cannot read source store: {e:#}"),
        },
        Some("add-source") => {
            let (Some(name), Some(url)) = (parts.next(), parts.next()) else {
                tracing::warn!("usage: add-source <name> <url>");
                return;
            };
            match ConfigStore::load_or_default(ctx.config_path) {
                Ok(mut store) => {
                    store.insert(name, SourceSpec::from_url(url));
                    match store.save(ctx.config_path) {
                        Ok(()) => tracing::info!(name, url, "source added"),
                        Err(e) => tracing::warn!("cannot persist source store: {e:#}"),
                    }
                }
                Err(e) => tracing::warn!("cannot read source store: {e:#}"),
            }
        }
        Some("remove-source") => {
            let Some(name) = parts.next() else {
                tracing::warn!("usage: remove-source <name>");
                return;
            };
            match ConfigStore::load_or_default(ctx.config_path) {
                Ok(mut store) => {
                    if !store.remove(name) {
                        tracing::warn!(name, "no such source");
                        return;
                    }
                    match store.save(ctx.config_path) {
                        Ok(()) => tracing::info!(name, "source removed"),
                        Err(e) => tracing::warn!("cannot persist source store: {e:#}"),
                    }
                }
                Err(e) => tracing::warn!("cannot read source store: {e:#}"),
            }
        }
        Some("switch") => {
            let Some(target) = parts.next() else {
                tracing::warn!("usage: switch <name-or-url>");
                return;
            };
            arm_source(target, flags, staged, ctx);
        }
        Some(other) => tracing::warn!(command = other, "unknown command"),
    }
}

/// Resolve `target` against the store (falling back to a literal URL), build
/// the incoming stream, and arm it. On failure the current source keeps
/// playing untouched.
fn arm_source(
    target: &str,
    flags: &ControlFlags,
    staged: &StagedSource,
    ctx: &ControlContext<'_>,
) {
    let spec = match ConfigStore::load_or_default(ctx.config_path) {
        Ok(store) => store
            .get(target)
            .cloned()
            .unwrap_or_else(|| SourceSpec::from_url(target)),
        Err(e) => {
            tracing::warn!("cannot read source store: {e:#}");
            SourceSpec::from_url(target)
        }
    };

    match InputStream::open(
        &spec.url,
        spec.format.as_deref(),
        &spec.options,
        ctx.profile,
        ctx.timing,
        ctx.fallback,
    ) {
        Ok(stream) => {
            *staged.lock().unwrap() = Some(stream);
            flags.set_normal_streaming(false);
            tracing::info!(url = %spec.url, "incoming source armed");
        }
        Err(e) => {
            tracing::warn!(url = %spec.url, "cannot open incoming source: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ChannelLayout, SampleFormat};
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn temp_config(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fondue-test-{}-{}", std::process::id(), name))
    }

    fn ctx(config_path: &Path) -> ControlContext<'_> {
        ControlContext {
            config_path,
            profile: OutputProfile {
                sample_rate: 48_000,
                channel_layout: ChannelLayout::Stereo,
                sample_format: SampleFormat::S16,
                frame_samples: 256,
            },
            timing: TimingMode::Freetime,
            fallback: SynthMode::WhiteNoise,
        }
    }

    #[test]
    fn kill_sets_the_stop_flag_and_ends_the_loop() {
        let path = temp_config("control-kill.json");
        let flags = ControlFlags::new();
        let staged: StagedSource = Mutex::new(None);

        run_control(
            Cursor::new("kill\nlist-sources\n"),
            &flags,
            &staged,
            &ctx(&path),
        );
        assert!(flags.should_stop());
    }

    #[test]
    fn add_and_remove_source_persist() {
        let path = temp_config("control-add.json");
        let flags = ControlFlags::new();
        let staged: StagedSource = Mutex::new(None);

        run_control(
            Cursor::new("add-source jazz /srv/audio/jazz.flac\n"),
            &flags,
            &staged,
            &ctx(&path),
        );
        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.get("jazz").unwrap().url, "/srv/audio/jazz.flac");

        run_control(
            Cursor::new("remove-source jazz\n"),
            &flags,
            &staged,
            &ctx(&path),
        );
        let store = ConfigStore::load(&path).unwrap();
        assert!(store.get("jazz").is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn switch_to_a_readable_source_arms_it() {
        let wav = crate::decode::tests::write_test_wav("control-switch.wav", 48_000, 4800);
        let path = temp_config("control-switch.json");
        let flags = ControlFlags::new();
        let staged: StagedSource = Mutex::new(None);

        run_control(
            Cursor::new(format!("switch {}\n", wav.display())),
            &flags,
            &staged,
            &ctx(&path),
        );

        assert!(!flags.normal_streaming());
        assert!(staged.lock().unwrap().is_some());
        let _ = std::fs::remove_file(wav);
    }

    #[test]
    fn switch_to_a_missing_source_keeps_streaming() {
        let path = temp_config("control-miss.json");
        let flags = ControlFlags::new();
        let staged: StagedSource = Mutex::new(None);

        run_control(
            Cursor::new("switch /nonexistent/source.flac\n"),
            &flags,
            &staged,
            &ctx(&path),
        );

        assert!(flags.normal_streaming());
        assert!(staged.lock().unwrap().is_none());
    }

    #[test]
    fn unknown_and_blank_commands_are_ignored() {
        let path = temp_config("control-unknown.json");
        let flags = ControlFlags::new();
        let staged: StagedSource = Mutex::new(None);

        run_control(
            Cursor::new("\nbogus command\n"),
            &flags,
            &staged,
            &ctx(&path),
        );
        assert!(!flags.should_stop());
        assert!(flags.normal_streaming());
    }
}
