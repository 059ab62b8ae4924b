//! `PacingClock` keeps the output loop aligned to (slightly ahead of)
//! wall-clock time.
//!
//! The deadline is monotonic and owned by the caller; the clock only knows
//! how far to advance it per frame. Running a little fast is deliberate: the
//! sink's buffer absorbs the surplus, while running slow would be audible.

use std::thread;
use std::time::{Duration, Instant};

use crate::profile::{OutputProfile, TimingMode};

#[derive(Clone, Copy, Debug)]
pub struct PacingClock {
    loop_duration: Duration,
    mode: TimingMode,
}

impl PacingClock {
    pub fn new(profile: &OutputProfile, mode: TimingMode) -> Self {
        Self {
            loop_duration: profile.loop_duration(),
            mode,
        }
    }

    pub fn loop_duration(&self) -> Duration {
        self.loop_duration
    }

    pub fn mode(&self) -> TimingMode {
        self.mode
    }

    /// Advance `deadline` by one loop interval and sleep until it.
    ///
    /// In `Freetime` mode the deadline is reset to now and the call returns
    /// immediately. A deadline already in the past (a stall upstream) is not
    /// slept on; subsequent iterations catch back up one interval at a time.
    pub fn sleep(&self, deadline: &mut Instant) {
        match self.mode {
            TimingMode::Realtime => {
                *deadline += self.loop_duration;
                let now = Instant::now();
                if *deadline > now {
                    thread::sleep(*deadline - now);
                }
            }
            TimingMode::Freetime => {
                *deadline = Instant::now();
            }
        }
    }
}
