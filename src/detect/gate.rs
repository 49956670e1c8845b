use std::time::{Duration, Instant};

use super::differencer::{MotionRegion, MotionScore};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

/// Capture decision for one frame.
///
/// True iff there is at least one motion region and either nothing has been
/// captured yet or strictly more than `cooldown` has passed since the last capture.
pub fn should_capture(
    regions: &[MotionRegion],
    now: Instant,
    last_capture: Option<Instant>,
    cooldown: Duration,
) -> bool {
    if regions.is_empty() {
        return false;
    }
    match last_capture {
        None => true,
        Some(last) => now.saturating_duration_since(last) > cooldown,
    }
}

/// Cooldown bookkeeping around [`should_capture`].
///
/// `check` never mutates; the owner calls `record` once it actually acts on a
/// positive decision.
#[derive(Clone, Debug)]
pub struct MotionGate {
    cooldown: Duration,
    last_capture: Option<Instant>,
}

impl MotionGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_capture: None,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn last_capture(&self) -> Option<Instant> {
        self.last_capture
    }

    pub fn check(&self, score: &MotionScore, now: Instant) -> bool {
        should_capture(score.regions(), now, self.last_capture, self.cooldown)
    }

    pub fn record(&mut self, now: Instant) {
        self.last_capture = Some(now);
    }
}

impl Default for MotionGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
