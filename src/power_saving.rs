//! Duplicate-frame suppression for static screen content
//!
//! Once nothing on screen has changed for longer than the threshold, frames
//! stop being forwarded. The first real change afterwards asks the consumer
//! to switch the LEDs back on before it sends the frame.

use std::time::{Duration, Instant};

use ambilume_transport::Frame;

/// Frames differing in at most this many LEDs count as duplicates
pub const DUPLICATE_TOLERANCE: usize = 2;

/// Default idle time before power saving engages
pub const DEFAULT_THRESHOLD_SECS: u64 = 60;

/// What the consumer should do with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerDecision {
    Send,
    Suppress,
    /// Re-send the "on" state, then the frame
    Resume,
}

#[derive(Debug, Clone)]
pub struct PowerSavingMonitor {
    enabled: bool,
    threshold: Duration,
    last_frame: Option<Frame>,
    last_activity: Option<Instant>,
    engaged: bool,
}

impl PowerSavingMonitor {
    pub fn new(enabled: bool, threshold: Duration) -> Self {
        Self {
            enabled,
            threshold,
            last_frame: None,
            last_activity: None,
            engaged: false,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::from_secs(DEFAULT_THRESHOLD_SECS))
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn reset(&mut self) {
        self.last_frame = None;
        self.last_activity = None;
        self.engaged = false;
    }

    pub fn observe(&mut self, frame: &Frame) -> PowerDecision {
        self.observe_at(frame, Instant::now())
    }

    pub fn observe_at(&mut self, frame: &Frame, now: Instant) -> PowerDecision {
        if !self.enabled {
            return PowerDecision::Send;
        }

        let duplicate = self
            .last_frame
            .as_ref()
            .is_some_and(|last| last.differing_leds(frame) <= DUPLICATE_TOLERANCE);
        if !duplicate {
            self.last_frame = Some(frame.clone());
        }

        if !duplicate && !frame.is_black() {
            self.last_activity = Some(now);
            if self.engaged {
                self.engaged = false;
                return PowerDecision::Resume;
            }
            return PowerDecision::Send;
        }

        let since = *self.last_activity.get_or_insert(now);
        if now.saturating_duration_since(since) > self.threshold {
            self.engaged = true;
        }
        if self.engaged {
            PowerDecision::Suppress
        } else {
            PowerDecision::Send
        }
    }
}
