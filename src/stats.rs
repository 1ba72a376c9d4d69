//! Pipeline counters shared by the producers and the consumer

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Log the first occurrence and every 100th after it.
pub fn should_log(count: u64) -> bool {
    count == 1 || count % 100 == 0
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_captured: u64,
    /// Offered while the queue was full
    pub frames_dropped: u64,
    pub frames_sent: u64,
    pub frames_suppressed: u64,
    pub send_errors: u64,
    pub capture_errors: u64,
    pub power_saving: bool,
}

#[derive(Debug, Default)]
pub struct Counters {
    captured: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    suppressed: AtomicU64,
    send_errors: AtomicU64,
    capture_errors: AtomicU64,
    power_saving: AtomicBool,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

impl Counters {
    pub fn captured(&self) -> u64 {
        bump(&self.captured)
    }

    pub fn dropped(&self) -> u64 {
        bump(&self.dropped)
    }

    pub fn sent(&self) -> u64 {
        bump(&self.sent)
    }

    pub fn suppressed(&self) -> u64 {
        bump(&self.suppressed)
    }

    pub fn send_error(&self) -> u64 {
        bump(&self.send_errors)
    }

    pub fn capture_error(&self) -> u64 {
        bump(&self.capture_errors)
    }

    pub fn set_power_saving(&self, engaged: bool) {
        self.power_saving.store(engaged, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.captured.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_sent: self.sent.load(Ordering::Relaxed),
            frames_suppressed: self.suppressed.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            power_saving: self.power_saving.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.captured,
            &self.dropped,
            &self.sent,
            &self.suppressed,
            &self.send_errors,
            &self.capture_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.power_saving.store(false, Ordering::Relaxed);
    }
}
