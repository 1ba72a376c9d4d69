//! Stream consumer: the only thread that sends frames to the transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ambilume_transport::{DeviceState, SharedTransport};
use tracing::{debug, info, warn};

use crate::frame_queue::FrameQueue;
use crate::power_saving::{PowerDecision, PowerSavingMonitor};
use crate::stats::{should_log, Counters};

/// How long one `take_timeout` waits before re-checking cancellation
const TAKE_TIMEOUT: Duration = Duration::from_millis(50);

pub struct Consumer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct Dispatch {
    queue: FrameQueue,
    transport: SharedTransport,
    monitor: PowerSavingMonitor,
    on_state: DeviceState,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
}

impl Consumer {
    pub fn spawn(
        queue: FrameQueue,
        transport: SharedTransport,
        monitor: PowerSavingMonitor,
        on_state: DeviceState,
        counters: Arc<Counters>,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let dispatch = Dispatch {
            queue,
            transport,
            monitor,
            on_state,
            counters,
            running: Arc::clone(&running),
        };
        let handle = thread::Builder::new()
            .name("pipeline-consumer".into())
            .spawn(move || dispatch.run())?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Signal the consumer and wait for it. A send already in flight
    /// completes first.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Consumer thread panicked");
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Dispatch {
    fn run(mut self) {
        debug!("Consumer started");
        while self.running.load(Ordering::Acquire) {
            let Some(frame) = self.queue.take_timeout(TAKE_TIMEOUT) else {
                continue;
            };
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let was_engaged = self.monitor.is_engaged();
            match self.monitor.observe(&frame) {
                PowerDecision::Suppress => {
                    if !was_engaged {
                        info!("Screen static, power saving engaged");
                        self.counters.set_power_saving(true);
                    }
                    self.counters.suppressed();
                    continue;
                }
                PowerDecision::Resume => {
                    info!("Screen changed, leaving power saving");
                    self.counters.set_power_saving(false);
                    if let Err(e) = self.transport.send_state(&self.on_state) {
                        warn!("Failed to restore {} state: {e}", self.transport.kind());
                    }
                }
                PowerDecision::Send => {}
            }

            match self.transport.send_frame(&frame) {
                Ok(()) => {
                    self.counters.sent();
                }
                Err(e) => {
                    let n = self.counters.send_error();
                    if should_log(n) {
                        warn!(
                            "Frame send over {} failed ({n} so far): {e}",
                            self.transport.kind()
                        );
                    }
                }
            }
        }
        debug!("Consumer stopped");
    }
}
