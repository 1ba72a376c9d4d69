//! Screen capture sources and the producer pool
//!
//! A [`CapturePool`] runs N producer tasks on its own multi-thread tokio
//! runtime. Task `i` ticks every `N / fps` seconds, offset by `i / fps`, so
//! together they deliver `fps` frames per second:
//!
//! ```text
//! source.capture() → processor.reduce_captured() → queue.offer()
//! ```
//!
//! Producers share one [`ColorProcessor`]. Each stamps its image before
//! capturing, and a reduction that reaches the processor after a newer one
//! is discarded, so smoothing always follows capture order.

#[cfg(feature = "screen-capture")]
pub mod pipewire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ambilume_transport::Rgb;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::frame_queue::FrameQueue;
use crate::processor::{ColorProcessor, ProcessError};
use crate::stats::{should_log, Counters};

#[cfg(feature = "screen-capture")]
pub use self::pipewire::PipeWireSource;

/// Errors raised by capture sources and the pool
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture source unavailable: {0}")]
    Unavailable(String),

    #[error("no frame captured yet")]
    NoFrame,

    #[error("screencast portal: {0}")]
    Portal(String),

    #[error("PipeWire: {0}")]
    PipeWire(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte order of one 4-byte pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// BGRA / BGRx
    Bgra,
    /// RGBA / RGBx
    Rgba,
}

/// One captured screen, tightly packed rows of 4-byte pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl ScreenImage {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Uniformly colored image
    pub fn solid(width: u32, height: u32, format: PixelFormat, color: Rgb) -> Self {
        let px = encode_pixel(format, color);
        let data = px.repeat(width as usize * height as usize);
        Self::new(width, height, format, data)
    }

    /// Bytes a full image of this size occupies
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

fn encode_pixel(format: PixelFormat, c: Rgb) -> [u8; 4] {
    match format {
        PixelFormat::Bgra => [c.b, c.g, c.r, 255],
        PixelFormat::Rgba => [c.r, c.g, c.b, 255],
    }
}

/// Something that can grab the current screen contents
pub trait CaptureSource: Send + Sync {
    fn name(&self) -> &str;

    /// Size of the images this source produces
    fn size(&self) -> (u32, u32);

    fn capture(&self) -> Result<ScreenImage, CaptureError>;
}

/// Shared handle to a capture source
pub type SharedSource = Arc<dyn CaptureSource>;

/// Synthetic source: a rainbow sweeping across the screen
pub struct TestPattern {
    width: u32,
    height: u32,
    period: Duration,
    started: Instant,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            period: Duration::from_secs(10),
            started: Instant::now(),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    fn hue_shift(&self) -> f32 {
        let period = self.period.as_secs_f32().max(0.001);
        (self.started.elapsed().as_secs_f32() % period) / period * 360.0
    }
}

fn hue_to_rgb(hue: f32) -> Rgb {
    let h = hue.rem_euclid(360.0) / 60.0;
    let x = ((1.0 - (h % 2.0 - 1.0).abs()) * 255.0) as u8;
    match h as u32 {
        0 => Rgb::new(255, x, 0),
        1 => Rgb::new(x, 255, 0),
        2 => Rgb::new(0, 255, x),
        3 => Rgb::new(0, x, 255),
        4 => Rgb::new(x, 0, 255),
        _ => Rgb::new(255, 0, x),
    }
}

impl CaptureSource for TestPattern {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&self) -> Result<ScreenImage, CaptureError> {
        let shift = self.hue_shift();
        let width = self.width.max(1) as f32;
        let mut row = Vec::with_capacity(self.width as usize * 4);
        for x in 0..self.width {
            let color = hue_to_rgb(shift + x as f32 / width * 360.0);
            row.extend_from_slice(&encode_pixel(PixelFormat::Bgra, color));
        }
        let data = row.repeat(self.height as usize);
        Ok(ScreenImage::new(
            self.width,
            self.height,
            PixelFormat::Bgra,
            data,
        ))
    }
}

/// Producer pool settings
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub threads: usize,
    pub fps: u32,
}

impl PoolSettings {
    /// Tick period of each producer
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.threads.max(1) as f64 / self.fps.max(1) as f64)
    }

    /// Start offset of producer `index`
    pub fn offset(&self, index: usize) -> Duration {
        Duration::from_secs_f64(index as f64 / self.fps.max(1) as f64)
    }
}

/// Running capture producers
pub struct CapturePool {
    runtime: Option<Runtime>,
    running: Arc<AtomicBool>,
}

impl CapturePool {
    pub fn start(
        source: SharedSource,
        processor: Arc<Mutex<ColorProcessor>>,
        queue: FrameQueue,
        counters: Arc<Counters>,
        settings: PoolSettings,
    ) -> Result<Self, CaptureError> {
        let threads = settings.threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("capture-worker")
            .enable_time()
            .build()?;

        let running = Arc::new(AtomicBool::new(true));
        let size_warned = Arc::new(AtomicBool::new(false));
        info!(
            "Starting {} capture producers from {} at {} fps",
            threads,
            source.name(),
            settings.fps
        );

        for index in 0..threads {
            let producer = Producer {
                index,
                source: Arc::clone(&source),
                processor: Arc::clone(&processor),
                queue: queue.clone(),
                counters: Arc::clone(&counters),
                running: Arc::clone(&running),
                size_warned: Arc::clone(&size_warned),
            };
            let start = tokio::time::Instant::now() + settings.offset(index);
            let period = settings.period();
            runtime.spawn(async move {
                let mut ticker = tokio::time::interval_at(start, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                while producer.running.load(Ordering::Acquire) {
                    ticker.tick().await;
                    if !producer.running.load(Ordering::Acquire) {
                        break;
                    }
                    producer.run_once();
                }
                debug!("Capture producer {} exited", producer.index);
            });
        }

        Ok(Self {
            runtime: Some(runtime),
            running,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signal the producers and wait for the workers to wind down.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for CapturePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Producer {
    index: usize,
    source: SharedSource,
    processor: Arc<Mutex<ColorProcessor>>,
    queue: FrameQueue,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    size_warned: Arc<AtomicBool>,
}

impl Producer {
    fn run_once(&self) {
        let captured_at = Instant::now();
        let image = match self.source.capture() {
            Ok(image) => image,
            Err(CaptureError::NoFrame) => return,
            Err(e) => {
                let n = self.counters.capture_error();
                if should_log(n) {
                    warn!("Capture from {} failed ({n} so far): {e}", self.source.name());
                }
                return;
            }
        };

        let frame = match self.processor.lock().reduce_captured(&image, captured_at) {
            Ok(frame) => frame,
            Err(ProcessError::Stale) => {
                let n = self.counters.dropped();
                if should_log(n) {
                    debug!("Producer {} lost the race to a newer capture", self.index);
                }
                return;
            }
            Err(e @ ProcessError::ImageSize { .. }) | Err(e @ ProcessError::ShortBuffer { .. }) => {
                if !self.size_warned.swap(true, Ordering::AcqRel) {
                    warn!("Skipping captured frames: {e}");
                }
                return;
            }
            Err(e) => {
                error!("Color reduction failed: {e}");
                return;
            }
        };

        self.counters.captured();
        if !self.queue.offer(frame) {
            let n = self.counters.dropped();
            if should_log(n) {
                debug!("Frame queue full, dropped {n} frames so far");
            }
        }
    }
}
