//! Ambient light streaming
//!
//! Captures the screen, reduces each image to one color per LED along the
//! edges and streams the result to a serial or network light controller.

pub mod capture;
pub mod config;
pub mod frame_queue;
pub mod pipeline;
pub mod power_saving;
pub mod processor;
pub mod stats;

pub use capture::{CaptureError, CaptureSource, PixelFormat, ScreenImage, SharedSource, TestPattern};
pub use config::{Config, ConfigError};
pub use frame_queue::FrameQueue;
pub use pipeline::{
    build_transport, PipelineContext, PipelineError, PipelineManager, PipelineState,
};
pub use power_saving::{PowerDecision, PowerSavingMonitor};
pub use processor::{AspectRatio, Calibration, ColorProcessor, LedGeometry, Smoothing};
pub use stats::PipelineStats;
