//! Screen image → LED frame reduction
//!
//! ```text
//! region average (pixel stride) → gamma LUT → white balance
//!   → per-hue saturation → EMA smoothing
//! ```

pub mod calibration;
pub mod geometry;

use std::time::Instant;

use ambilume_transport::{Frame, Rgb};
use thiserror::Error;

use crate::capture::{PixelFormat, ScreenImage};

pub use calibration::{Calibration, GammaTable, HueSaturation, Smoothing, NEUTRAL_WHITE_TEMP};
pub use geometry::{AspectRatio, LayoutGeometry, LedGeometry, SampleRegion};

/// Errors raised while reducing an image
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    /// Regions do not match the screen or the strip
    #[error("invalid LED geometry: {0}")]
    Geometry(String),

    #[error("image is {found_width}x{found_height}, expected {width}x{height}")]
    ImageSize {
        width: u32,
        height: u32,
        found_width: u32,
        found_height: u32,
    },

    #[error("image buffer holds {found} bytes, {expected} needed")]
    ShortBuffer { expected: usize, found: usize },

    /// Captured before an image that was already reduced
    #[error("image captured out of order")]
    Stale,
}

/// Turns captured images into LED frames
#[derive(Debug, Clone)]
pub struct ColorProcessor {
    geometry: LedGeometry,
    calibration: Calibration,
    gamma: GammaTable,
    balance: [f32; 3],
    led_count: usize,
    validated: Option<(u32, u32)>,
    previous: Option<Vec<[f32; 3]>>,
    /// Capture instant of the image the smoothing history ends with
    last_capture: Option<Instant>,
}

impl ColorProcessor {
    pub fn new(geometry: LedGeometry, calibration: Calibration) -> Self {
        Self {
            led_count: geometry.len(),
            gamma: GammaTable::new(calibration.gamma),
            balance: calibration::white_balance(calibration.white_temp),
            geometry,
            calibration,
            validated: None,
            previous: None,
            last_capture: None,
        }
    }

    pub fn led_count(&self) -> usize {
        self.led_count
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn geometry(&self) -> &LedGeometry {
        &self.geometry
    }

    /// Check the geometry against a `width`×`height` screen. Later images
    /// must have exactly this size.
    pub fn validate(&mut self, width: u32, height: u32) -> Result<(), ProcessError> {
        check_geometry(&self.geometry, self.led_count, width, height)?;
        self.validated = Some((width, height));
        Ok(())
    }

    /// Swap the sampling regions (aspect ratio change). The LED count is
    /// fixed for the lifetime of the processor.
    pub fn set_geometry(&mut self, geometry: LedGeometry) -> Result<(), ProcessError> {
        if let Some((width, height)) = self.validated {
            check_geometry(&geometry, self.led_count, width, height)?;
        } else if geometry.len() != self.led_count {
            return Err(ProcessError::Geometry(format!(
                "{} regions for {} LEDs",
                geometry.len(),
                self.led_count
            )));
        }
        self.geometry = geometry;
        Ok(())
    }

    pub fn set_gamma(&mut self, gamma: f32) {
        self.calibration.gamma = gamma;
        self.gamma = GammaTable::new(gamma);
    }

    pub fn set_smoothing(&mut self, smoothing: Smoothing) {
        self.calibration.smoothing = smoothing;
    }

    /// Forget the smoothing history.
    pub fn reset(&mut self) {
        self.previous = None;
        self.last_capture = None;
    }

    /// Reduce an image grabbed at `captured_at`.
    ///
    /// Several producers share one processor; an image that reaches the
    /// lock after a newer one is rejected with [`ProcessError::Stale`] so
    /// the smoothing history only moves forward in capture order.
    pub fn reduce_captured(
        &mut self,
        image: &ScreenImage,
        captured_at: Instant,
    ) -> Result<Frame, ProcessError> {
        if self.last_capture.is_some_and(|last| captured_at < last) {
            return Err(ProcessError::Stale);
        }
        let frame = self.reduce(image)?;
        self.last_capture = Some(captured_at);
        Ok(frame)
    }

    /// Reduce `image` to one color per LED.
    pub fn reduce(&mut self, image: &ScreenImage) -> Result<Frame, ProcessError> {
        match self.validated {
            Some((width, height)) if (width, height) != (image.width, image.height) => {
                return Err(ProcessError::ImageSize {
                    width,
                    height,
                    found_width: image.width,
                    found_height: image.height,
                })
            }
            Some(_) => {}
            None => self.validate(image.width, image.height)?,
        }
        let expected = image.expected_len();
        if image.data.len() < expected {
            return Err(ProcessError::ShortBuffer {
                expected,
                found: image.data.len(),
            });
        }

        let stride = self.calibration.pixel_stride.max(1);
        let alpha = self.calibration.smoothing.alpha();
        let mut smoothed = Vec::with_capacity(self.led_count);
        let mut leds = Vec::with_capacity(self.led_count);

        for (i, region) in self.geometry.regions().iter().enumerate() {
            let color = average_region(image, region, stride);
            let color = self.gamma.apply_rgb(color);
            let color = calibration::apply_balance(color, &self.balance);
            let color = self.calibration.saturation.apply(color);

            let current = [color.r as f32, color.g as f32, color.b as f32];
            let value = match self.previous.as_ref().and_then(|p| p.get(i)) {
                Some(prev) if alpha < 1.0 => [
                    alpha * current[0] + (1.0 - alpha) * prev[0],
                    alpha * current[1] + (1.0 - alpha) * prev[1],
                    alpha * current[2] + (1.0 - alpha) * prev[2],
                ],
                _ => current,
            };
            let to_u8 = |v: f32| v.round().clamp(0.0, 255.0) as u8;
            leds.push(Rgb::new(to_u8(value[0]), to_u8(value[1]), to_u8(value[2])));
            smoothed.push(value);
        }

        self.previous = Some(smoothed);
        Ok(Frame::new(leds))
    }
}

fn check_geometry(
    geometry: &LedGeometry,
    led_count: usize,
    width: u32,
    height: u32,
) -> Result<(), ProcessError> {
    if geometry.len() != led_count {
        return Err(ProcessError::Geometry(format!(
            "{} regions for {} LEDs",
            geometry.len(),
            led_count
        )));
    }
    if let Some((i, r)) = geometry
        .regions()
        .iter()
        .enumerate()
        .find(|(_, r)| !r.fits(width, height))
    {
        return Err(ProcessError::Geometry(format!(
            "region {i} ({}x{} at {},{}) outside {width}x{height} screen",
            r.width, r.height, r.x, r.y
        )));
    }
    Ok(())
}

/// Mean color of `region`, sampling every `stride`th pixel on both axes.
fn average_region(image: &ScreenImage, region: &SampleRegion, stride: u32) -> Rgb {
    let (ri, gi, bi) = match image.format {
        PixelFormat::Bgra => (2, 1, 0),
        PixelFormat::Rgba => (0, 1, 2),
    };
    let row_bytes = image.width as usize * 4;
    let (mut r, mut g, mut b, mut n) = (0u64, 0u64, 0u64, 0u64);

    for y in (region.y..region.y + region.height).step_by(stride as usize) {
        let row = y as usize * row_bytes;
        for x in (region.x..region.x + region.width).step_by(stride as usize) {
            let px = row + x as usize * 4;
            r += image.data[px + ri] as u64;
            g += image.data[px + gi] as u64;
            b += image.data[px + bi] as u64;
            n += 1;
        }
    }

    if n == 0 {
        return Rgb::BLACK;
    }
    Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8)
}
