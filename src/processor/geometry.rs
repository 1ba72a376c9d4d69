//! Screen sampling regions, one per LED

use std::fmt;
use std::str::FromStr;

use ambilume_transport::{LedLayout, Orientation};
use serde::{Deserialize, Serialize};

/// Rectangle of screen pixels averaged into one LED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SampleRegion {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when the region lies entirely inside a `width`×`height` image.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        !self.is_empty()
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Sampling regions in physical LED order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedGeometry {
    regions: Vec<SampleRegion>,
}

impl LedGeometry {
    pub fn new(regions: Vec<SampleRegion>) -> Self {
        Self { regions }
    }

    pub fn regions(&self) -> &[SampleRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Part of the screen that carries picture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectRatio {
    #[default]
    FullScreen,
    /// 21:9 content with black bars above and below
    Letterbox,
    /// 4:3 content with black bars left and right
    Pillarbox,
}

impl AspectRatio {
    /// Picture rectangle `(x, y, width, height)` inside a `width`×`height`
    /// screen.
    pub fn content_area(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        match self {
            Self::FullScreen => (0, 0, width, height),
            Self::Letterbox => {
                let content = (width as u64 * 9 / 21).min(height as u64) as u32;
                (0, (height - content) / 2, width, content)
            }
            Self::Pillarbox => {
                let content = (height as u64 * 4 / 3).min(width as u64) as u32;
                ((width - content) / 2, 0, content, height)
            }
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FullScreen => "fullscreen",
            Self::Letterbox => "letterbox",
            Self::Pillarbox => "pillarbox",
        })
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "fullscreen" | "auto" => Ok(Self::FullScreen),
            "letterbox" => Ok(Self::Letterbox),
            "pillarbox" => Ok(Self::Pillarbox),
            _ => Err(format!("unknown aspect ratio '{s}'")),
        }
    }
}

/// `n` consecutive slots splitting `len` pixels starting at `start`,
/// as `(offset, size)` pairs.
fn slots(start: u32, len: u32, n: usize) -> impl Iterator<Item = (u32, u32)> {
    let n64 = n.max(1) as u64;
    (0..n as u64).map(move |k| {
        let a = k * len as u64 / n64;
        let b = (k + 1) * len as u64 / n64;
        (start + a as u32, (b - a) as u32)
    })
}

/// Derive sampling geometry from a strip layout
pub trait LayoutGeometry {
    /// Regions for a `width`×`height` screen, `depth` pixels deep into the
    /// picture, in the strip's wiring order.
    fn geometry(&self, width: u32, height: u32, depth: u32, aspect: AspectRatio) -> LedGeometry;
}

impl LayoutGeometry for LedLayout {
    fn geometry(&self, width: u32, height: u32, depth: u32, aspect: AspectRatio) -> LedGeometry {
        let (cx, cy, cw, ch) = aspect.content_area(width, height);
        let depth = depth.min(cw / 2).min(ch / 2).max(1);

        let horizontal = |y: u32, start: u32, len: u32, n: usize| -> Vec<SampleRegion> {
            slots(start, len, n)
                .map(|(x, w)| SampleRegion::new(x, y, w, depth))
                .collect()
        };
        let vertical = |x: u32, n: usize| -> Vec<SampleRegion> {
            slots(cy, ch, n)
                .map(|(y, h)| SampleRegion::new(x, y, depth, h))
                .collect()
        };

        let bottom_y = cy + ch - depth;
        let (left_len, right_start) = if self.bottom_right == 0 {
            (cw, cx + cw)
        } else {
            (cw / 2, cx + cw / 2)
        };

        // Clockwise wiring: bottom right → right (upwards) → top (leftwards)
        // → left (downwards) → bottom left
        let mut regions = Vec::with_capacity(self.led_count());
        regions.extend(horizontal(
            bottom_y,
            right_start,
            cx + cw - right_start,
            self.bottom_right,
        ));
        regions.extend(vertical(cx + cw - depth, self.right).into_iter().rev());
        regions.extend(horizontal(cy, cx, cw, self.top).into_iter().rev());
        regions.extend(vertical(cx, self.left));
        regions.extend(horizontal(bottom_y, cx, left_len, self.bottom_left));

        if self.orientation == Orientation::Anticlockwise {
            regions.reverse();
        }
        LedGeometry::new(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> LedLayout {
        LedLayout {
            top: 4,
            right: 2,
            left: 2,
            bottom_left: 2,
            bottom_right: 2,
            orientation: Orientation::Clockwise,
        }
    }

    #[test]
    fn test_geometry_covers_every_led_inside_screen() {
        let geometry = LedLayout::default().geometry(1920, 1080, 100, AspectRatio::FullScreen);
        assert_eq!(geometry.len(), LedLayout::default().led_count());
        assert!(geometry.regions().iter().all(|r| r.fits(1920, 1080)));
    }

    #[test]
    fn test_geometry_wiring_order() {
        let g = layout().geometry(100, 50, 10, AspectRatio::FullScreen);
        let r = g.regions();
        // Bottom right segment starts at the middle of the bottom edge
        assert_eq!(r[0], SampleRegion::new(50, 40, 25, 10));
        assert_eq!(r[1], SampleRegion::new(75, 40, 25, 10));
        // Right edge runs upwards
        assert_eq!(r[2].x, 90);
        assert!(r[2].y > r[3].y);
        // Top runs from the right corner to the left one
        assert_eq!(r[4], SampleRegion::new(75, 0, 25, 10));
        assert_eq!(r[7], SampleRegion::new(0, 0, 25, 10));
        // Left edge runs downwards, then bottom left towards the middle
        assert!(r[8].y < r[9].y);
        assert_eq!(r[10], SampleRegion::new(0, 40, 25, 10));
        assert_eq!(r[11], SampleRegion::new(25, 40, 25, 10));
    }

    #[test]
    fn test_anticlockwise_reverses() {
        let cw = layout().geometry(100, 50, 10, AspectRatio::FullScreen);
        let acw = LedLayout {
            orientation: Orientation::Anticlockwise,
            ..layout()
        }
        .geometry(100, 50, 10, AspectRatio::FullScreen);
        let mut reversed = cw.regions().to_vec();
        reversed.reverse();
        assert_eq!(acw.regions(), reversed.as_slice());
    }

    #[test]
    fn test_letterbox_skips_bars() {
        let g = layout().geometry(2100, 1080, 50, AspectRatio::Letterbox);
        // 2100 * 9 / 21 = 900 rows of picture, 90 rows of bar on each side
        let top = g.regions()[4];
        assert_eq!(top.y, 90);
        assert!(g.regions().iter().all(|r| r.y >= 90 && r.y + r.height <= 990));
        assert_eq!("Letter Box".parse::<AspectRatio>().unwrap(), AspectRatio::Letterbox);
    }

    #[test]
    fn test_pillarbox_skips_bars() {
        let g = layout().geometry(1920, 1080, 50, AspectRatio::Pillarbox);
        assert!(g
            .regions()
            .iter()
            .all(|r| r.x >= 240 && r.x + r.width <= 1680));
    }
}
