//! LED layout, zones and satellite reduction
//!
//! Frames are laid out in the direction the strip is wired. For a clockwise
//! strip the order is:
//!
//! ```text
//!   bottom_right → right → top → left → bottom_left
//! ```
//!
//! An anticlockwise strip carries the same segments in reverse order.
//! Satellites take one zone out of the primary frame, reduce it to their own
//! LED count and flip it when their cable runs the other way.

use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::types::{Frame, Rgb};

/// Direction the strip is wired around the screen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Clockwise,
    Anticlockwise,
}

/// Number of LEDs on each edge of the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedLayout {
    pub top: usize,
    pub right: usize,
    pub left: usize,
    /// Bottom edge left of the gap (the whole bottom edge without a gap)
    pub bottom_left: usize,
    /// Bottom edge right of the gap
    pub bottom_right: usize,
    pub orientation: Orientation,
}

impl Default for LedLayout {
    fn default() -> Self {
        Self {
            top: 33,
            right: 18,
            left: 18,
            bottom_left: 13,
            bottom_right: 13,
            orientation: Orientation::Clockwise,
        }
    }
}

/// Named sub-range of the primary strip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Top,
    Left,
    Right,
    /// Both bottom segments, left to right
    Bottom,
    BottomLeft,
    BottomRight,
    TopLeft,
    TopRight,
}

impl LedLayout {
    pub fn led_count(&self) -> usize {
        self.top + self.right + self.left + self.bottom_left + self.bottom_right
    }

    pub fn bottom(&self) -> usize {
        self.bottom_left + self.bottom_right
    }

    /// Segment ranges in clockwise wiring order.
    fn clockwise_ranges(&self) -> [(Zone, Range<usize>); 5] {
        let mut start = 0;
        let mut next = |len: usize| {
            let r = start..start + len;
            start += len;
            r
        };
        [
            (Zone::BottomRight, next(self.bottom_right)),
            (Zone::Right, next(self.right)),
            (Zone::Top, next(self.top)),
            (Zone::Left, next(self.left)),
            (Zone::BottomLeft, next(self.bottom_left)),
        ]
    }

    /// Frame indices covered by `zone`, in wiring order of a clockwise strip.
    fn clockwise_indices(&self, zone: Zone) -> Vec<usize> {
        let ranges: HashMap<Zone, Range<usize>> = self.clockwise_ranges().into_iter().collect();
        let seg = |z: Zone| ranges.get(&z).cloned().unwrap_or(0..0);
        let top = seg(Zone::Top);
        // Clockwise, the top edge runs from the right corner to the left one
        let top_mid = top.start + top.len() / 2;

        match zone {
            Zone::Top | Zone::Right | Zone::Left | Zone::BottomLeft | Zone::BottomRight => {
                seg(zone).collect()
            }
            Zone::Bottom => seg(Zone::BottomLeft).chain(seg(Zone::BottomRight)).collect(),
            Zone::TopRight => (top.start..top_mid).collect(),
            Zone::TopLeft => (top_mid..top.end).collect(),
        }
    }

    /// Colors of `zone`, in the order the primary strip carries them.
    pub fn extract_zone(&self, frame: &Frame, zone: Zone) -> Frame {
        let total = self.led_count();
        let leds = frame.leds();
        self.clockwise_indices(zone)
            .into_iter()
            .map(|i| match self.orientation {
                Orientation::Clockwise => i,
                Orientation::Anticlockwise => total - 1 - i,
            })
            .filter_map(|i| leds.get(i).copied())
            .collect::<Vec<_>>()
            .into()
    }
}

/// How a zone is fitted to a satellite's LED count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SatelliteAlgorithm {
    /// Each output LED is the mean of the source LEDs it covers
    #[default]
    Average,
    /// Each output LED is the most common color among the LEDs it covers
    Dominant,
    /// Nearest-neighbour: source colors are repeated or skipped
    Resample,
}

/// Source index range covered by output LED `i` of `target`
fn bucket(i: usize, source: usize, target: usize) -> Range<usize> {
    let start = i * source / target;
    let end = ((i + 1) * source / target).max(start + 1).min(source);
    start..end
}

fn average(colors: &[Rgb]) -> Rgb {
    if colors.is_empty() {
        return Rgb::BLACK;
    }
    let n = colors.len() as u32;
    let (r, g, b) = colors.iter().fold((0u32, 0u32, 0u32), |(r, g, b), c| {
        (r + c.r as u32, g + c.g as u32, b + c.b as u32)
    });
    Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8)
}

/// Most frequent color after quantising to 4 bits per channel. The winner is
/// the mean of its bin so that noise doesn't pick an outlier shade.
fn dominant(colors: &[Rgb]) -> Rgb {
    let mut bins: Vec<(u16, Vec<Rgb>)> = Vec::new();
    for &c in colors {
        let key = (c.r as u16 >> 4) << 8 | (c.g as u16 >> 4) << 4 | c.b as u16 >> 4;
        match bins.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(c),
            None => bins.push((key, vec![c])),
        }
    }
    // max_by_key returns the last maximum; iterate reversed so the first bin
    // wins ties
    bins.iter()
        .rev()
        .max_by_key(|(_, members)| members.len())
        .map_or(Rgb::BLACK, |(_, members)| average(members))
}

impl SatelliteAlgorithm {
    /// Fit `source` to exactly `target` LEDs.
    pub fn reduce(&self, source: &Frame, target: usize) -> Frame {
        let src = source.leds();
        if src.is_empty() {
            return Frame::solid(target, Rgb::BLACK);
        }
        let n = src.len();
        (0..target)
            .map(|i| match self {
                Self::Average => average(&src[bucket(i, n, target)]),
                Self::Dominant => dominant(&src[bucket(i, n, target)]),
                Self::Resample => src[((2 * i + 1) * n / (2 * target)).min(n - 1)],
            })
            .collect::<Vec<_>>()
            .into()
    }
}

/// Secondary device fed from one zone of the primary frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Satellite {
    /// IP used to resolve the device (and its MAC) in the registry
    pub ip: String,
    pub zone: Zone,
    pub led_count: usize,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub algorithm: SatelliteAlgorithm,
}

impl Satellite {
    pub fn new(ip: impl Into<String>, zone: Zone, led_count: usize) -> Self {
        Self {
            ip: ip.into(),
            zone,
            led_count,
            orientation: Orientation::default(),
            algorithm: SatelliteAlgorithm::default(),
        }
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_algorithm(mut self, algorithm: SatelliteAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// The frame this satellite should display for `primary`.
    pub fn frame_for(&self, layout: &LedLayout, primary: &Frame) -> Frame {
        let zone = layout.extract_zone(primary, self.zone);
        let reduced = self.algorithm.reduce(&zone, self.led_count);
        if self.orientation != layout.orientation {
            reduced.reversed()
        } else {
            reduced
        }
    }
}
