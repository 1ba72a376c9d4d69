//! Color calibration: gamma, white balance, per-hue saturation, smoothing

use std::fmt;
use std::str::FromStr;

use ambilume_transport::Rgb;
use serde::{Deserialize, Serialize};

/// White temperature the multipliers are normalised to (hundreds of Kelvin)
pub const NEUTRAL_WHITE_TEMP: u8 = 65;

/// 256-entry gamma lookup table
#[derive(Debug, Clone)]
pub struct GammaTable {
    gamma: f32,
    table: [u8; 256],
}

impl GammaTable {
    pub fn new(gamma: f32) -> Self {
        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let normalized = i as f32 / 255.0;
            *slot = (normalized.powf(gamma) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        Self { gamma, table }
    }

    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    pub fn apply(&self, value: u8) -> u8 {
        self.table[value as usize]
    }

    pub fn apply_rgb(&self, c: Rgb) -> Rgb {
        Rgb::new(self.apply(c.r), self.apply(c.g), self.apply(c.b))
    }
}

/// Approximate RGB of a black body at `temp` hundreds of Kelvin.
fn kelvin_to_rgb(temp: f32) -> [f32; 3] {
    let t = temp.max(10.0);
    let r = if t <= 66.0 {
        255.0
    } else {
        329.698_73 * (t - 60.0).powf(-0.133_204_76)
    };
    let g = if t <= 66.0 {
        99.470_8 * t.ln() - 161.119_57
    } else {
        288.122_17 * (t - 60.0).powf(-0.075_514_85)
    };
    let b = if t >= 66.0 {
        255.0
    } else if t <= 19.0 {
        0.0
    } else {
        138.517_73 * (t - 10.0).ln() - 305.044_8
    };
    [r.clamp(0.0, 255.0), g.clamp(0.0, 255.0), b.clamp(0.0, 255.0)]
}

/// Per-channel multipliers for `white_temp`, normalised so that
/// [`NEUTRAL_WHITE_TEMP`] leaves colors untouched.
pub fn white_balance(white_temp: u8) -> [f32; 3] {
    if white_temp == NEUTRAL_WHITE_TEMP {
        return [1.0; 3];
    }
    let target = kelvin_to_rgb(white_temp as f32);
    let neutral = kelvin_to_rgb(NEUTRAL_WHITE_TEMP as f32);
    [
        target[0] / neutral[0],
        target[1] / neutral[1],
        target[2] / neutral[2],
    ]
}

pub fn apply_balance(c: Rgb, balance: &[f32; 3]) -> Rgb {
    let scale = |v: u8, m: f32| (v as f32 * m).round().clamp(0.0, 255.0) as u8;
    Rgb::new(
        scale(c.r, balance[0]),
        scale(c.g, balance[1]),
        scale(c.b, balance[2]),
    )
}

/// Saturation factor for each of the six hue sectors (1.0 = unchanged)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HueSaturation {
    pub red: f32,
    pub yellow: f32,
    pub green: f32,
    pub cyan: f32,
    pub blue: f32,
    pub magenta: f32,
}

impl Default for HueSaturation {
    fn default() -> Self {
        Self {
            red: 1.0,
            yellow: 1.0,
            green: 1.0,
            cyan: 1.0,
            blue: 1.0,
            magenta: 1.0,
        }
    }
}

impl HueSaturation {
    pub fn is_neutral(&self) -> bool {
        *self == Self::default()
    }

    /// Factor of the sector `hue` (degrees) falls in. Sectors are centred on
    /// their primary: red covers 330..30, yellow 30..90 and so on.
    fn factor(&self, hue: f32) -> f32 {
        let sector = (((hue + 30.0) / 60.0).floor() as i32).rem_euclid(6);
        match sector {
            0 => self.red,
            1 => self.yellow,
            2 => self.green,
            3 => self.cyan,
            4 => self.blue,
            _ => self.magenta,
        }
    }

    pub fn apply(&self, c: Rgb) -> Rgb {
        if self.is_neutral() {
            return c;
        }
        let (h, s, v) = rgb_to_hsv(c);
        if s == 0.0 {
            return c;
        }
        let s = (s * self.factor(h)).clamp(0.0, 1.0);
        hsv_to_rgb(h, s, v)
    }
}

fn rgb_to_hsv(c: Rgb) -> (f32, f32, f32) {
    let r = c.r as f32 / 255.0;
    let g = c.g as f32 / 255.0;
    let b = c.b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match (h / 60.0) as u32 % 6 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let to_u8 = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb::new(to_u8(r), to_u8(g), to_u8(b))
}

/// Exponential moving average strength
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Smoothing {
    Disabled,
    Low,
    #[default]
    Medium,
    High,
    /// Explicit EMA factor in `(0, 1]`
    Custom(f32),
}

impl Smoothing {
    /// Weight of the newest sample: `out = α·new + (1-α)·prev`
    pub fn alpha(&self) -> f32 {
        match self {
            Self::Disabled => 1.0,
            Self::Low => 0.7,
            Self::Medium => 0.5,
            Self::High => 0.3,
            Self::Custom(alpha) => *alpha,
        }
    }
}

impl fmt::Display for Smoothing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
            Self::Custom(alpha) => write!(f, "{alpha}"),
        }
    }
}

impl FromStr for Smoothing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => match other.parse::<f32>() {
                Ok(alpha) if alpha > 0.0 && alpha <= 1.0 => Ok(Self::Custom(alpha)),
                Ok(alpha) => Err(format!("smoothing factor {alpha} outside (0, 1]")),
                Err(_) => Err(format!("unknown smoothing '{s}'")),
            },
        }
    }
}

impl TryFrom<String> for Smoothing {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Smoothing> for String {
    fn from(value: Smoothing) -> Self {
        value.to_string()
    }
}

/// Everything [`super::ColorProcessor`] applies after region averaging
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub gamma: f32,
    /// Hundreds of Kelvin (65 = 6500K)
    pub white_temp: u8,
    pub saturation: HueSaturation,
    pub smoothing: Smoothing,
    /// Sample every Nth pixel on both axes
    pub pixel_stride: u32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            white_temp: NEUTRAL_WHITE_TEMP,
            saturation: HueSaturation::default(),
            smoothing: Smoothing::Disabled,
            pixel_stride: 1,
        }
    }
}

impl Calibration {
    pub fn with_gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn with_white_temp(mut self, white_temp: u8) -> Self {
        self.white_temp = white_temp;
        self
    }

    pub fn with_saturation(mut self, saturation: HueSaturation) -> Self {
        self.saturation = saturation;
        self
    }

    pub fn with_smoothing(mut self, smoothing: Smoothing) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_pixel_stride(mut self, stride: u32) -> Self {
        self.pixel_stride = stride.max(1);
        self
    }
}
