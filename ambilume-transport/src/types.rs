//! Common types for transport layer

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::version::FirmwareVersion;

// ── Rgb / Frame ──────────────────────────────────────────────────────

/// RGB color tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Self = Self { r: 0, g: 0, b: 0 };
    pub const WHITE: Self = Self {
        r: 255,
        g: 255,
        b: 255,
    };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn is_black(&self) -> bool {
        *self == Self::BLACK
    }

    /// Pack as `0xRRGGBB`.
    pub fn to_u32(self) -> u32 {
        (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }
}

impl From<(u8, u8, u8)> for Rgb {
    fn from((r, g, b): (u8, u8, u8)) -> Self {
        Self { r, g, b }
    }
}

/// One capture cycle worth of LED colors, in physical LED order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    leds: Vec<Rgb>,
}

impl Frame {
    pub fn new(leds: Vec<Rgb>) -> Self {
        Self { leds }
    }

    /// A frame with every LED set to `color`.
    pub fn solid(len: usize, color: Rgb) -> Self {
        Self {
            leds: vec![color; len],
        }
    }

    pub fn len(&self) -> usize {
        self.leds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leds.is_empty()
    }

    pub fn leds(&self) -> &[Rgb] {
        &self.leds
    }

    pub fn into_leds(self) -> Vec<Rgb> {
        self.leds
    }

    /// True when every LED is off (an empty frame counts as black).
    pub fn is_black(&self) -> bool {
        self.leds.iter().all(Rgb::is_black)
    }

    /// Number of positions whose color differs. Length mismatch counts every
    /// missing position as a difference.
    pub fn differing_leds(&self, other: &Frame) -> usize {
        let common = self
            .leds
            .iter()
            .zip(other.leds.iter())
            .filter(|(a, b)| a != b)
            .count();
        common + self.leds.len().abs_diff(other.leds.len())
    }

    /// Flat `R,G,B,R,G,B...` byte stream.
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leds.len() * 3);
        for led in &self.leds {
            out.extend_from_slice(&[led.r, led.g, led.b]);
        }
        out
    }

    /// Same colors in reverse order.
    pub fn reversed(&self) -> Frame {
        let mut leds = self.leds.clone();
        leds.reverse();
        Frame { leds }
    }
}

impl From<Vec<Rgb>> for Frame {
    fn from(leds: Vec<Rgb>) -> Self {
        Self { leds }
    }
}

// ── Transport identity ───────────────────────────────────────────────

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB-serial microcontroller
    Serial,
    /// Wi-Fi device reached over MQTT (+ UDP data plane)
    Network,
}

impl TransportKind {
    /// Legacy serial firmware may never report a version; it is trusted.
    pub fn tolerates_unknown_version(&self) -> bool {
        matches!(self, Self::Serial)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Identity of one capture instance (one per monitor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InstanceId(pub u8);

impl InstanceId {
    pub const PRIMARY: Self = Self(1);

    pub fn is_primary(&self) -> bool {
        self.0 <= 1
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Effects / device state ───────────────────────────────────────────

/// Effect running on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Effect {
    /// Screen capture stream (the pipeline's own effect)
    Stream,
    #[default]
    Solid,
    Bpm,
    Fire,
    Twinkle,
    Rainbow,
    ChaseRainbow,
    SolidRainbow,
    MixedRainbow,
}

impl Effect {
    pub const ALL: [Effect; 9] = [
        Effect::Stream,
        Effect::Solid,
        Effect::Bpm,
        Effect::Fire,
        Effect::Twinkle,
        Effect::Rainbow,
        Effect::ChaseRainbow,
        Effect::SolidRainbow,
        Effect::MixedRainbow,
    ];

    /// Code carried in the serial header.
    pub fn code(&self) -> u8 {
        match self {
            Self::Stream => 0,
            Self::Solid => 1,
            Self::Bpm => 2,
            Self::Fire => 3,
            Self::Twinkle => 4,
            Self::Rainbow => 5,
            Self::ChaseRainbow => 6,
            Self::SolidRainbow => 7,
            Self::MixedRainbow => 8,
        }
    }

    /// Name carried in MQTT state messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Solid => "solid",
            Self::Bpm => "bpm",
            Self::Fire => "fire",
            Self::Twinkle => "twinkle",
            Self::Rainbow => "rainbow",
            Self::ChaseRainbow => "chase rainbow",
            Self::SolidRainbow => "solid rainbow",
            Self::MixedRainbow => "mixed rainbow",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Effect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|e| e.name() == lower || e.name().replace(' ', "_") == lower)
            .copied()
            .ok_or_else(|| format!("unknown effect '{s}'"))
    }
}

/// Power + effect state pushed to a device over the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub on: bool,
    pub effect: Effect,
    pub color: Rgb,
    pub brightness: u8,
    /// White temperature in hundreds of Kelvin (65 = 6500K)
    pub white_temp: u8,
}

impl DeviceState {
    /// Streaming state with the configured solid color.
    pub fn streaming(color: Rgb, brightness: u8, white_temp: u8) -> Self {
        Self {
            on: true,
            effect: Effect::Stream,
            color,
            brightness,
            white_temp,
        }
    }

    pub fn off(white_temp: u8) -> Self {
        Self {
            on: false,
            effect: Effect::Solid,
            color: Rgb::BLACK,
            brightness: 0,
            white_temp,
        }
    }
}

// ── Devices ──────────────────────────────────────────────────────────

/// Everything known about a downstream controller.
///
/// Every attribute except the transport kind is optional: telemetry arrives
/// one field at a time and partial updates only carry what they know.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub kind: TransportKind,
    /// Serial port name or IP address
    pub address: Option<String>,
    pub mac: Option<String>,
    pub name: Option<String>,
    pub ip: Option<String>,
    pub version: Option<FirmwareVersion>,
    pub board: Option<String>,
    /// Firmware flavour ("FULL" / "LIGHT")
    pub firmware: Option<String>,
    pub color_mode: Option<u8>,
    pub color_order: Option<u8>,
    pub baud_rate: Option<u32>,
    pub gpio: Option<u8>,
    pub led_count: Option<u32>,
    pub fps: Option<f32>,
    pub ldr: Option<u8>,
    pub last_seen: Instant,
}

impl DeviceInfo {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            address: None,
            mac: None,
            name: None,
            ip: None,
            version: None,
            board: None,
            firmware: None,
            color_mode: None,
            color_order: None,
            baud_rate: None,
            gpio: None,
            led_count: None,
            fps: None,
            ldr: None,
            last_seen: Instant::now(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_version(mut self, version: FirmwareVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Human-readable identifier for logs.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.mac.clone())
            .or_else(|| self.address.clone())
            .or_else(|| self.ip.clone())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    /// Overlay the fields `update` carries onto `self`.
    pub fn merge(&mut self, update: &DeviceInfo) {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }
        take(&mut self.address, &update.address);
        take(&mut self.mac, &update.mac);
        take(&mut self.name, &update.name);
        take(&mut self.ip, &update.ip);
        take(&mut self.version, &update.version);
        take(&mut self.board, &update.board);
        take(&mut self.firmware, &update.firmware);
        take(&mut self.color_mode, &update.color_mode);
        take(&mut self.color_order, &update.color_order);
        take(&mut self.baud_rate, &update.baud_rate);
        take(&mut self.gpio, &update.gpio);
        take(&mut self.led_count, &update.led_count);
        take(&mut self.fps, &update.fps);
        take(&mut self.ldr, &update.ldr);
        self.kind = update.kind;
        self.last_seen = self.last_seen.max(update.last_seen);
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// Settings pushed from home automation over the control plane
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    Gamma(f32),
    /// Smoothing preset name or explicit EMA factor, as sent
    Smoothing(String),
    AspectRatio(String),
    Profile(String),
}

/// Typed events every transport pushes to its output channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A device announced itself or refreshed telemetry; the registry has
    /// already been updated.
    Telemetry {
        kind: TransportKind,
        address: Option<String>,
        mac: Option<String>,
    },
    /// The link dropped; the transport is reconnecting on its own.
    ConnectionLost { kind: TransportKind, reason: String },
    /// The link is back after a `ConnectionLost`.
    Reconnected { kind: TransportKind },
    /// The outage lasted longer than the grace window.
    OutageExceeded { kind: TransportKind, elapsed: Duration },
    /// Device state cannot be trusted anymore; a full re-handshake is needed.
    RestartRequired { kind: TransportKind, elapsed: Duration },
    /// A frame write did not complete within the I/O timeout.
    FrameAckTimeout { kind: TransportKind },
    /// Answer to a firmware update trigger.
    FirmwareUpdateResult { mac: Option<String>, success: bool },
    /// Setting change requested by a remote controller
    Remote(RemoteCommand),
    /// Unrecoverable transport failure.
    Fatal { kind: TransportKind, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_pack() {
        assert_eq!(Rgb::new(0x12, 0x34, 0x56).to_u32(), 0x123456);
        assert_eq!(Rgb::BLACK.to_u32(), 0);
    }

    #[test]
    fn test_frame_differing_leds() {
        let a = Frame::solid(5, Rgb::WHITE);
        let mut leds = a.leds().to_vec();
        leds[0] = Rgb::BLACK;
        leds[4] = Rgb::BLACK;
        let b = Frame::new(leds);
        assert_eq!(a.differing_leds(&b), 2);
        assert_eq!(a.differing_leds(&Frame::solid(3, Rgb::WHITE)), 2);
    }

    #[test]
    fn test_frame_black() {
        assert!(Frame::solid(10, Rgb::BLACK).is_black());
        assert!(!Frame::solid(10, Rgb::new(0, 0, 1)).is_black());
    }

    #[test]
    fn test_effect_round_trip_names() {
        for effect in Effect::ALL {
            assert_eq!(effect.name().parse::<Effect>().unwrap(), effect);
        }
        assert_eq!("chase_rainbow".parse::<Effect>().unwrap(), Effect::ChaseRainbow);
        assert!("disco".parse::<Effect>().is_err());
    }

    #[test]
    fn test_device_merge_keeps_untouched_fields() {
        let mut base = DeviceInfo::new(TransportKind::Serial).with_address("/dev/ttyUSB0");
        base.board = Some("ESP32".into());
        let mut update = DeviceInfo::new(TransportKind::Serial);
        update.gpio = Some(2);
        base.merge(&update);
        assert_eq!(base.board.as_deref(), Some("ESP32"));
        assert_eq!(base.gpio, Some(2));
        assert_eq!(base.address.as_deref(), Some("/dev/ttyUSB0"));
    }
}
