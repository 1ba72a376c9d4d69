//! Telemetry parsing for serial controllers
//!
//! The firmware prints one `tag:value` pair per line, every few seconds and
//! right after the port opens. Lines are matched by prefix against a fixed
//! set of tags; anything else (boot banners, debug prints, partial lines
//! from a previous session) is ignored.

use tracing::trace;

use crate::protocol::baud;
use crate::types::DeviceInfo;
use crate::version::FirmwareVersion;

/// Telemetry tags, as printed by the firmware
pub mod tag {
    pub const VERSION: &str = "ver:";
    pub const BOARD: &str = "board:";
    pub const MAC: &str = "MAC:";
    pub const GPIO: &str = "gpio:";
    pub const BAUD_RATE: &str = "baudrate:";
    pub const FRAMERATE: &str = "framerate:";
    pub const LDR: &str = "ldr:";
    pub const COLOR_MODE: &str = "colorMode:";
    pub const COLOR_ORDER: &str = "colorOrder:";
    pub const LED_COUNT: &str = "lednum:";
    pub const FIRMWARE: &str = "firmware:";
    pub const IP: &str = "IP:";
    pub const DEVICE_NAME: &str = "deviceName:";
}

/// Longest line kept before the buffer is discarded as noise
const MAX_LINE_LEN: usize = 512;

/// One parsed telemetry line
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryLine {
    Version(FirmwareVersion),
    Board(String),
    Mac(String),
    Gpio(u8),
    BaudRate(u32),
    Framerate(f32),
    Ldr(u8),
    ColorMode(u8),
    ColorOrder(u8),
    LedCount(u32),
    Firmware(String),
    Ip(String),
    DeviceName(String),
}

impl TelemetryLine {
    /// Copy the carried field into `info`.
    pub fn apply(&self, info: &mut DeviceInfo) {
        match self {
            Self::Version(v) => info.version = Some(*v),
            Self::Board(b) => info.board = Some(b.clone()),
            Self::Mac(m) => info.mac = Some(m.clone()),
            Self::Gpio(g) => info.gpio = Some(*g),
            Self::BaudRate(r) => info.baud_rate = Some(*r),
            Self::Framerate(f) => info.fps = Some(*f),
            Self::Ldr(l) => info.ldr = Some(*l),
            Self::ColorMode(m) => info.color_mode = Some(*m),
            Self::ColorOrder(o) => info.color_order = Some(*o),
            Self::LedCount(n) => info.led_count = Some(*n),
            Self::Firmware(f) => info.firmware = Some(f.clone()),
            Self::Ip(ip) => info.ip = Some(ip.clone()),
            Self::DeviceName(n) => info.name = Some(n.clone()),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse one telemetry line. Unknown or malformed lines yield `None`.
pub fn parse_line(line: &str) -> Option<TelemetryLine> {
    let line = line.trim();
    let (tag_str, value) = line.split_once(':')?;
    let value = value.trim();

    // Match on "tag:" so that e.g. "ldr:" never shadows "ldrPin:"
    let parsed = match &line[..tag_str.len() + 1] {
        tag::VERSION => TelemetryLine::Version(value.parse().ok()?),
        tag::BOARD => TelemetryLine::Board(non_empty(value)?),
        tag::MAC => TelemetryLine::Mac(non_empty(value)?),
        tag::GPIO => TelemetryLine::Gpio(value.parse().ok()?),
        tag::BAUD_RATE => {
            let raw: u32 = value.parse().ok()?;
            // Firmware prints the header code; accept a literal rate too
            let rate = match u8::try_from(raw) {
                Ok(code) => baud::rate(code)?,
                Err(_) => raw,
            };
            TelemetryLine::BaudRate(rate)
        }
        tag::FRAMERATE => TelemetryLine::Framerate(value.parse().ok()?),
        tag::LDR => TelemetryLine::Ldr(value.parse().ok()?),
        tag::COLOR_MODE => TelemetryLine::ColorMode(value.parse().ok()?),
        tag::COLOR_ORDER => TelemetryLine::ColorOrder(value.parse().ok()?),
        tag::LED_COUNT => TelemetryLine::LedCount(value.parse().ok()?),
        tag::FIRMWARE => TelemetryLine::Firmware(non_empty(value)?),
        tag::IP => TelemetryLine::Ip(non_empty(value)?),
        tag::DEVICE_NAME => TelemetryLine::DeviceName(non_empty(value)?),
        _ => {
            trace!("Ignoring serial line: {line}");
            return None;
        }
    };
    Some(parsed)
}

/// Splits a raw byte stream into text lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.buf)
                        .trim_end_matches('\r')
                        .to_string();
                    self.buf.clear();
                    if !line.is_empty() {
                        lines.push(line);
                    }
                }
                _ => {
                    if self.buf.len() >= MAX_LINE_LEN {
                        self.buf.clear();
                    }
                    self.buf.push(byte);
                }
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    #[test]
    fn test_parse_known_tags() {
        assert_eq!(
            parse_line("ver:5.12.3"),
            Some(TelemetryLine::Version(FirmwareVersion::new(5, 12, 3)))
        );
        assert_eq!(
            parse_line("MAC:AA:BB:CC:DD:EE:FF"),
            Some(TelemetryLine::Mac("AA:BB:CC:DD:EE:FF".into()))
        );
        assert_eq!(parse_line("gpio:2"), Some(TelemetryLine::Gpio(2)));
        assert_eq!(parse_line("framerate:59.5"), Some(TelemetryLine::Framerate(59.5)));
        assert_eq!(parse_line("colorOrder:3\r"), Some(TelemetryLine::ColorOrder(3)));
        assert_eq!(parse_line("lednum:120"), Some(TelemetryLine::LedCount(120)));
        assert_eq!(
            parse_line("IP:192.168.1.40"),
            Some(TelemetryLine::Ip("192.168.1.40".into()))
        );
    }

    #[test]
    fn test_baud_rate_code_or_literal() {
        assert_eq!(parse_line("baudrate:3"), Some(TelemetryLine::BaudRate(500_000)));
        assert_eq!(
            parse_line("baudrate:921600"),
            Some(TelemetryLine::BaudRate(921_600))
        );
        assert_eq!(parse_line("baudrate:42"), None);
    }

    #[test]
    fn test_unknown_and_malformed_lines_ignored() {
        assert_eq!(parse_line("Booting..."), None);
        assert_eq!(parse_line("ldrPin:33"), None);
        assert_eq!(parse_line("gpio:abc"), None);
        assert_eq!(parse_line("board:"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn test_apply_only_touches_its_field() {
        let mut info = DeviceInfo::new(TransportKind::Serial).with_address("COM4");
        parse_line("board:ESP32_S3").unwrap().apply(&mut info);
        parse_line("ldr:40").unwrap().apply(&mut info);
        assert_eq!(info.board.as_deref(), Some("ESP32_S3"));
        assert_eq!(info.ldr, Some(40));
        assert_eq!(info.address.as_deref(), Some("COM4"));
        assert!(info.version.is_none());
    }

    #[test]
    fn test_line_buffer_splits_across_reads() {
        let mut lb = LineBuffer::new();
        assert!(lb.push(b"ver:5.1").is_empty());
        let lines = lb.push(b"2.0\r\nboard:ESP8266\n\npartial");
        assert_eq!(lines, vec!["ver:5.12.0".to_string(), "board:ESP8266".to_string()]);
        assert_eq!(lb.push(b"\n"), vec!["partial".to_string()]);
    }

    #[test]
    fn test_line_buffer_drops_runaway_noise() {
        let mut lb = LineBuffer::new();
        lb.push(&[b'x'; 2000]);
        let lines = lb.push(b"gpio:5\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].len() <= MAX_LINE_LEN);
    }
}
