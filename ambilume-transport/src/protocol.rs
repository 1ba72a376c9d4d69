//! Serial wire protocol constants and frame encoding
//!
//! Every LED update is one self-contained frame:
//!
//! ```text
//! ┌──────────┬────────────────────┬──────────┬─────────────────────┐
//! │ "DPsoft" │ 20 header bytes    │ checksum │ R,G,B × led_count   │
//! │ 6 bytes  │ one field per byte │ 1 byte   │ physical LED order  │
//! └──────────┴────────────────────┴──────────┴─────────────────────┘
//! ```
//!
//! The checksum is the XOR of every header byte, XOR'd with `0x55`.

use crate::types::{Effect, Frame, Rgb};

/// Magic preamble the firmware scans for
pub const PREAMBLE: &[u8; 6] = b"DPsoft";

/// Number of single-byte header fields after the preamble
pub const HEADER_LEN: usize = 20;

/// Constant folded into the header checksum
pub const CHECKSUM_SEED: u8 = 0x55;

/// Optional pins travel with this offset so that 0 means "unset"
pub const PIN_OFFSET: u8 = 10;

/// Bytes before the RGB payload
pub const FRAME_OVERHEAD: usize = PREAMBLE.len() + HEADER_LEN + 1;

/// Largest LED count the three count bytes can express
pub const MAX_LEDS: usize = 0xFF_FFFF;

/// Header field positions (offsets into the 20 header bytes)
pub mod field {
    pub const LED_COUNT_HI: usize = 0;
    pub const LED_COUNT_LO: usize = 1;
    pub const LED_COUNT_EXTRA: usize = 2;
    pub const BRIGHTNESS: usize = 3;
    pub const GPIO: usize = 4;
    pub const BAUD_RATE: usize = 5;
    pub const WHITE_TEMP: usize = 6;
    pub const EFFECT: usize = 7;
    pub const LDR_ENABLED: usize = 8;
    pub const LDR_TURN_OFF: usize = 9;
    pub const LDR_INTERVAL: usize = 10;
    pub const LDR_MIN: usize = 11;
    pub const LDR_ACTION: usize = 12;
    pub const COLOR_MODE: usize = 13;
    pub const COLOR_ORDER: usize = 14;
    pub const RELAY_PIN: usize = 15;
    pub const RELAY_INVERTED: usize = 16;
    pub const STANDBY_PIN: usize = 17;
    pub const LDR_PIN: usize = 18;
    pub const GPIO_CLOCK: usize = 19;
}

/// Baud rates the firmware understands, by header code
pub mod baud {
    pub const RATES: &[(u32, u8)] = &[
        (230_400, 1),
        (460_800, 2),
        (500_000, 3),
        (921_600, 4),
        (1_000_000, 5),
        (1_500_000, 6),
        (2_000_000, 7),
        (115_200, 8),
        (57_600, 9),
    ];

    /// Default link speed for new devices
    pub const DEFAULT: u32 = 500_000;

    /// Header code for a baud rate
    pub fn code(rate: u32) -> Option<u8> {
        RATES.iter().find(|(r, _)| *r == rate).map(|(_, c)| *c)
    }

    /// Baud rate for a header code (also used for `baudrate:` telemetry)
    pub fn rate(code: u8) -> Option<u32> {
        RATES.iter().find(|(_, c)| *c == code).map(|(r, _)| *r)
    }
}

/// Serial timing
pub mod timing {
    /// How long `connect` waits for the firmware to report its version
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 3000;
    /// Interval between reconnect attempts
    pub const RECONNECT_INTERVAL_MS: u64 = 2000;
    /// Outage after which the pipeline is told to give up on a soft resume
    pub const OUTAGE_GRACE_SECS: u64 = 60;
    /// Port read/write timeout (also the telemetry reader's shutdown latency)
    pub const IO_TIMEOUT_MS: u64 = 250;
}

/// Device settings carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialHeader {
    pub brightness: u8,
    pub gpio: u8,
    /// Baud-rate code (see [`baud`])
    pub baud_code: u8,
    pub white_temp: u8,
    pub effect: Effect,
    pub ldr_enabled: bool,
    pub ldr_turn_off: bool,
    pub ldr_interval: u8,
    pub ldr_min: u8,
    pub ldr_action: u8,
    pub color_mode: u8,
    pub color_order: u8,
    pub relay_pin: Option<u8>,
    pub relay_inverted: bool,
    pub standby_pin: Option<u8>,
    pub ldr_pin: Option<u8>,
    pub gpio_clock: u8,
}

impl Default for SerialHeader {
    fn default() -> Self {
        Self {
            brightness: 255,
            gpio: 2,
            baud_code: baud::code(baud::DEFAULT).unwrap_or(3),
            white_temp: 65,
            effect: Effect::Stream,
            ldr_enabled: false,
            ldr_turn_off: false,
            ldr_interval: 0,
            ldr_min: 0,
            ldr_action: 0,
            color_mode: 1,
            color_order: 1,
            relay_pin: None,
            relay_inverted: false,
            standby_pin: None,
            ldr_pin: None,
            gpio_clock: 0,
        }
    }
}

fn pin_byte(pin: Option<u8>) -> u8 {
    pin.map_or(0, |p| p.saturating_add(PIN_OFFSET))
}

impl SerialHeader {
    /// The 20 header bytes for a frame of `led_count` LEDs
    pub fn fields(&self, led_count: usize) -> [u8; HEADER_LEN] {
        let mut f = [0u8; HEADER_LEN];
        f[field::LED_COUNT_HI] = ((led_count >> 8) & 0xFF) as u8;
        f[field::LED_COUNT_LO] = (led_count & 0xFF) as u8;
        f[field::LED_COUNT_EXTRA] = ((led_count >> 16) & 0xFF) as u8;
        f[field::BRIGHTNESS] = self.brightness;
        f[field::GPIO] = self.gpio;
        f[field::BAUD_RATE] = self.baud_code;
        f[field::WHITE_TEMP] = self.white_temp;
        f[field::EFFECT] = self.effect.code();
        f[field::LDR_ENABLED] = self.ldr_enabled as u8;
        f[field::LDR_TURN_OFF] = self.ldr_turn_off as u8;
        f[field::LDR_INTERVAL] = self.ldr_interval;
        f[field::LDR_MIN] = self.ldr_min;
        f[field::LDR_ACTION] = self.ldr_action;
        f[field::COLOR_MODE] = self.color_mode;
        f[field::COLOR_ORDER] = self.color_order;
        f[field::RELAY_PIN] = pin_byte(self.relay_pin);
        f[field::RELAY_INVERTED] = self.relay_inverted as u8;
        f[field::STANDBY_PIN] = pin_byte(self.standby_pin);
        f[field::LDR_PIN] = pin_byte(self.ldr_pin);
        f[field::GPIO_CLOCK] = self.gpio_clock;
        f
    }

    /// Encode a complete wire frame.
    pub fn encode_frame(&self, frame: &Frame) -> Vec<u8> {
        let fields = self.fields(frame.len());
        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + frame.len() * 3);
        buf.extend_from_slice(PREAMBLE);
        buf.extend_from_slice(&fields);
        buf.push(calculate_checksum(&fields));
        for led in frame.leds() {
            buf.extend_from_slice(&[led.r, led.g, led.b]);
        }
        buf
    }
}

/// XOR of all header fields, XOR'd with [`CHECKSUM_SEED`]
pub fn calculate_checksum(fields: &[u8]) -> u8 {
    fields.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b)
}

/// Re-XOR the fields, the transmitted checksum and the seed: zero means valid.
pub fn verify_checksum(fields: &[u8], checksum: u8) -> bool {
    fields.iter().fold(checksum ^ CHECKSUM_SEED, |acc, b| acc ^ b) == 0
}

/// A frame as seen from the firmware side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub fields: [u8; HEADER_LEN],
    pub leds: Vec<Rgb>,
}

impl DecodedFrame {
    pub fn led_count(&self) -> usize {
        (self.fields[field::LED_COUNT_EXTRA] as usize) << 16
            | (self.fields[field::LED_COUNT_HI] as usize) << 8
            | self.fields[field::LED_COUNT_LO] as usize
    }

    pub fn effect_code(&self) -> u8 {
        self.fields[field::EFFECT]
    }

    pub fn brightness(&self) -> u8 {
        self.fields[field::BRIGHTNESS]
    }
}

/// Errors from [`decode_frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    MissingPreamble,
    Truncated { needed: usize, got: usize },
    Checksum { expected: u8, actual: u8 },
}

/// Decode one wire frame starting at the beginning of `buf`.
///
/// Returns the frame and the number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(DecodedFrame, usize), DecodeError> {
    if buf.len() < PREAMBLE.len() || &buf[..PREAMBLE.len()] != PREAMBLE {
        return Err(DecodeError::MissingPreamble);
    }
    if buf.len() < FRAME_OVERHEAD {
        return Err(DecodeError::Truncated {
            needed: FRAME_OVERHEAD,
            got: buf.len(),
        });
    }

    let mut fields = [0u8; HEADER_LEN];
    fields.copy_from_slice(&buf[PREAMBLE.len()..PREAMBLE.len() + HEADER_LEN]);
    let checksum = buf[FRAME_OVERHEAD - 1];
    if !verify_checksum(&fields, checksum) {
        return Err(DecodeError::Checksum {
            expected: calculate_checksum(&fields),
            actual: checksum,
        });
    }

    let mut frame = DecodedFrame {
        fields,
        leds: Vec::new(),
    };
    let total = FRAME_OVERHEAD + frame.led_count() * 3;
    if buf.len() < total {
        return Err(DecodeError::Truncated {
            needed: total,
            got: buf.len(),
        });
    }
    frame.leds = buf[FRAME_OVERHEAD..total]
        .chunks_exact(3)
        .map(|c| Rgb::new(c[0], c[1], c[2]))
        .collect();
    Ok((frame, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_xor_to_zero() {
        let header = SerialHeader {
            brightness: 180,
            gpio: 5,
            relay_pin: Some(12),
            ldr_pin: Some(33),
            ..Default::default()
        };
        for n in [0usize, 1, 255, 256, 511, 65_535, 70_000] {
            let fields = header.fields(n);
            let cs = calculate_checksum(&fields);
            let folded = fields.iter().fold(cs ^ CHECKSUM_SEED, |a, b| a ^ b);
            assert_eq!(folded, 0);
            assert!(verify_checksum(&fields, cs));
            assert!(!verify_checksum(&fields, cs ^ 0x01));
        }
    }

    #[test]
    fn test_led_count_split() {
        let f = SerialHeader::default().fields(0x01_02_03);
        assert_eq!(f[field::LED_COUNT_EXTRA], 0x01);
        assert_eq!(f[field::LED_COUNT_HI], 0x02);
        assert_eq!(f[field::LED_COUNT_LO], 0x03);
    }

    #[test]
    fn test_pin_offset() {
        let header = SerialHeader {
            relay_pin: Some(0),
            standby_pin: None,
            ldr_pin: Some(36),
            ..Default::default()
        };
        let f = header.fields(1);
        assert_eq!(f[field::RELAY_PIN], 10);
        assert_eq!(f[field::STANDBY_PIN], 0);
        assert_eq!(f[field::LDR_PIN], 46);
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(vec![Rgb::new(1, 2, 3), Rgb::new(4, 5, 6)]);
        let header = SerialHeader {
            effect: Effect::Fire,
            ..Default::default()
        };
        let buf = header.encode_frame(&frame);
        assert_eq!(buf.len(), FRAME_OVERHEAD + 6);
        assert_eq!(&buf[..6], b"DPsoft");
        assert_eq!(buf[6 + field::EFFECT], Effect::Fire.code());
        assert_eq!(&buf[FRAME_OVERHEAD..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_decode_encoded_frame() {
        let frame = Frame::solid(300, Rgb::new(9, 8, 7));
        let buf = SerialHeader::default().encode_frame(&frame);
        let (decoded, used) = decode_frame(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded.led_count(), 300);
        assert_eq!(decoded.leds, frame.leds());
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut buf = SerialHeader::default().encode_frame(&Frame::solid(2, Rgb::WHITE));
        buf[6 + field::BRIGHTNESS] ^= 0xFF;
        assert!(matches!(decode_frame(&buf), Err(DecodeError::Checksum { .. })));
        assert_eq!(decode_frame(b"Adalight"), Err(DecodeError::MissingPreamble));
        let short = SerialHeader::default().encode_frame(&Frame::solid(4, Rgb::WHITE));
        assert!(matches!(
            decode_frame(&short[..short.len() - 1]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_baud_codes() {
        assert_eq!(baud::code(500_000), Some(3));
        assert_eq!(baud::rate(8), Some(115_200));
        assert_eq!(baud::code(9600), None);
    }
}
