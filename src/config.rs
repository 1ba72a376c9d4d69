//! Configuration loaded from `~/.config/ambilume/config.toml`
//!
//! Every field has a default, so a partial file (or none at all) is valid.
//! Values are immutable once loaded; variants are derived with the `with_*`
//! constructors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ambilume_transport::protocol::{baud, timing, SerialHeader};
use ambilume_transport::{
    DeviceState, Effect, FirmwareVersion, InstanceId, LedLayout, NetworkConfig, Rgb, Satellite,
    SerialConfig, StreamKind, TransportKind, AUTO_PORT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::power_saving::DEFAULT_THRESHOLD_SECS;
use crate::processor::{AspectRatio, Calibration, HueSaturation, LayoutGeometry, LedGeometry, Smoothing};

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// `[capture]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Producer tasks (and worker threads)
    pub threads: usize,
    pub pixel_stride: u32,
    /// How far into the picture each edge region reaches, in pixels
    pub border_depth: u32,
    pub aspect_ratio: AspectRatio,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            threads: 3,
            pixel_stride: 4,
            border_depth: 120,
            aspect_ratio: AspectRatio::FullScreen,
        }
    }
}

/// `[color]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub gamma: f32,
    /// Hundreds of Kelvin (65 = 6500K)
    pub white_temp: u8,
    pub smoothing: Smoothing,
    /// Color of the "on" state sent when streaming starts
    pub color: Rgb,
    pub brightness: u8,
    pub saturation: HueSaturation,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            gamma: 2.2,
            white_temp: 65,
            smoothing: Smoothing::Medium,
            color: Rgb::WHITE,
            brightness: 255,
            saturation: HueSaturation::default(),
        }
    }
}

/// `[power_saving]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSavingConfig {
    pub enabled: bool,
    pub threshold_secs: u64,
}

impl Default for PowerSavingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_secs: DEFAULT_THRESHOLD_SECS,
        }
    }
}

/// `[device]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub output: TransportKind,
    /// Serial port name or "AUTO"
    pub port: String,
    pub baud_rate: u32,
    /// Network device (name, IP or MAC) to stream to
    pub target: Option<String>,
    pub gpio: u8,
    pub gpio_clock: u8,
    pub color_mode: u8,
    pub color_order: u8,
    pub ldr_enabled: bool,
    pub ldr_turn_off: bool,
    pub ldr_interval: u8,
    pub ldr_min: u8,
    pub ldr_action: u8,
    pub ldr_pin: Option<u8>,
    pub relay_pin: Option<u8>,
    pub relay_inverted: bool,
    pub standby_pin: Option<u8>,
    pub handshake_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub outage_grace_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let header = SerialHeader::default();
        Self {
            output: TransportKind::Serial,
            port: AUTO_PORT.to_string(),
            baud_rate: baud::DEFAULT,
            target: None,
            gpio: header.gpio,
            gpio_clock: header.gpio_clock,
            color_mode: header.color_mode,
            color_order: header.color_order,
            ldr_enabled: header.ldr_enabled,
            ldr_turn_off: header.ldr_turn_off,
            ldr_interval: header.ldr_interval,
            ldr_min: header.ldr_min,
            ldr_action: header.ldr_action,
            ldr_pin: header.ldr_pin,
            relay_pin: header.relay_pin,
            relay_inverted: header.relay_inverted,
            standby_pin: header.standby_pin,
            handshake_timeout_ms: timing::HANDSHAKE_TIMEOUT_MS,
            reconnect_interval_ms: timing::RECONNECT_INTERVAL_MS,
            outage_grace_secs: timing::OUTAGE_GRACE_SECS,
        }
    }
}

/// `[mqtt]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub base_topic: String,
    pub stream: StreamKind,
    pub udp_port: u16,
    pub restart_after_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        let net = NetworkConfig::default();
        Self {
            host: net.host,
            port: net.port,
            username: None,
            password: None,
            client_id: net.client_id,
            base_topic: net.base_topic,
            stream: net.stream,
            udp_port: net.udp_port,
            restart_after_secs: net.restart_after.as_secs(),
        }
    }
}

/// `[firmware]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Oldest firmware the pipeline streams to
    pub minimum_version: String,
    /// Trigger the device's update server when its firmware is too old
    pub auto_update: bool,
    /// How often a failed firmware gate is re-checked
    pub poll_interval_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            minimum_version: "5.12.0".to_string(),
            auto_update: false,
            poll_interval_ms: 2000,
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub leds: LedLayout,
    pub color: ColorConfig,
    pub power_saving: PowerSavingConfig,
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub firmware: FirmwareConfig,
    pub satellites: Vec<Satellite>,
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse from TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load the default configuration file, creating it with defaults if it
    /// doesn't exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if !path.exists() {
            let write_err = |source| ConfigError::Write {
                path: path.clone(),
                source,
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(write_err)?;
            }
            std::fs::write(&path, Self::default().to_toml()?).map_err(write_err)?;
            tracing::info!("Created default configuration: {}", path.display());
        }
        Self::load(&path)
    }

    /// Reject values no pipeline can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.capture;
        if c.width == 0 || c.height == 0 {
            return Err(invalid("capture size", format!("{}x{}", c.width, c.height)));
        }
        if c.fps == 0 {
            return Err(invalid("capture.fps", "must be at least 1"));
        }
        if c.threads == 0 {
            return Err(invalid("capture.threads", "must be at least 1"));
        }
        if c.pixel_stride == 0 {
            return Err(invalid("capture.pixel_stride", "must be at least 1"));
        }
        let leds = self.leds.led_count();
        if leds == 0 || leds > ambilume_transport::protocol::MAX_LEDS {
            return Err(invalid("leds", format!("{leds} LEDs")));
        }
        if !(self.color.gamma.is_finite() && self.color.gamma > 0.0) {
            return Err(invalid("color.gamma", self.color.gamma.to_string()));
        }
        if self.device.output == TransportKind::Serial && baud::code(self.device.baud_rate).is_none()
        {
            return Err(invalid(
                "device.baud_rate",
                format!("{} is not a supported rate", self.device.baud_rate),
            ));
        }
        self.minimum_firmware()?;
        Ok(())
    }

    pub fn minimum_firmware(&self) -> Result<FirmwareVersion, ConfigError> {
        self.firmware
            .minimum_version
            .parse()
            .map_err(|e: String| invalid("firmware.minimum_version", e))
    }

    pub fn calibration(&self) -> Calibration {
        Calibration::default()
            .with_gamma(self.color.gamma)
            .with_white_temp(self.color.white_temp)
            .with_saturation(self.color.saturation)
            .with_smoothing(self.color.smoothing)
            .with_pixel_stride(self.capture.pixel_stride)
    }

    pub fn geometry(&self) -> LedGeometry {
        self.geometry_for(self.capture.aspect_ratio)
    }

    pub fn geometry_for(&self, aspect: AspectRatio) -> LedGeometry {
        self.leds.geometry(
            self.capture.width,
            self.capture.height,
            self.capture.border_depth,
            aspect,
        )
    }

    /// State sent to the device when streaming starts
    pub fn on_state(&self) -> DeviceState {
        DeviceState::streaming(self.color.color, self.color.brightness, self.color.white_temp)
    }

    pub fn off_state(&self) -> DeviceState {
        DeviceState::off(self.color.white_temp)
    }

    pub fn power_saving_threshold(&self) -> Duration {
        Duration::from_secs(self.power_saving.threshold_secs)
    }

    pub fn serial_config(&self) -> SerialConfig {
        let d = &self.device;
        SerialConfig {
            port: d.port.clone(),
            baud_rate: d.baud_rate,
            led_count: self.leds.led_count(),
            header: SerialHeader {
                brightness: self.color.brightness,
                gpio: d.gpio,
                baud_code: baud::code(d.baud_rate).unwrap_or(SerialHeader::default().baud_code),
                white_temp: self.color.white_temp,
                effect: Effect::Stream,
                ldr_enabled: d.ldr_enabled,
                ldr_turn_off: d.ldr_turn_off,
                ldr_interval: d.ldr_interval,
                ldr_min: d.ldr_min,
                ldr_action: d.ldr_action,
                color_mode: d.color_mode,
                color_order: d.color_order,
                relay_pin: d.relay_pin,
                relay_inverted: d.relay_inverted,
                standby_pin: d.standby_pin,
                ldr_pin: d.ldr_pin,
                gpio_clock: d.gpio_clock,
            },
            handshake_timeout: Duration::from_millis(d.handshake_timeout_ms),
            reconnect_interval: Duration::from_millis(d.reconnect_interval_ms),
            outage_grace: Duration::from_secs(d.outage_grace_secs),
        }
    }

    pub fn network_config(&self, instance: InstanceId) -> NetworkConfig {
        let m = &self.mqtt;
        NetworkConfig {
            host: m.host.clone(),
            port: m.port,
            username: m.username.clone(),
            password: m.password.clone(),
            client_id: format!("{}-{}", m.client_id, instance),
            base_topic: m.base_topic.clone(),
            instance,
            stream: m.stream,
            udp_port: m.udp_port,
            target: self.device.target.clone(),
            layout: self.leds,
            satellites: self.satellites.clone(),
            handshake_timeout: Duration::from_millis(self.device.handshake_timeout_ms),
            reconnect_interval: Duration::from_millis(self.device.reconnect_interval_ms),
            restart_after: Duration::from_secs(m.restart_after_secs),
        }
    }

    // ── derive-with-overrides ──

    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_leds(mut self, leds: LedLayout) -> Self {
        self.leds = leds;
        self
    }

    pub fn with_color(mut self, color: ColorConfig) -> Self {
        self.color = color;
        self
    }

    pub fn with_power_saving(mut self, enabled: bool, threshold: Duration) -> Self {
        self.power_saving = PowerSavingConfig {
            enabled,
            threshold_secs: threshold.as_secs(),
        };
        self
    }

    pub fn with_output(mut self, output: TransportKind) -> Self {
        self.device.output = output;
        self
    }

    pub fn with_firmware(mut self, firmware: FirmwareConfig) -> Self {
        self.firmware = firmware;
        self
    }

    pub fn with_satellites(mut self, satellites: Vec<Satellite>) -> Self {
        self.satellites = satellites;
        self
    }
}

/// Path to the default configuration file.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn config_dir() -> PathBuf {
    if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config).join("ambilume")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config/ambilume")
    } else {
        PathBuf::from("/tmp/ambilume")
    }
}
