//! MQTT control-plane topics and message shapes
//!
//! All messages are small JSON objects with a closed field set. Devices pick
//! the messages addressed to them by the `MAC` field, which is why the
//! network transport rewrites it per satellite before publishing.

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::types::{DeviceInfo, DeviceState, Effect, InstanceId, RemoteCommand, Rgb, TransportKind};
use crate::version::FirmwareVersion;

/// Default base topic
pub const DEFAULT_BASE_TOPIC: &str = "lights/ambilume";

/// Topic names derived from a base topic and the capture instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
    instance: InstanceId,
}

impl Topics {
    pub fn new(base: impl Into<String>, instance: InstanceId) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
            instance,
        }
    }

    fn sub(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.base)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Device commands (state messages)
    pub fn set(&self) -> String {
        self.sub("set")
    }

    /// Last known state, published retained
    pub fn state(&self) -> String {
        self.sub("state")
    }

    /// Device heartbeats
    pub fn fps(&self) -> String {
        self.sub("fps")
    }

    pub fn gamma(&self) -> String {
        self.sub("gamma")
    }

    pub fn update(&self) -> String {
        self.sub("update")
    }

    pub fn update_result(&self) -> String {
        self.sub("update_result")
    }

    pub fn firmware_config(&self) -> String {
        self.sub("firmwareConfig")
    }

    pub fn unsubscribe(&self) -> String {
        self.sub("unsubscribe")
    }

    /// Color stream when the data plane runs over MQTT
    pub fn stream(&self) -> String {
        self.sub("set/stream")
    }

    pub fn aspect_ratio(&self) -> String {
        self.sub(&format!("aspectratio/{}", self.instance))
    }

    pub fn smoothing(&self) -> String {
        self.sub(&format!("smoothing/{}", self.instance))
    }

    pub fn profile(&self) -> String {
        self.sub(&format!("profile/{}", self.instance))
    }

    /// Topics the host listens on
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.fps(),
            self.update_result(),
            self.gamma(),
            self.aspect_ratio(),
            self.smoothing(),
            self.profile(),
        ]
    }
}

// ── Outbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

/// Tells devices whether the other capture instances start or stop with
/// this one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstancesCommand {
    Play,
    Stop,
}

/// Power/effect command, also published retained as the last known state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    pub state: PowerState,
    pub effect: String,
    pub color: Rgb,
    pub brightness: u8,
    #[serde(rename = "whitetemp")]
    pub white_temp: u8,
    #[serde(rename = "MAC", skip_serializing_if = "Option::is_none", default)]
    pub mac: Option<String>,
    #[serde(
        rename = "startStopInstances",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub start_stop_instances: Option<InstancesCommand>,
}

impl StateMessage {
    pub fn from_state(state: &DeviceState, mac: Option<String>) -> Self {
        Self {
            state: if state.on { PowerState::On } else { PowerState::Off },
            effect: state.effect.name().to_string(),
            color: state.color,
            brightness: state.brightness,
            white_temp: state.white_temp,
            mac,
            start_stop_instances: None,
        }
    }

    /// Same message addressed to another device.
    pub fn with_mac(&self, mac: impl Into<String>) -> Self {
        Self {
            mac: Some(mac.into()),
            ..self.clone()
        }
    }

    pub fn with_instances(mut self, command: InstancesCommand) -> Self {
        self.start_stop_instances = Some(command);
        self
    }

    pub fn effect(&self) -> Option<Effect> {
        self.effect.parse().ok()
    }
}

/// Pin and strip settings pushed to a Wi-Fi device, addressed by MAC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareConfigMessage {
    #[serde(rename = "MAC")]
    pub mac: String,
    pub gpio: u8,
    pub color_mode: u8,
    pub color_order: u8,
    #[serde(rename = "lednum")]
    pub led_count: u32,
    pub baud_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub relay_pin: Option<u8>,
    #[serde(rename = "sbPin", skip_serializing_if = "Option::is_none", default)]
    pub standby_pin: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ldr_pin: Option<u8>,
}

/// One frame on the MQTT data plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "MAC", skip_serializing_if = "Option::is_none", default)]
    pub mac: Option<String>,
    #[serde(rename = "lednum")]
    pub led_count: usize,
    /// `0xRRGGBB` per LED
    pub stream: Vec<u32>,
}

impl StreamMessage {
    pub fn from_frame(frame: &crate::types::Frame, mac: Option<String>) -> Self {
        Self {
            mac,
            led_count: frame.len(),
            stream: frame.leds().iter().map(|c| c.to_u32()).collect(),
        }
    }
}

/// Asks a device to start its OTA update server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTrigger {
    #[serde(rename = "MAC")]
    pub mac: String,
    pub update: bool,
}

impl UpdateTrigger {
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            update: true,
        }
    }
}

/// Tells devices to stop listening on the stream topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeMessage {
    pub instance: u8,
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Periodic device announcement on the fps topic
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
    #[serde(rename = "IP")]
    pub ip: Option<String>,
    #[serde(rename = "MAC")]
    pub mac: String,
    pub ver: Option<String>,
    pub framerate: Option<f32>,
    pub lednum: Option<u32>,
    pub board: Option<String>,
    pub gpio: Option<u8>,
    #[serde(rename = "colorMode")]
    pub color_mode: Option<u8>,
    #[serde(rename = "colorOrder")]
    pub color_order: Option<u8>,
    #[serde(rename = "baudRate")]
    pub baud_rate: Option<u32>,
    pub ldr: Option<u8>,
}

impl Heartbeat {
    pub fn to_device_info(&self) -> DeviceInfo {
        let mut info = DeviceInfo::new(TransportKind::Network).with_mac(self.mac.clone());
        info.name.clone_from(&self.device_name);
        info.ip.clone_from(&self.ip);
        info.address.clone_from(&self.ip);
        info.version = self
            .ver
            .as_deref()
            .and_then(|v| v.parse::<FirmwareVersion>().ok());
        info.fps = self.framerate;
        info.led_count = self.lednum;
        info.board.clone_from(&self.board);
        info.gpio = self.gpio;
        info.color_mode = self.color_mode;
        info.color_order = self.color_order;
        info.baud_rate = self.baud_rate;
        info.ldr = self.ldr;
        info
    }
}

/// Answer to an [`UpdateTrigger`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub mac: Option<String>,
    pub success: bool,
}

impl UpdateResult {
    /// Accepts `{"MAC":..,"success":bool}` or a bare `true`/`false`.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bare(bool),
            Object {
                #[serde(rename = "MAC", default)]
                mac: Option<String>,
                success: bool,
            },
        }

        Ok(match serde_json::from_slice::<Raw>(payload)? {
            Raw::Bare(success) => Self { mac: None, success },
            Raw::Object { mac, success } => Self { mac, success },
        })
    }
}

/// A classified inbound publish
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat(Heartbeat),
    UpdateResult(UpdateResult),
    Remote(RemoteCommand),
}

fn text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().trim_matches('"').to_string()
}

/// Classify an inbound publish. Topics the host does not listen on yield
/// `Ok(None)`.
pub fn parse_inbound(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Result<Option<Inbound>, TransportError> {
    let malformed = |reason: String| TransportError::Malformed {
        topic: topic.to_string(),
        reason,
    };

    let inbound = if topic == topics.fps() {
        // The fps topic also carries non-device chatter; only MAC-addressed
        // heartbeats are of interest.
        match serde_json::from_slice::<Heartbeat>(payload) {
            Ok(hb) => Inbound::Heartbeat(hb),
            Err(_) => return Ok(None),
        }
    } else if topic == topics.update_result() {
        Inbound::UpdateResult(UpdateResult::parse(payload).map_err(|e| malformed(e.to_string()))?)
    } else if topic == topics.gamma() {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Gamma {
            Bare(f32),
            Object { gamma: f32 },
        }
        let gamma = match serde_json::from_slice::<Gamma>(payload) {
            Ok(Gamma::Bare(g) | Gamma::Object { gamma: g }) => g,
            Err(_) => text(payload)
                .parse::<f32>()
                .map_err(|e| malformed(e.to_string()))?,
        };
        Inbound::Remote(RemoteCommand::Gamma(gamma))
    } else if topic == topics.smoothing() {
        Inbound::Remote(RemoteCommand::Smoothing(text(payload)))
    } else if topic == topics.aspect_ratio() {
        Inbound::Remote(RemoteCommand::AspectRatio(text(payload)))
    } else if topic == topics.profile() {
        Inbound::Remote(RemoteCommand::Profile(text(payload)))
    } else {
        return Ok(None);
    };
    Ok(Some(inbound))
}
