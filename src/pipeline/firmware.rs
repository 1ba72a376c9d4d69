//! Firmware gate: decides whether the target device may be streamed to

use std::collections::HashSet;
use std::fmt;

use ambilume_transport::{check_firmware, DeviceInfo, FirmwareStatus, FirmwareVersion, TransportKind};

/// Outcome of checking the target device
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Pass(DeviceInfo),
    /// No device has shown up yet
    NoDevice,
    Outdated {
        device: DeviceInfo,
        found: FirmwareVersion,
        required: FirmwareVersion,
    },
    /// The device never reported a version and its transport is not trusted
    UnknownVersion(DeviceInfo),
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass(_))
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass(device) => write!(f, "{} is compatible", device.label()),
            Self::NoDevice => write!(f, "no device found"),
            Self::Outdated {
                device,
                found,
                required,
            } => write!(
                f,
                "{} runs firmware {found}, at least {required} is required",
                device.label()
            ),
            Self::UnknownVersion(device) => {
                write!(f, "{} did not report a firmware version", device.label())
            }
        }
    }
}

/// Identity used to remember per-device gate actions
fn device_key(device: &DeviceInfo) -> String {
    device
        .mac
        .as_ref()
        .map(|m| m.to_ascii_lowercase())
        .unwrap_or_else(|| device.label())
}

/// Check `device` against `minimum`.
///
/// Unknown versions pass only on transports that tolerate them. Devices in
/// `updated` already acknowledged a successful firmware update and pass
/// regardless of the version they last reported.
pub fn evaluate(
    kind: TransportKind,
    device: Option<&DeviceInfo>,
    minimum: &FirmwareVersion,
    updated: &HashSet<String>,
) -> GateDecision {
    let Some(device) = device else {
        return GateDecision::NoDevice;
    };
    if updated.contains(&device_key(device)) {
        return GateDecision::Pass(device.clone());
    }
    match check_firmware(device, minimum) {
        FirmwareStatus::Compatible(_) => GateDecision::Pass(device.clone()),
        FirmwareStatus::Outdated { found, required } => GateDecision::Outdated {
            device: device.clone(),
            found,
            required,
        },
        FirmwareStatus::Unknown if kind.tolerates_unknown_version() => {
            GateDecision::Pass(device.clone())
        }
        FirmwareStatus::Unknown => GateDecision::UnknownVersion(device.clone()),
    }
}

/// Bookkeeping of a failed gate
#[derive(Debug, Default)]
pub struct GateState {
    /// Last diagnostic logged, so each distinct failure is reported once
    pub last_diagnostic: Option<String>,
    /// Devices an update was requested for
    pub requested: HashSet<String>,
    /// Devices that reported a successful update
    pub updated: HashSet<String>,
}

impl GateState {
    /// Record `diagnostic`; true when it differs from the last one.
    pub fn note(&mut self, diagnostic: &str) -> bool {
        if self.last_diagnostic.as_deref() == Some(diagnostic) {
            return false;
        }
        self.last_diagnostic = Some(diagnostic.to_string());
        true
    }

    /// Remember an update request for `device`; true the first time.
    pub fn request_update(&mut self, device: &DeviceInfo) -> bool {
        self.requested.insert(device_key(device))
    }

    /// Apply an update result. Returns true when it answers one of our
    /// requests.
    pub fn update_result(&mut self, mac: Option<&str>, success: bool) -> bool {
        let key = match mac {
            Some(mac) => mac.to_ascii_lowercase(),
            // Bare results cannot be attributed; treat them as ours when a
            // single request is pending
            None if self.requested.len() == 1 => match self.requested.iter().next() {
                Some(key) => key.clone(),
                None => return false,
            },
            None => return false,
        };
        if !self.requested.remove(&key) {
            return false;
        }
        if success {
            self.updated.insert(key);
        }
        true
    }

    pub fn clear_diagnostic(&mut self) {
        self.last_diagnostic = None;
    }
}
