//! Transport error types

use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    // Common errors
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Communication timeout")]
    Timeout,

    #[error("Frame too large: {leds} LEDs (max {max})")]
    FrameTooLarge { leds: usize, max: usize },

    #[error("Operation not supported by {0} transport")]
    NotSupported(&'static str),

    // Serial-specific errors
    #[error("Serial port error: {0}")]
    Serial(String),

    // Network-specific errors
    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("Malformed message on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether the error means the link itself is gone (as opposed to a
    /// single bad message).
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Timeout | Self::Io(_) | Self::Serial(_) | Self::Mqtt(_)
        )
    }
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::DeviceNotFound(e.to_string()),
            _ => TransportError::Serial(e.to_string()),
        }
    }
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Mqtt(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Internal(format!("JSON encoding failed: {e}"))
    }
}
