//! Transport layer for ambient-light controllers
//!
//! This crate provides a unified interface for streaming LED frames to
//! downstream lighting controllers across different backends:
//!
//! - Serial (USB-serial microcontroller, binary frame protocol)
//! - Network (Wi-Fi device, MQTT control plane + UDP or MQTT data plane)
//!
//! It also owns everything the backends share: the frame/color value types,
//! the device registry, firmware version comparison and the LED zone maths
//! used to feed satellite devices.

pub mod device_registry;
pub mod error;
pub mod event_parser;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod mqtt;
pub mod protocol;
pub mod types;
pub mod version;
pub mod zones;

pub mod network;
pub mod serial;

pub use device_registry::{check_firmware, DeviceRegistry, FirmwareStatus};
pub use error::TransportError;
pub use types::{
    DeviceInfo, DeviceState, Effect, Frame, InstanceId, RemoteCommand, Rgb, TransportEvent,
    TransportKind,
};
pub use version::FirmwareVersion;
pub use zones::{LedLayout, Orientation, Satellite, SatelliteAlgorithm, Zone};

pub use network::{NetworkConfig, NetworkTransport, StreamKind};
pub use serial::{PortConnector, SerialConfig, SerialLink, SerialTransport, AUTO_PORT};

#[cfg(feature = "serial")]
pub use serial::SystemPorts;

use std::sync::Arc;

use crossbeam_channel::Receiver;

/// The core transport trait - all backends implement this
///
/// Implementations are natively synchronous: frame writes happen on the
/// pipeline's consumer thread, background reader/reconnect loops run on
/// their own named threads and report through [`Transport::events`].
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open the link and run the handshake
    ///
    /// # Returns
    /// The target device, or `None` when the link is up but no device has
    /// announced itself yet.
    fn connect(&self) -> Result<Option<DeviceInfo>, TransportError>;

    /// Current view of the device frames are sent to
    fn target_device(&self) -> Option<DeviceInfo>;

    /// Send one LED frame (fans out to satellites where supported)
    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Push power/effect state
    fn send_state(&self, state: &DeviceState) -> Result<(), TransportError>;

    /// Event stream of this transport
    ///
    /// All receivers share one queue; the pipeline manager is the only
    /// intended consumer.
    fn events(&self) -> Receiver<TransportEvent>;

    /// Check if the link is currently up
    fn is_connected(&self) -> bool;

    /// Close the link and stop background loops
    fn close(&self) -> Result<(), TransportError>;

    /// Ask `device` to start its firmware update
    ///
    /// The answer arrives as [`TransportEvent::FirmwareUpdateResult`].
    fn request_firmware_update(&self, _device: &DeviceInfo) -> Result<(), TransportError> {
        Err(TransportError::NotSupported(match self.kind() {
            TransportKind::Serial => "serial",
            TransportKind::Network => "network",
        }))
    }
}

/// Shared handle to a transport
pub type SharedTransport = Arc<dyn Transport>;
