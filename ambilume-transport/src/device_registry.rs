//! Device registry - every controller seen on any transport
//!
//! Transports write (upsert on every handshake/telemetry line), the pipeline
//! reads. Entries are merged by MAC when one is known, otherwise by logical
//! address (serial port name or IP). The registry never removes anything:
//! staleness is a query, deletion policy belongs to the caller.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::types::DeviceInfo;
use crate::version::FirmwareVersion;

/// Result of comparing a device's firmware against the required minimum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStatus {
    Compatible(FirmwareVersion),
    Outdated {
        found: FirmwareVersion,
        required: FirmwareVersion,
    },
    /// The device never reported a version
    Unknown,
}

/// Compare a device's reported version against `minimum`.
pub fn check_firmware(device: &DeviceInfo, minimum: &FirmwareVersion) -> FirmwareStatus {
    match device.version {
        Some(found) if found.at_least(minimum) => FirmwareStatus::Compatible(found),
        Some(found) => FirmwareStatus::Outdated {
            found,
            required: *minimum,
        },
        None => FirmwareStatus::Unknown,
    }
}

/// Shared table of known devices
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<DeviceInfo>>,
}

fn same_mac(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn matches_address(device: &DeviceInfo, needle: &str) -> bool {
    device.address.as_deref() == Some(needle)
        || device.ip.as_deref() == Some(needle)
        || device.name.as_deref() == Some(needle)
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge `update`, returning the merged entry.
    ///
    /// Only the fields `update` carries overwrite the stored entry.
    pub fn upsert(&self, update: DeviceInfo) -> DeviceInfo {
        let mut devices = self.devices.write();

        let by_mac = update.mac.as_deref().and_then(|mac| {
            devices
                .iter()
                .position(|d| d.mac.as_deref().is_some_and(|m| same_mac(m, mac)))
        });

        // Fall back to the logical address, but never merge two devices that
        // both carry (different) MACs.
        let by_address = || {
            let keys = [update.address.as_deref(), update.ip.as_deref()];
            devices.iter().position(|d| {
                let mac_compatible = d.mac.is_none() || update.mac.is_none();
                mac_compatible && keys.iter().flatten().any(|key| matches_address(d, key))
            })
        };

        match by_mac.or_else(by_address) {
            Some(idx) => {
                devices[idx].merge(&update);
                devices[idx].clone()
            }
            None => {
                debug!("New {} device: {}", update.kind, update.label());
                devices.push(update.clone());
                update
            }
        }
    }

    pub fn find_by_mac(&self, mac: &str) -> Option<DeviceInfo> {
        self.devices
            .read()
            .iter()
            .find(|d| d.mac.as_deref().is_some_and(|m| same_mac(m, mac)))
            .cloned()
    }

    /// Look up by serial port name, IP or device name.
    pub fn find_by_address(&self, name_or_ip: &str) -> Option<DeviceInfo> {
        self.devices
            .read()
            .iter()
            .find(|d| matches_address(d, name_or_ip))
            .cloned()
    }

    /// Devices not seen for longer than `older_than`.
    pub fn list_stale(&self, older_than: Duration) -> Vec<DeviceInfo> {
        self.list_stale_at(older_than, Instant::now())
    }

    pub fn list_stale_at(&self, older_than: Duration, now: Instant) -> Vec<DeviceInfo> {
        self.devices
            .read()
            .iter()
            .filter(|d| now.saturating_duration_since(d.last_seen) > older_than)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<DeviceInfo> {
        self.devices.read().clone()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    fn serial(port: &str) -> DeviceInfo {
        DeviceInfo::new(TransportKind::Serial).with_address(port)
    }

    #[test]
    fn test_disjoint_fields_are_unioned() {
        let reg = DeviceRegistry::new();
        let mut first = serial("/dev/ttyUSB0");
        first.board = Some("ESP32".into());
        first.gpio = Some(2);
        reg.upsert(first);

        let mut second = serial("/dev/ttyUSB0");
        second.version = Some(FirmwareVersion::new(5, 12, 3));
        second.baud_rate = Some(500_000);
        reg.upsert(second);

        assert_eq!(reg.len(), 1);
        let merged = reg.find_by_address("/dev/ttyUSB0").unwrap();
        assert_eq!(merged.board.as_deref(), Some("ESP32"));
        assert_eq!(merged.gpio, Some(2));
        assert_eq!(merged.version, Some(FirmwareVersion::new(5, 12, 3)));
        assert_eq!(merged.baud_rate, Some(500_000));
    }

    #[test]
    fn test_mac_merge_is_case_insensitive() {
        let reg = DeviceRegistry::new();
        reg.upsert(
            DeviceInfo::new(TransportKind::Network)
                .with_mac("aa:bb:cc:dd:ee:ff")
                .with_ip("192.168.1.20"),
        );
        reg.upsert(
            DeviceInfo::new(TransportKind::Network)
                .with_mac("AA:BB:CC:DD:EE:FF")
                .with_ip("192.168.1.21"),
        );
        assert_eq!(reg.len(), 1);
        let d = reg.find_by_mac("AA:bb:CC:dd:EE:ff").unwrap();
        assert_eq!(d.ip.as_deref(), Some("192.168.1.21"));
    }

    #[test]
    fn test_late_mac_attaches_to_address_entry() {
        let reg = DeviceRegistry::new();
        reg.upsert(serial("COM3"));
        reg.upsert(serial("COM3").with_mac("11:22:33:44:55:66"));
        assert_eq!(reg.len(), 1);
        assert!(reg.find_by_mac("11:22:33:44:55:66").is_some());
    }

    #[test]
    fn test_different_macs_on_same_address_stay_separate() {
        let reg = DeviceRegistry::new();
        reg.upsert(serial("COM3").with_mac("11:11:11:11:11:11"));
        reg.upsert(serial("COM3").with_mac("22:22:22:22:22:22"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_find_by_ip_and_name() {
        let reg = DeviceRegistry::new();
        let mut dev = DeviceInfo::new(TransportKind::Network).with_ip("10.0.0.7");
        dev.name = Some("GW_desk".into());
        reg.upsert(dev);
        assert!(reg.find_by_address("10.0.0.7").is_some());
        assert!(reg.find_by_address("GW_desk").is_some());
        assert!(reg.find_by_address("10.0.0.8").is_none());
    }

    #[test]
    fn test_list_stale() {
        let reg = DeviceRegistry::new();
        let start = Instant::now();
        let mut old = serial("COM1");
        old.last_seen = start;
        let mut fresh = serial("COM2");
        fresh.last_seen = start + Duration::from_secs(115);
        reg.upsert(old);
        reg.upsert(fresh);

        let now = start + Duration::from_secs(120);
        let stale = reg.list_stale_at(Duration::from_secs(60), now);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].address.as_deref(), Some("COM1"));
        // Staleness is only a query
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_check_firmware() {
        let min = FirmwareVersion::new(5, 11, 8);
        let dev = serial("COM1").with_version(FirmwareVersion::new(5, 12, 0));
        assert!(matches!(check_firmware(&dev, &min), FirmwareStatus::Compatible(_)));

        let dev = serial("COM1").with_version(FirmwareVersion::new(5, 9, 30));
        assert!(matches!(check_firmware(&dev, &min), FirmwareStatus::Outdated { .. }));

        assert_eq!(check_firmware(&serial("COM1"), &min), FirmwareStatus::Unknown);
    }
}
