//! In-memory transports for testing
//!
//! [`MockPorts`] stands in for the host's serial ports so the real
//! [`SerialTransport`](crate::SerialTransport) can be driven end to end.
//! [`MockBroker`] does the same for the MQTT client.
//! [`MockTransport`] replaces a whole transport for pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::network::{ControlConnector, ControlLink, Delivery, LinkEvent, NetworkConfig};
use crate::protocol::{decode_frame, DecodedFrame, PREAMBLE};
use crate::serial::{PortConnector, SerialLink};
use crate::types::{DeviceInfo, DeviceState, Frame, TransportEvent, TransportKind};
use crate::Transport;

// ── Serial ports ─────────────────────────────────────────────────────

#[derive(Default)]
struct PortState {
    listed: bool,
    unplugged: bool,
    /// Bumped by every replug; links of an older generation are dead
    generation: u64,
    rx: VecDeque<u8>,
    written: Vec<u8>,
}

type PortMap = Arc<Mutex<HashMap<String, PortState>>>;

/// Fake set of serial ports
#[derive(Default)]
pub struct MockPorts {
    ports: PortMap,
}

impl MockPorts {
    pub fn new(names: &[&str]) -> Self {
        let map = names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    PortState {
                        listed: true,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            ports: Arc::new(Mutex::new(map)),
        }
    }

    /// Queue bytes for the device to "print"
    pub fn feed(&self, name: &str, data: &[u8]) {
        self.ports
            .lock()
            .entry(name.to_string())
            .or_default()
            .rx
            .extend(data);
    }

    /// Pull the cable: open links fail, reopening fails.
    pub fn unplug(&self, name: &str) {
        if let Some(port) = self.ports.lock().get_mut(name) {
            port.unplugged = true;
        }
    }

    /// Plug the cable back in
    pub fn replug(&self, name: &str) {
        if let Some(port) = self.ports.lock().get_mut(name) {
            port.unplugged = false;
            port.generation += 1;
        }
    }

    /// Everything written to `name` across all sessions
    pub fn written(&self, name: &str) -> Vec<u8> {
        self.ports
            .lock()
            .get(name)
            .map(|p| p.written.clone())
            .unwrap_or_default()
    }

    /// Decode every wire frame written to `name`
    pub fn frames(&self, name: &str) -> Vec<DecodedFrame> {
        let written = self.written(name);
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < written.len() {
            match decode_frame(&written[pos..]) {
                Ok((frame, used)) => {
                    frames.push(frame);
                    pos += used;
                }
                Err(_) => {
                    // Resync on the next preamble
                    match written[pos + 1..]
                        .windows(PREAMBLE.len())
                        .position(|w| w == PREAMBLE)
                    {
                        Some(skip) => pos += skip + 1,
                        None => break,
                    }
                }
            }
        }
        frames
    }
}

impl PortConnector for MockPorts {
    fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        let mut names: Vec<String> = self
            .ports
            .lock()
            .iter()
            .filter(|(_, p)| p.listed && !p.unplugged)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn open(&self, name: &str, _baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        let ports = self.ports.lock();
        match ports.get(name) {
            Some(p) if p.listed && !p.unplugged => Ok(Box::new(MockLink {
                ports: Arc::clone(&self.ports),
                name: name.to_string(),
                generation: p.generation,
            })),
            _ => Err(TransportError::DeviceNotFound(name.to_string())),
        }
    }
}

struct MockLink {
    ports: PortMap,
    name: String,
    generation: u64,
}

impl MockLink {
    fn with_port<T>(&self, f: impl FnOnce(&mut PortState) -> io::Result<T>) -> io::Result<T> {
        let mut ports = self.ports.lock();
        match ports.get_mut(&self.name) {
            Some(p) if !p.unplugged && p.generation == self.generation => f(p),
            _ => Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")),
        }
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.with_port(|p| {
            let n = p.rx.len().min(buf.len());
            for (dst, src) in buf.iter_mut().zip(p.rx.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        })?;
        if n == 0 {
            thread::sleep(Duration::from_millis(5));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        Ok(n)
    }
}

impl Write for MockLink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.with_port(|p| {
            p.written.extend_from_slice(data);
            Ok(data.len())
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_port(|_| Ok(()))
    }
}

impl SerialLink for MockLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(MockLink {
            ports: Arc::clone(&self.ports),
            name: self.name.clone(),
            generation: self.generation,
        }))
    }
}

// ── MQTT broker ──────────────────────────────────────────────────────

/// One publish seen by [`MockBroker`]
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Default)]
struct BrokerState {
    reachable: bool,
    online: bool,
    published: Vec<Published>,
    subscriptions: Vec<String>,
    sender: Option<Sender<LinkEvent>>,
    /// Publishes whose payload contains this text fail
    rejected: Option<String>,
}

/// In-memory broker connection
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Broker that accepts the connection immediately
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                ..Default::default()
            })),
        }
    }

    /// Broker that never acknowledges the connection
    pub fn unreachable() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    fn send(&self, event: LinkEvent) {
        if let Some(tx) = &self.state.lock().sender {
            let _ = tx.send(event);
        }
    }

    /// Deliver an inbound publish
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.send(LinkEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Drop the connection; publishes fail until [`MockBroker::restore`]
    pub fn go_offline(&self, reason: &str) {
        self.state.lock().online = false;
        self.send(LinkEvent::Disconnected(reason.to_string()));
    }

    pub fn restore(&self) {
        self.state.lock().online = true;
        self.send(LinkEvent::Connected);
    }

    /// Fail every publish whose payload contains `needle`
    pub fn reject_payloads_with(&self, needle: Option<&str>) {
        self.state.lock().rejected = needle.map(str::to_string);
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    /// Payloads published on `topic`, oldest first
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    pub fn clear(&self) {
        self.state.lock().published.clear();
    }
}

impl ControlConnector for MockBroker {
    fn connect(
        &self,
        _config: &NetworkConfig,
    ) -> Result<(Arc<dyn ControlLink>, Receiver<LinkEvent>), TransportError> {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock();
        if state.reachable {
            state.online = true;
            let _ = tx.send(LinkEvent::Connected);
        }
        state.sender = Some(tx);
        Ok((
            Arc::new(MockBrokerLink {
                state: Arc::clone(&self.state),
            }),
            rx,
        ))
    }
}

struct MockBrokerLink {
    state: Arc<Mutex<BrokerState>>,
}

impl ControlLink for MockBrokerLink {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        _delivery: Delivery,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.online {
            return Err(TransportError::Mqtt("not connected".into()));
        }
        if let Some(needle) = &state.rejected {
            if String::from_utf8_lossy(&payload).contains(needle.as_str()) {
                return Err(TransportError::Mqtt("publish rejected".into()));
            }
        }
        state.published.push(Published {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.subscriptions.iter().any(|t| t == topic) {
            state.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.online = false;
        state.sender = None;
        Ok(())
    }
}

// ── Whole transport ──────────────────────────────────────────────────

/// One call recorded by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Frame(Frame),
    State(DeviceState),
}

/// Transport that records everything it is asked to send
pub struct MockTransport {
    kind: TransportKind,
    events_tx: Sender<TransportEvent>,
    events_rx: Receiver<TransportEvent>,
    connected: AtomicBool,
    device: Mutex<Option<DeviceInfo>>,
    connect_error: Mutex<Option<String>>,
    sent: Mutex<Vec<Sent>>,
    update_requests: Mutex<Vec<DeviceInfo>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            kind,
            events_tx,
            events_rx,
            connected: AtomicBool::new(false),
            device: Mutex::new(None),
            connect_error: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            update_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_device(self, device: DeviceInfo) -> Self {
        *self.device.lock() = Some(device);
        self
    }

    pub fn set_device(&self, device: Option<DeviceInfo>) {
        *self.device.lock() = device;
    }

    /// Make the next `connect` calls fail
    pub fn fail_connect(&self, reason: Option<&str>) {
        *self.connect_error.lock() = reason.map(str::to_string);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Push an event as if the transport had produced it
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Frame(f) => Some(f.clone()),
                Sent::State(_) => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<DeviceState> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::State(st) => Some(*st),
                Sent::Frame(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn update_requests(&self) -> Vec<DeviceInfo> {
        self.update_requests.lock().clone()
    }

    /// Poll `check` until it holds or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check(self)
    }

    fn record(&self, sent: Sent) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().push(sent);
        Ok(())
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connect(&self) -> Result<Option<DeviceInfo>, TransportError> {
        if let Some(reason) = self.connect_error.lock().clone() {
            return Err(TransportError::DeviceNotFound(reason));
        }
        self.connected.store(true, Ordering::Release);
        Ok(self.device.lock().clone())
    }

    fn target_device(&self) -> Option<DeviceInfo> {
        self.device.lock().clone()
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        self.record(Sent::Frame(frame.clone()))
    }

    fn send_state(&self, state: &DeviceState) -> Result<(), TransportError> {
        self.record(Sent::State(*state))
    }

    fn events(&self) -> Receiver<TransportEvent> {
        self.events_rx.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn request_firmware_update(&self, device: &DeviceInfo) -> Result<(), TransportError> {
        self.update_requests.lock().push(device.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rgb;

    #[test]
    fn test_mock_link_dies_on_unplug() {
        let ports = MockPorts::new(&["COM1"]);
        let mut link = ports.open("COM1", 500_000).unwrap();
        link.write_all(b"abc").unwrap();
        ports.unplug("COM1");
        assert!(link.write_all(b"def").is_err());
        assert!(ports.open("COM1", 500_000).is_err());
        assert!(ports.list_ports().unwrap().is_empty());

        ports.replug("COM1");
        // The old handle stays dead, a new one works
        assert!(link.write_all(b"ghi").is_err());
        let mut fresh = ports.open("COM1", 500_000).unwrap();
        fresh.write_all(b"jkl").unwrap();
        assert_eq!(ports.written("COM1"), b"abcjkl");
    }

    #[test]
    fn test_mock_transport_records_in_order() {
        let t = MockTransport::new(TransportKind::Network);
        assert!(t.send_frame(&Frame::solid(1, Rgb::WHITE)).is_err());
        t.connect().unwrap();
        t.send_state(&DeviceState::off(65)).unwrap();
        t.send_frame(&Frame::solid(1, Rgb::WHITE)).unwrap();
        assert_eq!(
            t.sent(),
            vec![
                Sent::State(DeviceState::off(65)),
                Sent::Frame(Frame::solid(1, Rgb::WHITE))
            ]
        );
    }
}
