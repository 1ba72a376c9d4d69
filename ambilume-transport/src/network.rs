//! Network transport: MQTT control plane, UDP or MQTT data plane
//!
//! ```text
//!   send_state ──► {base}/set  (one message per device, MAC rewritten)
//!              └─► {base}/state (retained)
//!   send_frame ──► primary   (UDP {ip}:{port} or {base}/set/stream)
//!              └─► satellites (zone → reduce → orientation flip)
//!   {base}/fps heartbeats ──► DeviceRegistry + Telemetry events
//! ```
//!
//! The MQTT client sits behind [`ControlConnector`]/[`ControlLink`] so the
//! transport can be exercised against an in-memory broker.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device_registry::DeviceRegistry;
use crate::error::TransportError;
use crate::mqtt::{
    parse_inbound, FirmwareConfigMessage, Inbound, InstancesCommand, StateMessage, StreamMessage,
    Topics, UnsubscribeMessage, UpdateTrigger, DEFAULT_BASE_TOPIC,
};
use crate::protocol::timing;
use crate::types::{DeviceInfo, DeviceState, Frame, InstanceId, TransportEvent, TransportKind};
use crate::zones::{LedLayout, Satellite};
use crate::Transport;

/// Default UDP port of the device firmware
pub const DEFAULT_UDP_PORT: u16 = 4210;

/// Outage after which device state is no longer trusted
pub const RESTART_AFTER_SECS: u64 = 60;

/// Data plane used for color frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    #[default]
    Udp,
    Mqtt,
}

/// Network transport settings
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub base_topic: String,
    pub instance: InstanceId,
    pub stream: StreamKind,
    pub udp_port: u16,
    /// Device name, IP or MAC to stream to; first announced device if unset
    pub target: Option<String>,
    pub layout: LedLayout,
    pub satellites: Vec<Satellite>,
    pub handshake_timeout: Duration,
    pub reconnect_interval: Duration,
    pub restart_after: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "ambilume".to_string(),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            instance: InstanceId::PRIMARY,
            stream: StreamKind::default(),
            udp_port: DEFAULT_UDP_PORT,
            target: None,
            layout: LedLayout::default(),
            satellites: Vec::new(),
            handshake_timeout: Duration::from_millis(timing::HANDSHAKE_TIMEOUT_MS),
            reconnect_interval: Duration::from_millis(timing::RECONNECT_INTERVAL_MS),
            restart_after: Duration::from_secs(RESTART_AFTER_SECS),
        }
    }
}

// ── Control link ─────────────────────────────────────────────────────

/// Delivery guarantee of one publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fire and forget; dropped when the client queue is full
    AtMostOnce,
    AtLeastOnce,
}

/// What the MQTT connection reports
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
}

/// Publish/subscribe handle of one broker connection
pub trait ControlLink: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        delivery: Delivery,
    ) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn disconnect(&self) -> Result<(), TransportError>;
}

/// Opens broker connections
pub trait ControlConnector: Send + Sync {
    /// Start connecting. Connection state and inbound publishes arrive on the
    /// returned channel; the connection keeps retrying on its own.
    fn connect(
        &self,
        config: &NetworkConfig,
    ) -> Result<(Arc<dyn ControlLink>, Receiver<LinkEvent>), TransportError>;
}

#[cfg(feature = "mqtt")]
pub use rumqtt::RumqttConnector;

#[cfg(feature = "mqtt")]
mod rumqtt {
    use super::*;
    use rumqttc::{Client, Event, MqttOptions, Packet, QoS};

    /// Broker connection through `rumqttc`'s synchronous client
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RumqttConnector;

    struct RumqttLink {
        client: Client,
        stop: Arc<AtomicBool>,
    }

    impl ControlLink for RumqttLink {
        fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            retain: bool,
            delivery: Delivery,
        ) -> Result<(), TransportError> {
            match delivery {
                Delivery::AtMostOnce => {
                    self.client
                        .try_publish(topic, QoS::AtMostOnce, retain, payload)?
                }
                Delivery::AtLeastOnce => {
                    self.client
                        .publish(topic, QoS::AtLeastOnce, retain, payload)?
                }
            }
            Ok(())
        }

        fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.client.subscribe(topic, QoS::AtMostOnce)?;
            Ok(())
        }

        fn disconnect(&self) -> Result<(), TransportError> {
            self.stop.store(true, Ordering::Release);
            self.client.disconnect()?;
            Ok(())
        }
    }

    impl ControlConnector for RumqttConnector {
        fn connect(
            &self,
            config: &NetworkConfig,
        ) -> Result<(Arc<dyn ControlLink>, Receiver<LinkEvent>), TransportError> {
            let mut options =
                MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
            options.set_keep_alive(Duration::from_secs(5));
            options.set_clean_session(true);
            if let (Some(user), Some(pass)) = (&config.username, &config.password) {
                options.set_credentials(user.clone(), pass.clone());
            }

            let (client, mut connection) = Client::new(options, 64);
            let (tx, rx) = unbounded();
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = Arc::clone(&stop);
            let retry = config.reconnect_interval;

            thread::Builder::new()
                .name("mqtt-connection".into())
                .spawn(move || {
                    for notification in connection.iter() {
                        if thread_stop.load(Ordering::Acquire) {
                            break;
                        }
                        let event = match notification {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => LinkEvent::Connected,
                            Ok(Event::Incoming(Packet::Publish(p))) => LinkEvent::Message {
                                topic: p.topic.clone(),
                                payload: p.payload.to_vec(),
                            },
                            Ok(_) => continue,
                            Err(e) => {
                                if tx.send(LinkEvent::Disconnected(e.to_string())).is_err() {
                                    break;
                                }
                                // The next iteration reconnects
                                thread::sleep(retry);
                                continue;
                            }
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    debug!("MQTT connection thread exited");
                })?;

            Ok((Arc::new(RumqttLink { client, stop }), rx))
        }
    }
}

// ── UDP data plane ───────────────────────────────────────────────────

/// One long-lived UDP socket per destination
#[derive(Debug)]
pub struct UdpSessions {
    port: u16,
    sockets: Mutex<HashMap<String, UdpSocket>>,
}

impl UdpSessions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            sockets: Mutex::new(HashMap::new()),
        }
    }

    /// Send `payload` to `ip`. A failed session is dropped and recreated on
    /// the next send.
    pub fn send(&self, ip: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut sockets = self.sockets.lock();
        if !sockets.contains_key(ip) {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.connect((ip, self.port))?;
            socket.set_write_timeout(Some(Duration::from_millis(timing::IO_TIMEOUT_MS)))?;
            debug!("UDP session to {ip}:{} opened", self.port);
            sockets.insert(ip.to_string(), socket);
        }
        let result = match sockets.get(ip) {
            Some(socket) => socket.send(payload),
            None => return Err(TransportError::Internal("UDP session vanished".into())),
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                sockets.remove(ip);
                Err(e.into())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.lock().is_empty()
    }

    pub fn clear(&self) {
        self.sockets.lock().clear();
    }
}

// ── Transport ────────────────────────────────────────────────────────

struct Inner {
    config: NetworkConfig,
    topics: Topics,
    connector: Arc<dyn ControlConnector>,
    registry: Arc<DeviceRegistry>,
    events: Sender<TransportEvent>,
    link: Mutex<Option<Arc<dyn ControlLink>>>,
    udp: UdpSessions,
    connected: AtomicBool,
    lifecycle: AtomicU64,
    /// Signalled on the first broker connection / target announcement
    connected_tx: Mutex<Option<Sender<()>>>,
    device_tx: Mutex<Option<Sender<()>>>,
}

/// Wi-Fi device transport
pub struct NetworkTransport {
    inner: Arc<Inner>,
    events_rx: Receiver<TransportEvent>,
}

/// Connection bookkeeping of the event loop
struct Outage {
    started: Instant,
    restart_reported: bool,
}

impl Inner {
    fn link(&self) -> Result<Arc<dyn ControlLink>, TransportError> {
        self.link.lock().clone().ok_or(TransportError::Disconnected)
    }

    fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        message: &T,
        retain: bool,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message)?;
        self.link()?
            .publish(topic, payload, retain, Delivery::AtLeastOnce)
    }

    fn is_satellite(&self, device: &DeviceInfo) -> bool {
        self.config.satellites.iter().any(|s| {
            device.ip.as_deref() == Some(s.ip.as_str())
                || device.address.as_deref() == Some(s.ip.as_str())
        })
    }

    fn target_device(&self) -> Option<DeviceInfo> {
        match &self.config.target {
            Some(target) => self
                .registry
                .find_by_mac(target)
                .or_else(|| self.registry.find_by_address(target)),
            None => self
                .registry
                .all()
                .into_iter()
                .find(|d| d.kind == TransportKind::Network && !self.is_satellite(d)),
        }
    }

    fn subscribe_all(&self) {
        let Ok(link) = self.link() else {
            return;
        };
        for topic in self.topics.subscriptions() {
            if let Err(e) = link.subscribe(&topic) {
                warn!("Subscribing to {topic} failed: {e}");
            }
        }
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) {
        let inbound = match parse_inbound(&self.topics, topic, payload) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => return,
            Err(e) => {
                debug!("{e}");
                return;
            }
        };
        match inbound {
            Inbound::Heartbeat(hb) => {
                let merged = self.registry.upsert(hb.to_device_info());
                let _ = self.events.send(TransportEvent::Telemetry {
                    kind: TransportKind::Network,
                    address: merged.ip.clone(),
                    mac: merged.mac.clone(),
                });
                if self.target_device().is_some() {
                    if let Some(tx) = self.device_tx.lock().take() {
                        let _ = tx.try_send(());
                    }
                }
            }
            Inbound::UpdateResult(result) => {
                info!(
                    "Firmware update result from {}: {}",
                    result.mac.as_deref().unwrap_or("<any>"),
                    if result.success { "success" } else { "failure" }
                );
                let _ = self.events.send(TransportEvent::FirmwareUpdateResult {
                    mac: result.mac,
                    success: result.success,
                });
            }
            Inbound::Remote(command) => {
                debug!("Remote command: {command:?}");
                let _ = self.events.send(TransportEvent::Remote(command));
            }
        }
    }

    fn event_loop(self: Arc<Self>, link_events: Receiver<LinkEvent>, lifecycle: u64) {
        let mut outage: Option<Outage> = None;
        let mut ever_connected = false;

        while self.lifecycle.load(Ordering::Acquire) == lifecycle {
            let event = match link_events.recv_timeout(self.config.reconnect_interval) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if self.lifecycle.load(Ordering::Acquire) != lifecycle {
                break;
            }

            match event {
                Some(LinkEvent::Connected) => {
                    self.connected.store(true, Ordering::Release);
                    self.subscribe_all();
                    if let Some(tx) = self.connected_tx.lock().take() {
                        let _ = tx.try_send(());
                    }
                    if let Some(o) = outage.take() {
                        info!(
                            "MQTT connection to {} restored after {:.1}s",
                            self.config.host,
                            o.started.elapsed().as_secs_f32()
                        );
                        let _ = self.events.send(TransportEvent::Reconnected {
                            kind: TransportKind::Network,
                        });
                    } else if !ever_connected {
                        info!("Connected to MQTT broker {}:{}", self.config.host, self.config.port);
                    }
                    ever_connected = true;
                }
                Some(LinkEvent::Disconnected(reason)) => {
                    if self.connected.swap(false, Ordering::AcqRel) {
                        warn!("MQTT connection lost: {reason}");
                        outage = Some(Outage {
                            started: Instant::now(),
                            restart_reported: false,
                        });
                        let _ = self.events.send(TransportEvent::ConnectionLost {
                            kind: TransportKind::Network,
                            reason,
                        });
                    } else {
                        debug!("MQTT reconnect attempt failed: {reason}");
                    }
                }
                Some(LinkEvent::Message { topic, payload }) => {
                    self.handle_message(&topic, &payload);
                }
                None => {}
            }

            if let Some(o) = outage.as_mut() {
                let elapsed = o.started.elapsed();
                if !o.restart_reported && elapsed > self.config.restart_after {
                    o.restart_reported = true;
                    warn!(
                        "MQTT outage lasted {:.0}s, requesting full restart",
                        elapsed.as_secs_f32()
                    );
                    let _ = self.events.send(TransportEvent::RestartRequired {
                        kind: TransportKind::Network,
                        elapsed,
                    });
                }
            }
        }
        debug!("Network event loop exited");
    }

    /// Send one frame on the data plane of `device`.
    fn stream_to(&self, device: &DeviceInfo, frame: &Frame) -> Result<(), TransportError> {
        match self.config.stream {
            StreamKind::Udp => {
                let ip = device
                    .ip
                    .as_deref()
                    .ok_or_else(|| TransportError::DeviceNotFound(device.label()))?;
                self.udp.send(ip, &frame.to_rgb_bytes())
            }
            StreamKind::Mqtt => {
                let payload = serde_json::to_vec(&StreamMessage::from_frame(frame, device.mac.clone()))?;
                self.link()?
                    .publish(&self.topics.stream(), payload, false, Delivery::AtMostOnce)
            }
        }
    }

    /// Satellites currently known to the registry
    fn resolved_satellites(&self) -> Vec<(&Satellite, DeviceInfo)> {
        self.config
            .satellites
            .iter()
            .filter_map(|sat| match self.registry.find_by_address(&sat.ip) {
                Some(device) => Some((sat, device)),
                None => {
                    debug!("Satellite {} not announced yet, skipping", sat.ip);
                    None
                }
            })
            .collect()
    }
}

impl NetworkTransport {
    pub fn new(
        config: NetworkConfig,
        connector: Arc<dyn ControlConnector>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        let (events, events_rx) = unbounded();
        let topics = Topics::new(config.base_topic.clone(), config.instance);
        let udp = UdpSessions::new(config.udp_port);
        Self {
            inner: Arc::new(Inner {
                config,
                topics,
                connector,
                registry,
                events,
                link: Mutex::new(None),
                udp,
                connected: AtomicBool::new(false),
                lifecycle: AtomicU64::new(0),
                connected_tx: Mutex::new(None),
                device_tx: Mutex::new(None),
            }),
            events_rx,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.inner.topics
    }

    /// Push pin/strip settings to a device
    pub fn send_firmware_config(&self, message: &FirmwareConfigMessage) -> Result<(), TransportError> {
        self.inner
            .publish_json(&self.inner.topics.firmware_config(), message, false)
    }

    /// Tell devices to stop listening on the stream topic
    pub fn unsubscribe_stream(&self) -> Result<(), TransportError> {
        let message = UnsubscribeMessage {
            instance: self.inner.config.instance.0,
        };
        self.inner
            .publish_json(&self.inner.topics.unsubscribe(), &message, false)
    }
}

impl Transport for NetworkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn connect(&self) -> Result<Option<DeviceInfo>, TransportError> {
        let inner = &self.inner;
        let lifecycle = inner.lifecycle.fetch_add(1, Ordering::AcqRel) + 1;

        let (connected_tx, connected_rx) = bounded(1);
        let (device_tx, device_rx) = bounded(1);
        *inner.connected_tx.lock() = Some(connected_tx);
        *inner.device_tx.lock() = Some(device_tx);

        let (link, link_events) = inner.connector.connect(&inner.config)?;
        *inner.link.lock() = Some(link);

        let loop_inner = Arc::clone(inner);
        thread::Builder::new()
            .name("mqtt-events".into())
            .spawn(move || loop_inner.event_loop(link_events, lifecycle))?;

        let timeout = inner.config.handshake_timeout;
        if connected_rx.recv_timeout(timeout).is_err() {
            warn!(
                "No MQTT connection to {}:{} within {:?}",
                inner.config.host, inner.config.port, timeout
            );
            let _ = self.close();
            return Err(TransportError::Timeout);
        }

        if inner.target_device().is_none() && device_rx.recv_timeout(timeout).is_err() {
            debug!("No device announced itself within {timeout:?}");
        }
        inner.device_tx.lock().take();
        Ok(inner.target_device())
    }

    fn target_device(&self) -> Option<DeviceInfo> {
        self.inner.target_device()
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::Acquire) && inner.config.stream == StreamKind::Mqtt {
            return Err(TransportError::Disconnected);
        }
        let primary = inner
            .target_device()
            .ok_or_else(|| TransportError::DeviceNotFound("no target device".into()))?;
        inner.stream_to(&primary, frame)?;

        for (sat, device) in inner.resolved_satellites() {
            let sub = sat.frame_for(&inner.config.layout, frame);
            if let Err(e) = inner.stream_to(&device, &sub) {
                debug!("Frame to satellite {} failed: {e}", sat.ip);
            }
        }
        Ok(())
    }

    fn send_state(&self, state: &DeviceState) -> Result<(), TransportError> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        let primary_mac = inner.target_device().and_then(|d| d.mac);
        let mut message = StateMessage::from_state(state, primary_mac);
        if inner.config.instance.is_primary() {
            message = message.with_instances(if state.on {
                InstancesCommand::Play
            } else {
                InstancesCommand::Stop
            });
        }

        let set = inner.topics.set();
        inner.publish_json(&set, &message, false)?;
        for (sat, device) in inner.resolved_satellites() {
            let Some(mac) = device.mac else {
                debug!("Satellite {} has no MAC yet, skipping state", sat.ip);
                continue;
            };
            // A missing satellite must not keep the primary from its state
            if let Err(e) = inner.publish_json(&set, &message.with_mac(mac), false) {
                warn!("State for satellite {} not published: {e}", sat.ip);
            }
        }
        inner.publish_json(&inner.topics.state(), &message, true)?;

        if !state.on && inner.config.stream == StreamKind::Mqtt {
            self.unsubscribe_stream()?;
        }
        Ok(())
    }

    fn events(&self) -> Receiver<TransportEvent> {
        self.events_rx.clone()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        inner.lifecycle.fetch_add(1, Ordering::AcqRel);
        inner.connected.store(false, Ordering::Release);
        inner.udp.clear();
        if let Some(link) = inner.link.lock().take() {
            link.disconnect()?;
        }
        debug!("Network transport closed");
        Ok(())
    }

    fn request_firmware_update(&self, device: &DeviceInfo) -> Result<(), TransportError> {
        let mac = device
            .mac
            .clone()
            .ok_or_else(|| TransportError::DeviceNotFound(device.label()))?;
        info!("Requesting firmware update on {mac}");
        self.inner
            .publish_json(&self.inner.topics.update(), &UpdateTrigger::new(mac), false)
    }
}

impl Drop for NetworkTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
