//! USB-serial transport
//!
//! Each LED frame goes out as one self-contained wire frame (see
//! [`crate::protocol`]). A reader thread turns the firmware's telemetry lines
//! into registry updates. When the port disappears the transport reconnects
//! on its own and only escalates once the outage outlasts the grace window.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device_registry::DeviceRegistry;
use crate::error::TransportError;
use crate::event_parser::{parse_line, LineBuffer, TelemetryLine};
use crate::protocol::{baud, timing, SerialHeader, MAX_LEDS};
use crate::types::{DeviceInfo, DeviceState, Frame, Rgb, TransportEvent, TransportKind};
use crate::Transport;

/// Port name that selects the first enumerated port
pub const AUTO_PORT: &str = "AUTO";

/// Raw byte link to one opened port
///
/// Reads return `ErrorKind::TimedOut` (or `Ok(0)`) when nothing arrived
/// within the port timeout.
pub trait SerialLink: Read + Write + Send {
    /// Independent handle to the same port (reader and writer side)
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;
}

/// Enumerates and opens serial ports
pub trait PortConnector: Send + Sync {
    fn list_ports(&self) -> Result<Vec<String>, TransportError>;

    fn open(&self, name: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError>;
}

#[cfg(feature = "serial")]
impl SerialLink for Box<dyn serialport::SerialPort> {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let clone = serialport::SerialPort::try_clone(self.as_ref())?;
        Ok(Box::new(clone))
    }
}

/// Ports of the host, via the `serialport` crate
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SystemPorts {
    timeout: Duration,
}

#[cfg(feature = "serial")]
impl Default for SystemPorts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(timing::IO_TIMEOUT_MS),
        }
    }
}

#[cfg(feature = "serial")]
impl SystemPorts {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[cfg(feature = "serial")]
impl PortConnector for SystemPorts {
    fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect())
    }

    fn open(&self, name: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        let port = serialport::new(name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        info!("Opened serial port: {} at {} baud", name, baud_rate);
        Ok(Box::new(port))
    }
}

/// Serial transport settings
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name, or [`AUTO_PORT`]
    pub port: String,
    pub baud_rate: u32,
    /// LED count used for state frames
    pub led_count: usize,
    /// Settings carried in every frame header
    pub header: SerialHeader,
    pub handshake_timeout: Duration,
    pub reconnect_interval: Duration,
    pub outage_grace: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: AUTO_PORT.to_string(),
            baud_rate: baud::DEFAULT,
            led_count: 0,
            header: SerialHeader::default(),
            handshake_timeout: Duration::from_millis(timing::HANDSHAKE_TIMEOUT_MS),
            reconnect_interval: Duration::from_millis(timing::RECONNECT_INTERVAL_MS),
            outage_grace: Duration::from_secs(timing::OUTAGE_GRACE_SECS),
        }
    }
}

/// Sleep up to `total`, returning early once `stop` says so.
fn sleep_unless(total: Duration, stop: impl Fn() -> bool) {
    let step = Duration::from_millis(20);
    let deadline = Instant::now() + total;
    while !stop() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(step.min(deadline - now));
    }
}

struct Inner {
    config: SerialConfig,
    connector: Arc<dyn PortConnector>,
    registry: Arc<DeviceRegistry>,
    events: Sender<TransportEvent>,
    writer: Mutex<Option<Box<dyn SerialLink>>>,
    port_name: Mutex<Option<String>>,
    header: Mutex<SerialHeader>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    ambiguity_warned: AtomicBool,
    /// Bumped by every connect/close; background loops of an older
    /// lifecycle exit.
    lifecycle: AtomicU64,
    /// Bumped by every opened session; readers of an older session exit.
    session: AtomicU64,
    handshake: Mutex<Option<Sender<()>>>,
}

/// USB-serial transport
pub struct SerialTransport {
    inner: Arc<Inner>,
    events_rx: Receiver<TransportEvent>,
}

impl SerialTransport {
    pub fn new(
        config: SerialConfig,
        connector: Arc<dyn PortConnector>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        let (events, events_rx) = unbounded();
        let header = SerialHeader {
            baud_code: baud::code(config.baud_rate).unwrap_or(config.header.baud_code),
            ..config.header
        };
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                registry,
                events,
                writer: Mutex::new(None),
                port_name: Mutex::new(None),
                header: Mutex::new(header),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                ambiguity_warned: AtomicBool::new(false),
                lifecycle: AtomicU64::new(0),
                session: AtomicU64::new(0),
                handshake: Mutex::new(None),
            }),
            events_rx,
        }
    }

    /// Port of the current (or last) session
    pub fn port_name(&self) -> Option<String> {
        self.inner.port_name.lock().clone()
    }

    fn write_frame(&self, frame: &Frame, header: &SerialHeader) -> Result<(), TransportError> {
        if frame.len() > MAX_LEDS {
            return Err(TransportError::FrameTooLarge {
                leds: frame.len(),
                max: MAX_LEDS,
            });
        }
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        // No frames before the device behind the port reported its version
        if self.inner.handshake.lock().is_some() {
            return Err(TransportError::Disconnected);
        }

        let bytes = header.encode_frame(frame);
        let result = {
            let mut writer = self.inner.writer.lock();
            match writer.as_mut() {
                Some(link) => link.write_all(&bytes).and_then(|_| link.flush()),
                None => return Err(TransportError::Disconnected),
            }
        };

        result.map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                let _ = self.inner.events.send(TransportEvent::FrameAckTimeout {
                    kind: TransportKind::Serial,
                });
            }
            Inner::link_failed(&self.inner, &format!("write failed: {e}"));
            match e.kind() {
                io::ErrorKind::TimedOut => TransportError::Timeout,
                _ => TransportError::Io(e),
            }
        })
    }
}

impl Inner {
    /// Resolve the configured port, enumerating under AUTO.
    fn select_port(&self) -> Result<String, TransportError> {
        if !self.config.port.eq_ignore_ascii_case(AUTO_PORT) {
            return Ok(self.config.port.clone());
        }
        let ports = self.connector.list_ports()?;
        match ports.as_slice() {
            [] => Err(TransportError::DeviceNotFound(
                "no serial ports found".to_string(),
            )),
            [only] => Ok(only.clone()),
            [first, ..] => {
                if !self.ambiguity_warned.swap(true, Ordering::AcqRel) {
                    warn!(
                        "Multiple serial ports found ({}), using {}",
                        ports.join(", "),
                        first
                    );
                }
                Ok(first.clone())
            }
        }
    }

    /// Open the port and start its reader.
    fn open_session(self: &Arc<Self>) -> Result<String, TransportError> {
        let name = self.select_port()?;
        let link = self.connector.open(&name, self.config.baud_rate)?;
        let reader = link.try_clone_link()?;

        let mut info = DeviceInfo::new(TransportKind::Serial).with_address(name.clone());
        info.baud_rate = Some(self.config.baud_rate);
        self.registry.upsert(info);

        let session = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        *self.writer.lock() = Some(link);
        *self.port_name.lock() = Some(name.clone());
        self.connected.store(true, Ordering::Release);

        let inner = Arc::clone(self);
        let port = name.clone();
        thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || inner.read_loop(reader, port, session))?;
        Ok(name)
    }

    fn read_loop(self: Arc<Self>, mut link: Box<dyn SerialLink>, port: String, session: u64) {
        let mut lines = LineBuffer::new();
        let mut buf = [0u8; 256];
        debug!("Serial reader started on {port}");

        while self.session.load(Ordering::Acquire) == session {
            let n = match link.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.session.load(Ordering::Acquire) == session {
                        Self::link_failed(&self, &format!("read failed: {e}"));
                    }
                    break;
                }
            };
            if n == 0 {
                continue;
            }
            for line in lines.push(&buf[..n]) {
                self.handle_line(&port, &line);
            }
        }
        debug!("Serial reader on {port} exited");
    }

    fn handle_line(&self, port: &str, line: &str) {
        let Some(parsed) = parse_line(line) else {
            return;
        };
        let mut update = DeviceInfo::new(TransportKind::Serial).with_address(port);
        parsed.apply(&mut update);
        let merged = self.registry.upsert(update);

        if let TelemetryLine::Version(v) = parsed {
            debug!("{port} reports firmware {v}");
            if let Some(tx) = self.handshake.lock().take() {
                let _ = tx.try_send(());
            }
        }
        let _ = self.events.send(TransportEvent::Telemetry {
            kind: TransportKind::Serial,
            address: Some(port.to_string()),
            mac: merged.mac,
        });
    }

    /// Tear down the current session and start reconnecting. Only the first
    /// failure of a session acts.
    fn link_failed(this: &Arc<Self>, reason: &str) {
        if !this.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        this.session.fetch_add(1, Ordering::AcqRel);
        *this.writer.lock() = None;

        let port = this.port_name.lock().clone().unwrap_or_default();
        warn!("Serial link to {port} lost: {reason}");
        let _ = this.events.send(TransportEvent::ConnectionLost {
            kind: TransportKind::Serial,
            reason: reason.to_string(),
        });

        if this.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(this);
        let lifecycle = this.lifecycle.load(Ordering::Acquire);
        let spawned = thread::Builder::new()
            .name("serial-reconnect".into())
            .spawn(move || inner.reconnect_loop(lifecycle));
        if let Err(e) = spawned {
            this.reconnecting.store(false, Ordering::Release);
            let _ = this.events.send(TransportEvent::Fatal {
                kind: TransportKind::Serial,
                reason: format!("cannot spawn reconnect thread: {e}"),
            });
        }
    }

    fn reconnect_loop(self: Arc<Self>, lifecycle: u64) {
        let started = Instant::now();
        let mut outage_reported = false;
        let stale = || self.lifecycle.load(Ordering::Acquire) != lifecycle;

        loop {
            sleep_unless(self.config.reconnect_interval, &stale);
            if stale() {
                break;
            }
            // The device behind the port may have changed; read its version
            // again before anyone streams to it
            let (tx, rx) = bounded(1);
            *self.handshake.lock() = Some(tx);
            match self.open_session() {
                Ok(port) => {
                    if rx.recv_timeout(self.config.handshake_timeout).is_err() {
                        debug!("{port} did not report a firmware version after reconnecting");
                    }
                    self.handshake.lock().take();
                    if stale() {
                        break;
                    }
                    if !self.connected.load(Ordering::Acquire) {
                        debug!("{port} dropped again during the handshake");
                        continue;
                    }
                    info!(
                        "Serial link to {port} restored after {:.1}s",
                        started.elapsed().as_secs_f32()
                    );
                    let _ = self.events.send(TransportEvent::Reconnected {
                        kind: TransportKind::Serial,
                    });
                    break;
                }
                Err(e) => {
                    self.handshake.lock().take();
                    debug!("Serial reconnect attempt failed: {e}");
                    let elapsed = started.elapsed();
                    if !outage_reported && elapsed > self.config.outage_grace {
                        warn!("Serial outage exceeded {:?}", self.config.outage_grace);
                        outage_reported = true;
                        let _ = self.events.send(TransportEvent::OutageExceeded {
                            kind: TransportKind::Serial,
                            elapsed,
                        });
                    }
                }
            }
        }
        self.reconnecting.store(false, Ordering::Release);
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn connect(&self) -> Result<Option<DeviceInfo>, TransportError> {
        let inner = &self.inner;
        inner.lifecycle.fetch_add(1, Ordering::AcqRel);

        let (tx, rx) = bounded(1);
        *inner.handshake.lock() = Some(tx);
        let port = inner.open_session()?;

        if rx.recv_timeout(inner.config.handshake_timeout).is_err() {
            // Legacy firmware never reports a version; it is trusted
            warn!(
                "{port} did not report a firmware version within {:?}",
                inner.config.handshake_timeout
            );
        }
        inner.handshake.lock().take();
        Ok(self.target_device())
    }

    fn target_device(&self) -> Option<DeviceInfo> {
        let port = self.inner.port_name.lock().clone()?;
        self.inner.registry.find_by_address(&port)
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let header = *self.inner.header.lock();
        self.write_frame(frame, &header)
    }

    fn send_state(&self, state: &DeviceState) -> Result<(), TransportError> {
        let header = {
            let mut header = self.inner.header.lock();
            header.effect = state.effect;
            header.white_temp = state.white_temp;
            header.brightness = if state.on { state.brightness } else { 0 };
            *header
        };
        let color = if state.on { state.color } else { Rgb::BLACK };
        self.write_frame(&Frame::solid(self.inner.config.led_count, color), &header)
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
        inner.session.fetch_add(1, Ordering::AcqRel);
        inner.connected.store(false, Ordering::Release);
        if let Some(mut link) = inner.writer.lock().take() {
            let _ = link.flush();
        }
        debug!("Serial transport closed");
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
