//! Pipeline manager: lifecycle state machine of the capture-to-device stream
//!
//! ```text
//!            start()                gate passed
//!  Stopped ──────────► Starting ─────────────────► Running
//!     ▲                  │  │                        │
//!     │   config/connect │  │ outdated firmware      │ stop(), outage,
//!     │   error          │  ▼                        │ fatal error
//!     ├──────────────────┘  FirmwareGateFailed       ▼
//!     │                     (re-checked on telemetry Stopping
//!     │                      and on a timer)         │
//!     │                          ▲                   │
//!     │                          └── reconnected to ─┤
//!     │                              a device that   │
//!     │                              fails the gate  │
//!     └──────────────────────────────────────────────┘
//! ```
//!
//! Transitions run under one mutex. Overlapping `start`/`stop` calls are
//! coalesced: the second caller gets the current state back without doing
//! any work. Transport events are handled on the "pipeline-events" thread.

pub mod dispatch;
pub mod firmware;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ambilume_transport::{
    DeviceInfo, DeviceRegistry, Effect, FirmwareVersion, InstanceId, RemoteCommand,
    SharedTransport, TransportError, TransportEvent, TransportKind,
};
use crossbeam_channel::{select, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureError, CapturePool, PoolSettings, SharedSource};
use crate::config::{Config, ConfigError};
use crate::frame_queue::FrameQueue;
use crate::power_saving::PowerSavingMonitor;
use crate::processor::{AspectRatio, ColorProcessor, ProcessError, Smoothing};
use crate::stats::{should_log, Counters, PipelineStats};

use dispatch::Consumer;
use firmware::{GateDecision, GateState};

/// Lifecycle state of a [`PipelineManager`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PipelineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    FirmwareGateFailed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::FirmwareGateFailed => "firmware gate failed",
        })
    }
}

/// Errors returned by pipeline transitions
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LED geometry error: {0}")]
    Geometry(#[from] ProcessError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Outdated or unknown firmware, or no device yet
    #[error("firmware gate: {0}")]
    FirmwareGate(String),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("{0} support not compiled in")]
    Unsupported(&'static str),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything a pipeline is built from
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub registry: Arc<DeviceRegistry>,
    pub instance: InstanceId,
}

impl PipelineContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(DeviceRegistry::new()),
            instance: InstanceId::PRIMARY,
        }
    }

    pub fn with_registry(mut self, registry: Arc<DeviceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_instance(mut self, instance: InstanceId) -> Self {
        self.instance = instance;
        self
    }
}

/// Build the transport selected by `[device] output`.
pub fn build_transport(context: &PipelineContext) -> Result<SharedTransport, PipelineError> {
    match context.config.device.output {
        TransportKind::Serial => serial_transport(context),
        TransportKind::Network => network_transport(context),
    }
}

#[cfg(feature = "serial")]
fn serial_transport(context: &PipelineContext) -> Result<SharedTransport, PipelineError> {
    use ambilume_transport::{SerialTransport, SystemPorts};
    Ok(Arc::new(SerialTransport::new(
        context.config.serial_config(),
        Arc::new(SystemPorts::default()),
        Arc::clone(&context.registry),
    )))
}

#[cfg(not(feature = "serial"))]
fn serial_transport(_context: &PipelineContext) -> Result<SharedTransport, PipelineError> {
    Err(PipelineError::Unsupported("serial"))
}

#[cfg(feature = "mqtt")]
fn network_transport(context: &PipelineContext) -> Result<SharedTransport, PipelineError> {
    use ambilume_transport::network::RumqttConnector;
    use ambilume_transport::NetworkTransport;
    Ok(Arc::new(NetworkTransport::new(
        context.config.network_config(context.instance),
        Arc::new(RumqttConnector),
        Arc::clone(&context.registry),
    )))
}

#[cfg(not(feature = "mqtt"))]
fn network_transport(_context: &PipelineContext) -> Result<SharedTransport, PipelineError> {
    Err(PipelineError::Unsupported("mqtt"))
}

/// Holds a guard flag for the duration of a transition
struct Busy<'a>(&'a AtomicBool);

impl<'a> Busy<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Workers owned by a running pipeline
#[derive(Default)]
struct Workers {
    capture: Option<CapturePool>,
    consumer: Option<Consumer>,
}

struct Shared {
    context: PipelineContext,
    transport: SharedTransport,
    source: SharedSource,
    processor: Arc<Mutex<ColorProcessor>>,
    queue: FrameQueue,
    counters: Arc<Counters>,
    /// Transition lock
    workers: Mutex<Workers>,
    state: RwLock<PipelineState>,
    effect: Mutex<Effect>,
    gate: Mutex<GateState>,
    starting: AtomicBool,
    stopping: AtomicBool,
    /// Stopped because of an outage; start again once the link is back
    resume_on_reconnect: AtomicBool,
    /// The resume needs a fresh handshake
    rehandshake: AtomicBool,
    ack_timeouts: AtomicU64,
}

/// Owns the pipeline lifecycle
pub struct PipelineManager {
    shared: Arc<Shared>,
    shutdown: Option<Sender<()>>,
    events_thread: Option<JoinHandle<()>>,
}

impl PipelineManager {
    pub fn new(
        context: PipelineContext,
        transport: SharedTransport,
        source: SharedSource,
    ) -> Result<Self, PipelineError> {
        let config = &context.config;
        config.validate()?;
        let processor = ColorProcessor::new(config.geometry(), config.calibration());
        let poll = Duration::from_millis(config.firmware.poll_interval_ms.max(10));
        let events = transport.events();

        let shared = Arc::new(Shared {
            processor: Arc::new(Mutex::new(processor)),
            queue: FrameQueue::default(),
            counters: Arc::new(Counters::default()),
            workers: Mutex::new(Workers::default()),
            state: RwLock::new(PipelineState::Stopped),
            effect: Mutex::new(Effect::Solid),
            gate: Mutex::new(GateState::default()),
            starting: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            resume_on_reconnect: AtomicBool::new(false),
            rehandshake: AtomicBool::new(false),
            ack_timeouts: AtomicU64::new(0),
            context,
            transport,
            source,
        });

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let loop_shared = Arc::clone(&shared);
        let events_thread = thread::Builder::new()
            .name("pipeline-events".into())
            .spawn(move || loop_shared.event_loop(events, shutdown_rx, poll))?;

        Ok(Self {
            shared,
            shutdown: Some(shutdown_tx),
            events_thread: Some(events_thread),
        })
    }

    /// Manager streaming over the transport `[device] output` selects
    pub fn from_config(context: PipelineContext, source: SharedSource) -> Result<Self, PipelineError> {
        let transport = build_transport(&context)?;
        Self::new(context, transport, source)
    }

    /// Connect, check the firmware gate and start streaming.
    ///
    /// A closed firmware gate returns [`PipelineError::FirmwareGate`] and
    /// leaves the manager in [`PipelineState::FirmwareGateFailed`], from
    /// where it starts on its own once a compatible device shows up.
    pub fn start(&self) -> Result<PipelineState, PipelineError> {
        self.shared.start()
    }

    /// Stop streaming, optionally switching the device off.
    pub fn stop(&self, publish_state: bool) -> PipelineState {
        self.shared.resume_on_reconnect.store(false, Ordering::Release);
        self.shared.stop(publish_state)
    }

    /// `stop(false)` followed by `start()`; `callback` gets the final state.
    pub fn restart<F: FnOnce(PipelineState)>(&self, callback: F) -> PipelineState {
        let state = self.shared.restart();
        callback(state);
        state
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    /// Effect the pipeline last put the device in
    pub fn effect(&self) -> Effect {
        *self.shared.effect.lock()
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.shared.transport
    }

    pub fn context(&self) -> &PipelineContext {
        &self.shared.context
    }

    /// Stop the event loop and the pipeline, then close the transport.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the event loop
        self.shutdown.take();
        if let Some(handle) = self.events_thread.take() {
            if handle.join().is_err() {
                warn!("Pipeline event thread panicked");
            }
        }
        self.shared.resume_on_reconnect.store(false, Ordering::Release);
        self.shared.stop(false);
        if let Err(e) = self.shared.transport.close() {
            debug!("Closing {} transport: {e}", self.shared.transport.kind());
        }
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        if self.events_thread.is_some() {
            self.shutdown();
        }
    }
}

impl Shared {
    fn state(&self) -> PipelineState {
        *self.state.read()
    }

    fn set_state(&self, state: PipelineState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Pipeline {previous} -> {state}");
        }
    }

    fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    fn minimum_firmware(&self) -> Result<FirmwareVersion, PipelineError> {
        Ok(self.context.config.minimum_firmware()?)
    }

    fn start(&self) -> Result<PipelineState, PipelineError> {
        let Some(_busy) = Busy::enter(&self.starting) else {
            debug!("start() already in progress");
            return Ok(self.state());
        };
        let mut workers = self.workers.lock();
        if self.state() == PipelineState::Running {
            return Ok(PipelineState::Running);
        }
        self.set_state(PipelineState::Starting);

        if let Err(e) = self.prepare() {
            error!("Pipeline not started: {e}");
            self.set_state(PipelineState::Stopped);
            return Err(e);
        }

        let kind = self.kind();
        let device = if self.transport.is_connected() {
            self.transport.target_device()
        } else {
            match self.transport.connect() {
                Ok(device) => device.or_else(|| self.transport.target_device()),
                Err(e) => {
                    error!("Could not connect {kind} transport: {e}");
                    self.set_state(PipelineState::Stopped);
                    return Err(e.into());
                }
            }
        };

        self.open_gate(&mut workers, device)
    }

    /// Configuration checks that must pass before anything is connected
    fn prepare(&self) -> Result<(), PipelineError> {
        self.minimum_firmware()?;
        let (width, height) = self.source.size();
        self.processor.lock().validate(width, height)?;
        Ok(())
    }

    /// Evaluate the firmware gate for `device` and enter Running if it
    /// passes.
    fn open_gate(
        &self,
        workers: &mut Workers,
        device: Option<DeviceInfo>,
    ) -> Result<PipelineState, PipelineError> {
        let kind = self.kind();
        let minimum = self.minimum_firmware()?;
        let decision = {
            let gate = self.gate.lock();
            firmware::evaluate(kind, device.as_ref(), &minimum, &gate.updated)
        };

        if let GateDecision::Pass(device) = &decision {
            self.gate.lock().clear_diagnostic();
            info!("Streaming to {} over {kind}", device.label());
            self.enter_running(workers)?;
            return Ok(PipelineState::Running);
        }

        Err(self.gate_closed(&decision))
    }

    /// Record a failed gate decision and park in FirmwareGateFailed
    fn gate_closed(&self, decision: &GateDecision) -> PipelineError {
        let diagnostic = decision.to_string();
        if self.gate.lock().note(&diagnostic) {
            warn!("Firmware gate closed ({}): {diagnostic}", self.kind());
        }
        if let GateDecision::Outdated { device, .. } = decision {
            self.request_update(device);
        }
        self.set_state(PipelineState::FirmwareGateFailed);
        PipelineError::FirmwareGate(diagnostic)
    }

    fn request_update(&self, device: &DeviceInfo) {
        if !self.context.config.firmware.auto_update {
            return;
        }
        if !self.gate.lock().request_update(device) {
            return;
        }
        match self.transport.request_firmware_update(device) {
            Ok(()) => info!("Firmware update requested on {}", device.label()),
            Err(e) => warn!("Cannot trigger firmware update on {}: {e}", device.label()),
        }
    }

    fn enter_running(&self, workers: &mut Workers) -> Result<(), PipelineError> {
        let config = &self.context.config;
        let on = config.on_state();

        self.queue.drain();
        self.processor.lock().reset();
        if let Err(e) = self.transport.send_state(&on) {
            warn!("Failed to send on state over {}: {e}", self.kind());
        }
        *self.effect.lock() = on.effect;

        let monitor =
            PowerSavingMonitor::new(config.power_saving.enabled, config.power_saving_threshold());
        let consumer = match Consumer::spawn(
            self.queue.clone(),
            Arc::clone(&self.transport),
            monitor,
            on,
            Arc::clone(&self.counters),
        ) {
            Ok(consumer) => consumer,
            Err(e) => {
                self.abort_start();
                return Err(e.into());
            }
        };

        let settings = PoolSettings {
            threads: config.capture.threads,
            fps: config.capture.fps,
        };
        let capture = match CapturePool::start(
            Arc::clone(&self.source),
            Arc::clone(&self.processor),
            self.queue.clone(),
            Arc::clone(&self.counters),
            settings,
        ) {
            Ok(capture) => capture,
            Err(e) => {
                consumer.stop();
                self.abort_start();
                return Err(e.into());
            }
        };

        workers.consumer = Some(consumer);
        workers.capture = Some(capture);
        self.set_state(PipelineState::Running);
        Ok(())
    }

    fn abort_start(&self) {
        *self.effect.lock() = Effect::Solid;
        self.set_state(PipelineState::Stopped);
    }

    fn stop(&self, publish_state: bool) -> PipelineState {
        let Some(_busy) = Busy::enter(&self.stopping) else {
            debug!("stop() already in progress");
            return self.state();
        };
        let mut workers = self.workers.lock();
        match self.state() {
            PipelineState::Stopped => return PipelineState::Stopped,
            PipelineState::FirmwareGateFailed => {
                self.gate.lock().clear_diagnostic();
                self.set_state(PipelineState::Stopped);
                return PipelineState::Stopped;
            }
            _ => {}
        }
        self.set_state(PipelineState::Stopping);
        self.teardown(&mut workers, publish_state);
        self.set_state(PipelineState::Stopped);
        PipelineState::Stopped
    }

    /// Stop the workers and reset counters; the caller sets the next state
    fn teardown(&self, workers: &mut Workers, publish_state: bool) {
        if let Some(capture) = workers.capture.take() {
            capture.stop();
        }
        if let Some(consumer) = workers.consumer.take() {
            consumer.stop();
        }
        let drained = self.queue.drain();
        if drained > 0 {
            debug!("Dropped {drained} queued frames");
        }

        if publish_state {
            if let Err(e) = self.transport.send_state(&self.context.config.off_state()) {
                warn!("Failed to send off state over {}: {e}", self.kind());
            }
        }

        let stats = self.counters.snapshot();
        info!(
            "Pipeline stopped after {} frames sent ({} suppressed, {} dropped)",
            stats.frames_sent, stats.frames_suppressed, stats.frames_dropped
        );
        self.counters.reset();
        *self.effect.lock() = Effect::Solid;
    }

    fn restart(&self) -> PipelineState {
        self.stop(false);
        match self.start() {
            Ok(state) => state,
            Err(e) => {
                warn!("Restart did not reach running: {e}");
                self.state()
            }
        }
    }

    /// Re-check a closed firmware gate against the current target device
    fn retry_gate(&self) {
        if self.state() != PipelineState::FirmwareGateFailed {
            return;
        }
        let Some(_busy) = Busy::enter(&self.starting) else {
            return;
        };
        let mut workers = self.workers.lock();
        if self.state() != PipelineState::FirmwareGateFailed {
            return;
        }
        let device = self.transport.target_device();
        match self.open_gate(&mut workers, device) {
            Ok(_) => info!("Firmware gate passed, pipeline running"),
            Err(PipelineError::FirmwareGate(_)) => {}
            Err(e) => error!("Pipeline not started after firmware gate: {e}"),
        }
    }

    /// Run the firmware gate again after the link came back while running.
    ///
    /// The device on the other end may have been swapped or reflashed.
    fn revalidate(&self) {
        let Some(_busy) = Busy::enter(&self.starting) else {
            return;
        };
        let mut workers = self.workers.lock();
        if self.state() != PipelineState::Running {
            return;
        }
        let kind = self.kind();
        let minimum = match self.minimum_firmware() {
            Ok(minimum) => minimum,
            Err(e) => {
                error!("Cannot re-check firmware gate: {e}");
                return;
            }
        };
        let device = self.transport.target_device();
        let decision = {
            let gate = self.gate.lock();
            firmware::evaluate(kind, device.as_ref(), &minimum, &gate.updated)
        };

        if let GateDecision::Pass(device) = &decision {
            debug!("{} still passes the firmware gate", device.label());
            if let Err(e) = self.transport.send_state(&self.context.config.on_state()) {
                warn!("Failed to restore on state over {kind}: {e}");
            }
            return;
        }

        warn!("Device behind the restored {kind} link no longer passes the firmware gate");
        self.set_state(PipelineState::Stopping);
        self.teardown(&mut workers, false);
        self.gate_closed(&decision);
    }

    // ── Event loop ──

    fn event_loop(&self, events: Receiver<TransportEvent>, shutdown: Receiver<()>, poll: Duration) {
        let ticker = tick(poll);
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => {
                        debug!("Transport event channel closed");
                        break;
                    }
                },
                recv(ticker) -> _ => self.retry_gate(),
                recv(shutdown) -> _ => break,
            }
        }
        debug!("Pipeline event loop exited");
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Telemetry { kind, address, mac } => {
                debug!(
                    "{kind} telemetry from {}",
                    mac.or(address).unwrap_or_else(|| "<unknown>".into())
                );
                self.retry_gate();
            }
            TransportEvent::ConnectionLost { kind, reason } => {
                warn!("{kind} link lost ({reason}), transport is reconnecting");
            }
            TransportEvent::Reconnected { kind } => {
                info!("{kind} link restored");
                if self.resume_on_reconnect.swap(false, Ordering::AcqRel) {
                    if self.rehandshake.swap(false, Ordering::AcqRel) {
                        if let Err(e) = self.transport.close() {
                            debug!("Closing {kind} transport before restart: {e}");
                        }
                    }
                    if let Err(e) = self.start() {
                        warn!("Pipeline not resumed after {kind} outage: {e}");
                    }
                } else {
                    self.revalidate();
                }
            }
            TransportEvent::OutageExceeded { kind, elapsed } => {
                if self.state() == PipelineState::Running {
                    warn!("{kind} outage exceeded {elapsed:?}, stopping until it is back");
                    self.stop(false);
                    self.resume_on_reconnect.store(true, Ordering::Release);
                }
            }
            TransportEvent::RestartRequired { kind, elapsed } => {
                if self.state() == PipelineState::Running {
                    warn!("{kind} down for {elapsed:?}, full restart once it is back");
                    self.stop(false);
                    self.rehandshake.store(true, Ordering::Release);
                    self.resume_on_reconnect.store(true, Ordering::Release);
                }
            }
            TransportEvent::FrameAckTimeout { kind } => {
                let n = self.ack_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                if should_log(n) {
                    debug!("{kind} frame write timed out ({n} so far)");
                }
            }
            TransportEvent::FirmwareUpdateResult { mac, success } => {
                let ours = self.gate.lock().update_result(mac.as_deref(), success);
                let who = mac.unwrap_or_else(|| "<unknown>".into());
                if !ours {
                    debug!("Ignoring firmware update result from {who}");
                } else if success {
                    info!("Firmware update on {who} succeeded");
                    self.retry_gate();
                } else {
                    error!("Firmware update on {who} failed");
                }
            }
            TransportEvent::Remote(command) => self.apply_remote(command),
            TransportEvent::Fatal { kind, reason } => {
                error!("{kind} transport failed: {reason}");
                self.resume_on_reconnect.store(false, Ordering::Release);
                self.stop(false);
            }
        }
    }

    fn apply_remote(&self, command: RemoteCommand) {
        match command {
            RemoteCommand::Gamma(gamma) if gamma.is_finite() && gamma > 0.0 => {
                info!("Gamma set to {gamma}");
                self.processor.lock().set_gamma(gamma);
            }
            RemoteCommand::Gamma(gamma) => warn!("Ignoring gamma {gamma}"),
            RemoteCommand::Smoothing(value) => match value.parse::<Smoothing>() {
                Ok(smoothing) => {
                    info!("Smoothing set to {smoothing}");
                    self.processor.lock().set_smoothing(smoothing);
                }
                Err(e) => warn!("Ignoring smoothing: {e}"),
            },
            RemoteCommand::AspectRatio(value) => match value.parse::<AspectRatio>() {
                Ok(aspect) => {
                    let geometry = self.context.config.geometry_for(aspect);
                    match self.processor.lock().set_geometry(geometry) {
                        Ok(()) => info!("Aspect ratio set to {aspect}"),
                        Err(e) => warn!("Aspect ratio {aspect} rejected: {e}"),
                    }
                }
                Err(e) => warn!("Ignoring aspect ratio: {e}"),
            },
            RemoteCommand::Profile(name) => {
                info!("Profile '{name}' requested; profiles are not managed by the pipeline");
            }
        }
    }
}
