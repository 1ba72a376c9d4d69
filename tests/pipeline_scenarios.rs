//! End-to-end pipeline scenarios
//!
//! The manager runs its real capture pool, consumer and event threads
//! against in-memory transports, serial ports and MQTT broker.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ambilume::capture::{CaptureError, CaptureSource, PixelFormat, ScreenImage};
use ambilume::config::{CaptureConfig, ColorConfig, FirmwareConfig};
use ambilume::processor::{HueSaturation, Smoothing};
use ambilume::{Config, PipelineContext, PipelineError, PipelineManager, PipelineState};
use ambilume_transport::mock::{MockBroker, MockPorts, MockTransport};
use ambilume_transport::mqtt::StreamMessage;
use ambilume_transport::{
    DeviceInfo, DeviceRegistry, Effect, FirmwareVersion, InstanceId, LedLayout, NetworkTransport,
    Orientation, RemoteCommand, Rgb, Satellite, SerialTransport, StreamKind, TransportEvent,
    Transport, TransportKind, Zone,
};

const ON_COLOR: Rgb = Rgb::new(10, 20, 30);
const DEVICE_MAC: &str = "AA:AA:AA:AA:AA:01";

/// Source returning whatever image was set last
struct StillSource {
    size: (u32, u32),
    image: Mutex<ScreenImage>,
}

impl StillSource {
    fn solid(width: u32, height: u32, color: Rgb) -> Arc<Self> {
        Arc::new(Self {
            size: (width, height),
            image: Mutex::new(ScreenImage::solid(width, height, PixelFormat::Bgra, color)),
        })
    }

    fn set(&self, image: ScreenImage) {
        *self.image.lock() = image;
    }

    fn set_color(&self, color: Rgb) {
        self.set(ScreenImage::solid(self.size.0, self.size.1, PixelFormat::Bgra, color));
    }
}

impl CaptureSource for StillSource {
    fn name(&self) -> &str {
        "still"
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn capture(&self) -> Result<ScreenImage, CaptureError> {
        Ok(self.image.lock().clone())
    }
}

fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn small_layout() -> LedLayout {
    LedLayout {
        top: 4,
        right: 2,
        left: 2,
        bottom_left: 2,
        bottom_right: 2,
        orientation: Orientation::Clockwise,
    }
}

fn test_config() -> Config {
    let mut config = Config::default()
        .with_capture(CaptureConfig {
            width: 64,
            height: 36,
            fps: 50,
            threads: 2,
            pixel_stride: 1,
            border_depth: 6,
            ..Default::default()
        })
        .with_leds(small_layout())
        .with_color(ColorConfig {
            gamma: 1.0,
            white_temp: 65,
            smoothing: Smoothing::Disabled,
            color: ON_COLOR,
            brightness: 200,
            saturation: HueSaturation::default(),
        })
        .with_firmware(FirmwareConfig {
            poll_interval_ms: 20,
            ..Default::default()
        });
    config.device.handshake_timeout_ms = 50;
    config.device.reconnect_interval_ms = 20;
    config
}

fn compatible_device() -> DeviceInfo {
    DeviceInfo::new(TransportKind::Network)
        .with_mac(DEVICE_MAC)
        .with_version(FirmwareVersion::new(5, 12, 3))
}

fn mock_manager(
    config: Config,
    transport: &Arc<MockTransport>,
    source: Arc<StillSource>,
) -> PipelineManager {
    PipelineManager::new(PipelineContext::new(config), transport.clone(), source).unwrap()
}

// ── Scenario 1: network device appears after start ──

fn network_transport(config: &Config, broker: &Arc<MockBroker>, registry: &Arc<DeviceRegistry>) -> NetworkTransport {
    NetworkTransport::new(
        config.network_config(InstanceId::PRIMARY),
        broker.clone(),
        Arc::clone(registry),
    )
}

#[test]
fn network_gate_opens_when_device_announces() {
    let mut config = test_config().with_output(TransportKind::Network);
    config.mqtt.stream = StreamKind::Mqtt;
    let broker = Arc::new(MockBroker::new());
    let registry = Arc::new(DeviceRegistry::new());
    let transport = Arc::new(network_transport(&config, &broker, &registry));
    let fps_topic = transport.topics().fps();
    let set_topic = transport.topics().set();

    let context = PipelineContext::new(config).with_registry(Arc::clone(&registry));
    let source = StillSource::solid(64, 36, Rgb::new(0, 0, 200));
    let manager = PipelineManager::new(context, transport, source).unwrap();

    assert!(matches!(
        manager.start(),
        Err(PipelineError::FirmwareGate(_))
    ));
    assert_eq!(manager.state(), PipelineState::FirmwareGateFailed);
    assert!(broker.published_on(&set_topic).is_empty());

    broker.deliver(
        &fps_topic,
        format!(r#"{{"MAC":"{DEVICE_MAC}","IP":"10.0.0.2","ver":"5.12.3","lednum":12}}"#)
            .as_bytes(),
    );
    assert!(wait_until(Duration::from_secs(2), || manager.state()
        == PipelineState::Running));

    let set = broker.published_on(&set_topic);
    let first: serde_json::Value = serde_json::from_slice(&set[0]).unwrap();
    assert_eq!(first["state"], "ON");
    assert_eq!(first["MAC"], DEVICE_MAC);
    assert_eq!(first["color"], serde_json::json!({"r": 10, "g": 20, "b": 30}));
    assert_eq!(manager.effect(), Effect::Stream);

    manager.stop(false);
}

// ── Scenario 2: serial cable pulled and plugged back ──

#[test]
fn serial_replug_resumes_without_restart() {
    const PORT: &str = "/dev/ttyACM0";
    let mut config = test_config();
    config.device.port = PORT.into();
    config.device.handshake_timeout_ms = 300;

    let ports = Arc::new(MockPorts::new(&[PORT]));
    ports.feed(PORT, b"ver:5.12.3\n");
    let registry = Arc::new(DeviceRegistry::new());
    let transport = Arc::new(SerialTransport::new(
        config.serial_config(),
        ports.clone(),
        Arc::clone(&registry),
    ));
    let context = PipelineContext::new(config).with_registry(registry);
    let manager =
        PipelineManager::new(context, transport, StillSource::solid(64, 36, Rgb::WHITE)).unwrap();

    assert_eq!(manager.start().unwrap(), PipelineState::Running);
    assert!(wait_until(Duration::from_secs(2), || ports.frames(PORT).len() > 3));

    ports.unplug(PORT);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.state(), PipelineState::Running);
    let before = ports.frames(PORT).len();

    ports.replug(PORT);
    assert!(wait_until(Duration::from_secs(2), || ports.frames(PORT).len() > before + 3));
    assert_eq!(manager.state(), PipelineState::Running);

    manager.stop(false);
}

#[test]
fn serial_replug_with_old_firmware_closes_gate() {
    const PORT: &str = "/dev/ttyACM0";
    let mut config = test_config();
    config.device.port = PORT.into();
    config.device.handshake_timeout_ms = 300;

    let ports = Arc::new(MockPorts::new(&[PORT]));
    ports.feed(PORT, b"ver:5.12.3\n");
    let registry = Arc::new(DeviceRegistry::new());
    let transport = Arc::new(SerialTransport::new(
        config.serial_config(),
        ports.clone(),
        Arc::clone(&registry),
    ));
    let context = PipelineContext::new(config).with_registry(Arc::clone(&registry));
    let manager =
        PipelineManager::new(context, transport, StillSource::solid(64, 36, Rgb::WHITE)).unwrap();

    assert_eq!(manager.start().unwrap(), PipelineState::Running);
    assert!(wait_until(Duration::from_secs(2), || ports.frames(PORT).len() > 3));

    ports.unplug(PORT);
    thread::sleep(Duration::from_millis(100));
    // Someone plugs in a board with outdated firmware
    ports.feed(PORT, b"ver:1.0.0\n");
    ports.replug(PORT);

    assert!(wait_until(Duration::from_secs(2), || manager.state()
        == PipelineState::FirmwareGateFailed));
    let version = registry.find_by_address(PORT).and_then(|d| d.version);
    assert_eq!(version, Some(FirmwareVersion::new(1, 0, 0)));

    let sent = ports.frames(PORT).len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(ports.frames(PORT).len(), sent);
    assert_eq!(manager.state(), PipelineState::FirmwareGateFailed);

    assert_eq!(manager.stop(false), PipelineState::Stopped);
}

// ── Scenario 3: static screen ──

#[test]
fn static_screen_engages_power_saving() {
    let config = test_config().with_power_saving(true, Duration::from_secs(1));
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(compatible_device()));
    let source = StillSource::solid(64, 36, Rgb::new(90, 90, 90));
    let manager = mock_manager(config, &transport, source.clone());

    assert_eq!(manager.start().unwrap(), PipelineState::Running);
    assert!(wait_until(Duration::from_secs(3), || manager.stats().power_saving));
    assert!(wait_until(Duration::from_secs(1), || manager.stats().frames_suppressed > 0));
    assert_eq!(manager.state(), PipelineState::Running);

    let sent = transport.frames().len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(transport.frames().len(), sent);

    source.set_color(Rgb::new(200, 40, 40));
    assert!(wait_until(Duration::from_secs(2), || transport.states().len() >= 2));
    assert!(wait_until(Duration::from_secs(1), || transport.frames().len() > sent));
    assert!(!manager.stats().power_saving);
    assert_eq!(transport.states()[1].color, ON_COLOR);

    manager.stop(false);
}

// ── Scenario 4: satellite fed from the bottom-left zone ──

#[test]
fn satellite_receives_reversed_bottom_left_zone() {
    let mut config = test_config()
        .with_output(TransportKind::Network)
        .with_capture(CaptureConfig {
            width: 200,
            height: 100,
            fps: 30,
            threads: 1,
            pixel_stride: 1,
            border_depth: 10,
            ..Default::default()
        })
        .with_leds(LedLayout {
            top: 4,
            right: 2,
            left: 2,
            bottom_left: 20,
            bottom_right: 0,
            orientation: Orientation::Clockwise,
        })
        .with_satellites(vec![Satellite::new("10.0.0.3", Zone::BottomLeft, 6)
            .with_orientation(Orientation::Anticlockwise)]);
    config.mqtt.stream = StreamKind::Mqtt;

    let broker = Arc::new(MockBroker::new());
    let registry = Arc::new(DeviceRegistry::new());
    let transport = Arc::new(network_transport(&config, &broker, &registry));
    let fps_topic = transport.topics().fps();
    let stream_topic = transport.topics().stream();

    // Red rising from left to right
    let (width, height) = (200u32, 100u32);
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..height {
        for x in 0..width {
            let r = (x * 255 / (width - 1)) as u8;
            data.extend_from_slice(&[0, 0, r, 255]);
        }
    }
    let source = StillSource::solid(width, height, Rgb::BLACK);
    source.set(ScreenImage::new(width, height, PixelFormat::Bgra, data));

    let context = PipelineContext::new(config).with_registry(Arc::clone(&registry));
    let manager = PipelineManager::new(context, transport, source).unwrap();
    let _ = manager.start();

    for (mac, ip, leds) in [(DEVICE_MAC, "10.0.0.2", 28), ("BB:BB:BB:BB:BB:02", "10.0.0.3", 6)] {
        broker.deliver(
            &fps_topic,
            format!(r#"{{"MAC":"{mac}","IP":"{ip}","ver":"5.12.3","lednum":{leds}}}"#).as_bytes(),
        );
    }
    assert!(wait_until(Duration::from_secs(2), || manager.state()
        == PipelineState::Running));

    let satellite_stream = || {
        broker
            .published_on(&stream_topic)
            .iter()
            .filter_map(|p| serde_json::from_slice::<StreamMessage>(p).ok())
            .find(|m| m.led_count == 6)
    };
    assert!(wait_until(Duration::from_secs(2), || satellite_stream().is_some()));
    let Some(message) = satellite_stream() else {
        panic!("no satellite stream");
    };
    assert_eq!(message.stream.len(), 6);
    assert!(message.stream.windows(2).all(|w| w[0] >= w[1]));
    assert!(message.stream[0] > message.stream[5]);

    manager.stop(false);
}

// ── Firmware gate ──

#[test]
fn gate_retries_until_device_is_known() {
    let transport = Arc::new(MockTransport::new(TransportKind::Network));
    let manager = mock_manager(test_config(), &transport, StillSource::solid(64, 36, Rgb::WHITE));

    assert!(manager.start().is_err());
    assert_eq!(manager.state(), PipelineState::FirmwareGateFailed);
    assert!(transport.frames().is_empty());

    transport.set_device(Some(compatible_device()));
    assert!(wait_until(Duration::from_secs(2), || manager.state()
        == PipelineState::Running));
    assert!(wait_until(Duration::from_secs(1), || !transport.frames().is_empty()));
    assert_eq!(transport.states()[0].color, ON_COLOR);

    manager.stop(false);
}

#[test]
fn outdated_firmware_is_updated_then_streamed() {
    let config = test_config().with_firmware(FirmwareConfig {
        auto_update: true,
        poll_interval_ms: 20,
        ..Default::default()
    });
    let old = DeviceInfo::new(TransportKind::Network)
        .with_mac(DEVICE_MAC)
        .with_version(FirmwareVersion::new(5, 9, 10));
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(old));
    let manager = mock_manager(config, &transport, StillSource::solid(64, 36, Rgb::WHITE));

    match manager.start() {
        Err(PipelineError::FirmwareGate(reason)) => assert!(reason.contains("5.9.10")),
        other => panic!("unexpected start result: {other:?}"),
    }
    assert!(wait_until(Duration::from_millis(200), || transport
        .update_requests()
        .len()
        == 1));
    // Still outdated: repeated checks do not request again
    thread::sleep(Duration::from_millis(100));
    assert_eq!(transport.update_requests().len(), 1);
    assert_eq!(manager.state(), PipelineState::FirmwareGateFailed);

    transport.emit(TransportEvent::FirmwareUpdateResult {
        mac: Some(DEVICE_MAC.to_lowercase()),
        success: true,
    });
    assert!(wait_until(Duration::from_secs(2), || manager.state()
        == PipelineState::Running));

    manager.stop(false);
}

#[test]
fn unknown_version_is_refused_on_network() {
    let transport = Arc::new(
        MockTransport::new(TransportKind::Network)
            .with_device(DeviceInfo::new(TransportKind::Network).with_mac(DEVICE_MAC)),
    );
    let manager = mock_manager(test_config(), &transport, StillSource::solid(64, 36, Rgb::WHITE));
    assert!(matches!(
        manager.start(),
        Err(PipelineError::FirmwareGate(_))
    ));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.state(), PipelineState::FirmwareGateFailed);
    assert!(transport.sent().is_empty());
}

// ── Lifecycle ──

#[test]
fn stop_publishes_off_state_and_is_idempotent() {
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(compatible_device()));
    let manager = mock_manager(test_config(), &transport, StillSource::solid(64, 36, Rgb::WHITE));

    assert_eq!(manager.start().unwrap(), PipelineState::Running);
    assert_eq!(manager.start().unwrap(), PipelineState::Running);
    assert!(wait_until(Duration::from_secs(1), || !transport.frames().is_empty()));

    assert_eq!(manager.stop(true), PipelineState::Stopped);
    let states = transport.states();
    assert!(states[0].on);
    assert!(!states[states.len() - 1].on);
    assert_eq!(manager.effect(), Effect::Solid);
    assert_eq!(manager.stats().frames_sent, 0);

    let sent = transport.sent().len();
    assert_eq!(manager.stop(true), PipelineState::Stopped);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.sent().len(), sent);
}

#[test]
fn concurrent_start_and_stop_are_coalesced() {
    const CALLERS: usize = 8;
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(compatible_device()));
    let manager = Arc::new(mock_manager(
        test_config(),
        &transport,
        StillSource::solid(64, 36, Rgb::WHITE),
    ));

    let barrier = Arc::new(Barrier::new(CALLERS));
    let starters: Vec<_> = (0..CALLERS)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.start().is_ok()
            })
        })
        .collect();
    for handle in starters {
        assert!(handle.join().unwrap());
    }
    assert_eq!(manager.state(), PipelineState::Running);
    assert_eq!(transport.states().len(), 1);

    // One capture pool at 50 fps; a second one would double the rate
    thread::sleep(Duration::from_millis(200));
    let before = manager.stats().frames_captured;
    thread::sleep(Duration::from_secs(1));
    let captured = manager.stats().frames_captured - before;
    assert!(captured < 75, "{captured} frames captured in one second");

    let barrier = Arc::new(Barrier::new(CALLERS));
    let stoppers: Vec<_> = (0..CALLERS)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.stop(false);
            })
        })
        .collect();
    for handle in stoppers {
        handle.join().unwrap();
    }
    assert_eq!(manager.state(), PipelineState::Stopped);
    assert_eq!(transport.states().len(), 1);

    let sent = transport.frames().len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(transport.frames().len(), sent);
}

#[test]
fn invalid_config_is_rejected_before_building() {
    let mut config = test_config();
    config.capture.height = 0;
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(compatible_device()));
    let result = PipelineManager::new(
        PipelineContext::new(config),
        transport.clone(),
        StillSource::solid(64, 36, Rgb::WHITE),
    );
    assert!(matches!(result, Err(PipelineError::Config(_))));
    assert!(!transport.is_connected());
}

#[test]
fn restart_reports_final_state() {
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(compatible_device()));
    let manager = mock_manager(test_config(), &transport, StillSource::solid(64, 36, Rgb::WHITE));
    manager.start().unwrap();

    let seen = Arc::new(Mutex::new(None));
    let seen_cb = Arc::clone(&seen);
    let state = manager.restart(move |state| *seen_cb.lock() = Some(state));
    assert_eq!(state, PipelineState::Running);
    assert_eq!(*seen.lock(), Some(PipelineState::Running));

    manager.stop(false);
}

#[test]
fn bad_geometry_fails_start_without_connecting() {
    let mut config = test_config();
    // Source is smaller than the configured capture size
    config.capture.width = 640;
    config.capture.height = 360;
    config.capture.border_depth = 60;
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(compatible_device()));
    let manager = mock_manager(config, &transport, StillSource::solid(64, 36, Rgb::WHITE));

    assert!(matches!(manager.start(), Err(PipelineError::Geometry(_))));
    assert_eq!(manager.state(), PipelineState::Stopped);
    assert!(!transport.is_connected());
}

#[test]
fn outage_stops_and_reconnect_resumes() {
    let transport = Arc::new(MockTransport::new(TransportKind::Serial).with_device(compatible_device()));
    let manager = mock_manager(test_config(), &transport, StillSource::solid(64, 36, Rgb::WHITE));
    manager.start().unwrap();

    transport.emit(TransportEvent::OutageExceeded {
        kind: TransportKind::Serial,
        elapsed: Duration::from_secs(11),
    });
    assert!(wait_until(Duration::from_secs(1), || manager.state()
        == PipelineState::Stopped));

    transport.emit(TransportEvent::Reconnected {
        kind: TransportKind::Serial,
    });
    assert!(wait_until(Duration::from_secs(2), || manager.state()
        == PipelineState::Running));
    assert_eq!(transport.states().iter().filter(|s| s.on).count(), 2);

    manager.stop(false);
}

#[test]
fn fatal_error_stops_for_good() {
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(compatible_device()));
    let manager = mock_manager(test_config(), &transport, StillSource::solid(64, 36, Rgb::WHITE));
    manager.start().unwrap();

    transport.emit(TransportEvent::Fatal {
        kind: TransportKind::Network,
        reason: "broker rejected credentials".into(),
    });
    assert!(wait_until(Duration::from_secs(1), || manager.state()
        == PipelineState::Stopped));
    transport.emit(TransportEvent::Reconnected {
        kind: TransportKind::Network,
    });
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.state(), PipelineState::Stopped);
}

// ── Remote settings ──

#[test]
fn remote_gamma_changes_frames() {
    let transport = Arc::new(MockTransport::new(TransportKind::Network).with_device(compatible_device()));
    let manager = mock_manager(
        test_config(),
        &transport,
        StillSource::solid(64, 36, Rgb::new(128, 128, 128)),
    );
    manager.start().unwrap();
    assert!(wait_until(Duration::from_secs(1), || transport
        .frames()
        .iter()
        .any(|f| f.leds()[0] == Rgb::new(128, 128, 128))));

    transport.emit(TransportEvent::Remote(RemoteCommand::Gamma(2.0)));
    assert!(wait_until(Duration::from_secs(2), || transport
        .frames()
        .iter()
        .any(|f| f.leds()[0] == Rgb::new(64, 64, 64))));

    manager.stop(false);
}
