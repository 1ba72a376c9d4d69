//! Integration tests for the serial and network transports.
//!
//! Both transports run their real threads against in-memory stand-ins for
//! the serial ports and the MQTT broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ambilume_transport::mock::{MockBroker, MockPorts};
use ambilume_transport::mqtt::StreamMessage;
use ambilume_transport::{
    DeviceRegistry, DeviceState, FirmwareVersion, Frame, LedLayout, NetworkConfig, NetworkTransport, Orientation,
    Rgb, Satellite, SerialConfig, SerialTransport, StreamKind, Transport, TransportError,
    TransportEvent, Zone,
};
use crossbeam_channel::Receiver;

/// Wait for the first event matching `pred`, skipping others.
fn wait_event(
    rx: &Receiver<TransportEvent>,
    timeout: Duration,
    pred: impl Fn(&TransportEvent) -> bool,
) -> Option<TransportEvent> {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(ev) if pred(&ev) => return Some(ev),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

// ── Serial ──

fn serial_config() -> SerialConfig {
    SerialConfig {
        port: "/dev/ttyACM0".into(),
        led_count: 8,
        handshake_timeout: Duration::from_millis(500),
        reconnect_interval: Duration::from_millis(20),
        outage_grace: Duration::from_millis(150),
        ..Default::default()
    }
}

#[test]
fn serial_telemetry_reaches_registry() {
    let ports = Arc::new(MockPorts::new(&["/dev/ttyACM0"]));
    ports.feed(
        "/dev/ttyACM0",
        b"ver:5.12.3\nMAC:AA:BB:CC:DD:EE:01\nlednum:8\nframerate:60\n",
    );
    let registry = Arc::new(DeviceRegistry::new());
    let t = SerialTransport::new(serial_config(), ports.clone(), Arc::clone(&registry));
    let events = t.events();
    t.connect().unwrap();

    assert!(wait_event(&events, Duration::from_secs(1), |e| matches!(
        e,
        TransportEvent::Telemetry { mac: Some(_), .. }
    ))
    .is_some());

    let device = registry.find_by_mac("aa:bb:cc:dd:ee:01").unwrap();
    assert_eq!(device.address.as_deref(), Some("/dev/ttyACM0"));
    assert_eq!(device.baud_rate, Some(500_000));
}

#[test]
fn serial_reconnects_without_restart() {
    let ports = Arc::new(MockPorts::new(&["/dev/ttyACM0"]));
    ports.feed("/dev/ttyACM0", b"ver:5.12.3\n");
    let t = SerialTransport::new(
        serial_config(),
        ports.clone(),
        Arc::new(DeviceRegistry::new()),
    );
    let events = t.events();
    t.connect().unwrap();
    t.send_frame(&Frame::solid(8, Rgb::WHITE)).unwrap();

    ports.unplug("/dev/ttyACM0");
    assert!(wait_event(&events, Duration::from_secs(1), |e| matches!(
        e,
        TransportEvent::ConnectionLost { .. }
    ))
    .is_some());
    assert!(!t.is_connected());
    assert!(matches!(
        t.send_frame(&Frame::solid(8, Rgb::WHITE)),
        Err(TransportError::Disconnected)
    ));

    ports.replug("/dev/ttyACM0");
    assert!(wait_event(&events, Duration::from_secs(2), |e| matches!(
        e,
        TransportEvent::Reconnected { .. }
    ))
    .is_some());
    assert!(t.is_connected());

    // No connect() call needed
    t.send_frame(&Frame::solid(8, Rgb::new(0, 0, 255))).unwrap();
    let frames = ports.frames("/dev/ttyACM0");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].leds, vec![Rgb::new(0, 0, 255); 8]);
}

#[test]
fn serial_reconnect_reads_version_of_new_device() {
    let ports = Arc::new(MockPorts::new(&["/dev/ttyACM0"]));
    ports.feed("/dev/ttyACM0", b"ver:5.12.3\n");
    let registry = Arc::new(DeviceRegistry::new());
    let t = SerialTransport::new(serial_config(), ports.clone(), Arc::clone(&registry));
    let events = t.events();
    let device = t.connect().unwrap().unwrap();
    assert_eq!(device.version, Some(FirmwareVersion::new(5, 12, 3)));

    ports.unplug("/dev/ttyACM0");
    assert!(wait_event(&events, Duration::from_secs(1), |e| matches!(
        e,
        TransportEvent::ConnectionLost { .. }
    ))
    .is_some());

    // A different board on the same port
    ports.feed("/dev/ttyACM0", b"ver:1.0.0\n");
    ports.replug("/dev/ttyACM0");
    assert!(wait_event(&events, Duration::from_secs(2), |e| matches!(
        e,
        TransportEvent::Reconnected { .. }
    ))
    .is_some());

    // Reconnected only goes out once the version line was read
    let device = t.target_device().unwrap();
    assert_eq!(device.version, Some(FirmwareVersion::new(1, 0, 0)));
}

#[test]
fn serial_long_outage_is_reported_once() {
    let ports = Arc::new(MockPorts::new(&["/dev/ttyACM0"]));
    let t = SerialTransport::new(
        serial_config(),
        ports.clone(),
        Arc::new(DeviceRegistry::new()),
    );
    let events = t.events();
    t.connect().unwrap();

    ports.unplug("/dev/ttyACM0");
    assert!(wait_event(&events, Duration::from_secs(2), |e| matches!(
        e,
        TransportEvent::OutageExceeded { .. }
    ))
    .is_some());
    // Once per outage
    assert!(wait_event(&events, Duration::from_millis(300), |e| matches!(
        e,
        TransportEvent::OutageExceeded { .. }
    ))
    .is_none());

    ports.replug("/dev/ttyACM0");
    assert!(wait_event(&events, Duration::from_secs(2), |e| matches!(
        e,
        TransportEvent::Reconnected { .. }
    ))
    .is_some());
}

#[test]
fn serial_close_stops_reconnecting() {
    let ports = Arc::new(MockPorts::new(&["/dev/ttyACM0"]));
    let t = SerialTransport::new(
        serial_config(),
        ports.clone(),
        Arc::new(DeviceRegistry::new()),
    );
    let events = t.events();
    t.connect().unwrap();
    ports.unplug("/dev/ttyACM0");
    assert!(wait_event(&events, Duration::from_secs(1), |e| matches!(
        e,
        TransportEvent::ConnectionLost { .. }
    ))
    .is_some());

    t.close().unwrap();
    ports.replug("/dev/ttyACM0");
    assert!(wait_event(&events, Duration::from_millis(300), |e| matches!(
        e,
        TransportEvent::Reconnected { .. }
    ))
    .is_none());
    assert!(!t.is_connected());
}

// ── Network ──

const PRIMARY_MAC: &str = "AA:AA:AA:AA:AA:01";
const SATELLITE_MAC: &str = "BB:BB:BB:BB:BB:02";

fn layout() -> LedLayout {
    LedLayout {
        top: 4,
        right: 2,
        left: 2,
        bottom_left: 10,
        bottom_right: 10,
        orientation: Orientation::Clockwise,
    }
}

fn network(broker: &Arc<MockBroker>) -> NetworkTransport {
    let config = NetworkConfig {
        stream: StreamKind::Mqtt,
        layout: layout(),
        satellites: vec![Satellite::new("10.0.0.3", Zone::BottomLeft, 6)
            .with_orientation(Orientation::Anticlockwise)],
        handshake_timeout: Duration::from_millis(50),
        reconnect_interval: Duration::from_millis(20),
        restart_after: Duration::from_millis(150),
        ..Default::default()
    };
    NetworkTransport::new(config, broker.clone(), Arc::new(DeviceRegistry::new()))
}

fn announce(broker: &MockBroker, t: &NetworkTransport, events: &Receiver<TransportEvent>) {
    let fps = t.topics().fps();
    broker.deliver(
        &fps,
        format!(r#"{{"MAC":"{PRIMARY_MAC}","IP":"10.0.0.2","ver":"5.12.3","lednum":28}}"#)
            .as_bytes(),
    );
    broker.deliver(
        &fps,
        format!(r#"{{"MAC":"{SATELLITE_MAC}","IP":"10.0.0.3","ver":"5.12.3","lednum":6}}"#)
            .as_bytes(),
    );
    for _ in 0..2 {
        assert!(wait_event(events, Duration::from_secs(1), |e| matches!(
            e,
            TransportEvent::Telemetry { .. }
        ))
        .is_some());
    }
}

#[test]
fn network_subscribes_and_resolves_target() {
    let broker = Arc::new(MockBroker::new());
    let t = network(&broker);
    let events = t.events();
    assert!(t.connect().unwrap().is_none());
    assert!(broker.subscriptions().contains(&t.topics().fps()));

    announce(&broker, &t, &events);
    let target = t.target_device().unwrap();
    assert_eq!(target.mac.as_deref(), Some(PRIMARY_MAC));
}

#[test]
fn network_state_is_addressed_per_device() {
    let broker = Arc::new(MockBroker::new());
    let t = network(&broker);
    let events = t.events();
    t.connect().unwrap();
    announce(&broker, &t, &events);

    let color = Rgb::new(10, 20, 30);
    t.send_state(&DeviceState::streaming(color, 180, 65)).unwrap();

    let set: Vec<serde_json::Value> = broker
        .published_on(&t.topics().set())
        .iter()
        .map(|p| serde_json::from_slice(p).unwrap())
        .collect();
    assert_eq!(set.len(), 2);
    assert_eq!(set[0]["state"], "ON");
    assert_eq!(set[0]["MAC"], PRIMARY_MAC);
    assert_eq!(set[0]["color"], serde_json::json!({"r": 10, "g": 20, "b": 30}));
    assert_eq!(set[1]["MAC"], SATELLITE_MAC);

    let retained: Vec<_> = broker
        .published()
        .into_iter()
        .filter(|p| p.topic == t.topics().state())
        .collect();
    assert_eq!(retained.len(), 1);
    assert!(retained[0].retain);
}

#[test]
fn network_state_survives_failing_satellite() {
    let broker = Arc::new(MockBroker::new());
    let t = network(&broker);
    let events = t.events();
    t.connect().unwrap();
    announce(&broker, &t, &events);

    broker.reject_payloads_with(Some(SATELLITE_MAC));
    t.send_state(&DeviceState::off(65)).unwrap();

    let set: Vec<serde_json::Value> = broker
        .published_on(&t.topics().set())
        .iter()
        .map(|p| serde_json::from_slice(p).unwrap())
        .collect();
    assert_eq!(set.len(), 1);
    assert_eq!(set[0]["state"], "OFF");
    assert_eq!(set[0]["MAC"], PRIMARY_MAC);

    // The steps after the satellites still ran
    assert_eq!(broker.published_on(&t.topics().state()).len(), 1);
    assert_eq!(broker.published_on(&t.topics().unsubscribe()).len(), 1);
}

#[test]
fn network_frame_fans_out_to_satellite() {
    let broker = Arc::new(MockBroker::new());
    let t = network(&broker);
    let events = t.events();
    t.connect().unwrap();
    announce(&broker, &t, &events);

    let leds: Vec<Rgb> = (0..28u8).map(|i| Rgb::new(i * 9, 0, 0)).collect();
    t.send_frame(&Frame::new(leds)).unwrap();

    let streams: Vec<StreamMessage> = broker
        .published_on(&t.topics().stream())
        .iter()
        .map(|p| serde_json::from_slice(p).unwrap())
        .collect();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0].mac.as_deref(), Some(PRIMARY_MAC));
    assert_eq!(streams[0].led_count, 28);

    let sat = &streams[1];
    assert_eq!(sat.mac.as_deref(), Some(SATELLITE_MAC));
    assert_eq!(sat.led_count, 6);
    // Satellite is wired the other way round: colors run high to low
    assert!(sat.stream.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn network_update_result_event() {
    let broker = Arc::new(MockBroker::new());
    let t = network(&broker);
    let events = t.events();
    t.connect().unwrap();

    broker.deliver(
        &t.topics().update_result(),
        format!(r#"{{"MAC":"{PRIMARY_MAC}","success":true}}"#).as_bytes(),
    );
    let ev = wait_event(&events, Duration::from_secs(1), |e| {
        matches!(e, TransportEvent::FirmwareUpdateResult { .. })
    });
    assert!(matches!(
        ev,
        Some(TransportEvent::FirmwareUpdateResult { success: true, .. })
    ));
}

#[test]
fn network_outage_escalates_to_restart() {
    let broker = Arc::new(MockBroker::new());
    let t = network(&broker);
    let events = t.events();
    t.connect().unwrap();

    broker.go_offline("broker went away");
    assert!(wait_event(&events, Duration::from_secs(1), |e| matches!(
        e,
        TransportEvent::ConnectionLost { .. }
    ))
    .is_some());
    assert!(wait_event(&events, Duration::from_secs(2), |e| matches!(
        e,
        TransportEvent::RestartRequired { .. }
    ))
    .is_some());

    broker.restore();
    assert!(wait_event(&events, Duration::from_secs(1), |e| matches!(
        e,
        TransportEvent::Reconnected { .. }
    ))
    .is_some());
    assert!(t.is_connected());
}
