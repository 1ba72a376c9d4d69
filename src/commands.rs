//! Command handlers

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};

use ambilume::{
    Config, PipelineContext, PipelineError, PipelineManager, SharedSource, TestPattern,
};

/// How often `run` logs pipeline counters
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Setup Ctrl-C handler and return the running flag
pub fn setup_interrupt_handler() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
    })
    .ok();

    running
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    };
    config.context("Failed to load configuration")
}

fn open_source(config: &Config, test_pattern: bool) -> anyhow::Result<SharedSource> {
    let size = (config.capture.width, config.capture.height);
    if test_pattern {
        return Ok(Arc::new(TestPattern::new(size.0, size.1)));
    }
    screen_source(size, config.capture.fps)
}

#[cfg(feature = "screen-capture")]
fn screen_source(size: (u32, u32), fps: u32) -> anyhow::Result<SharedSource> {
    let source = ambilume::capture::PipeWireSource::open_blocking(size, fps)
        .context("Screen capture unavailable")?;
    Ok(Arc::new(source))
}

#[cfg(not(feature = "screen-capture"))]
fn screen_source(_size: (u32, u32), _fps: u32) -> anyhow::Result<SharedSource> {
    anyhow::bail!("built without the screen-capture feature, use --test-pattern")
}

/// Stream until Ctrl-C, then switch the device off
pub fn run(config_path: Option<&Path>, test_pattern: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let source = open_source(&config, test_pattern)?;
    let manager = PipelineManager::from_config(PipelineContext::new(config), source)?;

    match manager.start() {
        Ok(state) => info!("Pipeline {state}"),
        // Keeps polling; starts once a compatible device shows up
        Err(PipelineError::FirmwareGate(reason)) => warn!("Waiting for a device: {reason}"),
        Err(e) => return Err(e).context("Failed to start pipeline"),
    }

    let running = setup_interrupt_handler();
    let mut last_stats = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
        if last_stats.elapsed() >= STATS_INTERVAL {
            let stats = manager.stats();
            info!(
                "{}: {} captured, {} sent, {} dropped, {} suppressed{}",
                manager.state(),
                stats.frames_captured,
                stats.frames_sent,
                stats.frames_dropped,
                stats.frames_suppressed,
                if stats.power_saving { " (power saving)" } else { "" }
            );
            last_stats = Instant::now();
        }
    }

    info!("Shutting down");
    manager.stop(true);
    manager.close();
    Ok(())
}

#[cfg(feature = "serial")]
pub fn ports() -> anyhow::Result<()> {
    use ambilume_transport::{PortConnector, SystemPorts};

    let ports = SystemPorts::default().list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
pub fn ports() -> anyhow::Result<()> {
    anyhow::bail!("built without the serial feature")
}

#[cfg(feature = "mqtt")]
pub fn devices(config_path: Option<&Path>, seconds: u64) -> anyhow::Result<()> {
    use ambilume_transport::network::RumqttConnector;
    use ambilume_transport::{DeviceRegistry, InstanceId, NetworkTransport, Transport};

    let config = load_config(config_path)?;
    let registry = Arc::new(DeviceRegistry::new());
    let transport = NetworkTransport::new(
        config.network_config(InstanceId::PRIMARY),
        Arc::new(RumqttConnector),
        Arc::clone(&registry),
    );
    let events = transport.events();
    transport
        .connect()
        .with_context(|| format!("Failed to reach broker {}:{}", config.mqtt.host, config.mqtt.port))?;

    println!("Listening for {seconds}s...");
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        if events.recv_timeout(left).is_err() {
            break;
        }
    }
    transport.close()?;

    let devices = registry.all();
    if devices.is_empty() {
        println!("No devices found");
        return Ok(());
    }
    for d in devices {
        let version = d
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".into());
        let leds = d
            .led_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".into());
        println!(
            "{:<24} ip={:<15} mac={:<17} fw={version:<8} leds={leds}",
            d.label(),
            d.ip.as_deref().unwrap_or("-"),
            d.mac.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

#[cfg(not(feature = "mqtt"))]
pub fn devices(_config_path: Option<&Path>, _seconds: u64) -> anyhow::Result<()> {
    anyhow::bail!("built without the mqtt feature")
}

pub fn show_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}
