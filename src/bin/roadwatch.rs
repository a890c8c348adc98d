//! roadwatch - run the detection dashboard controller from a terminal.
//!
//! 1. Loads configuration (file named by ROADWATCH_CONFIG, then env)
//! 2. Enumerates cameras and subscribes to the detection stream
//! 3. Optionally starts capture
//! 4. Logs every change of the sign list until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use roadwatch::config::RoadwatchConfig;
use roadwatch::transport::{
    parse_mqtt_endpoint, validate_loopback_addr, MqttEventSource, MqttSettings, TlsMaterials,
};
use roadwatch::{
    CaptureMode, Controller, ControllerOptions, DisplaySnapshot, HttpDetectionService,
    StartOutcome,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Session and event-reconciliation controller for the detection dashboard"
)]
struct Args {
    /// Path to a TOML config file.
    #[arg(long, env = "ROADWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Capture mode: traffic, pothole or both. Overrides the config file.
    #[arg(long)]
    mode: Option<CaptureMode>,

    /// Camera index to capture from. Overrides the config file.
    #[arg(long)]
    camera: Option<u32>,

    /// Start capture once the controller is ready.
    #[arg(long)]
    start: bool,

    /// Allow non-loopback MQTT brokers.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = RoadwatchConfig::load_from(args.config.as_deref())?;
    let mode = args.mode.unwrap_or(cfg.mode);
    let camera = args.camera.unwrap_or(cfg.camera);

    let endpoint = parse_mqtt_endpoint(&cfg.stream.broker)?;
    if !args.allow_remote_mqtt {
        validate_loopback_addr(&endpoint)?;
    } else {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }
    let tls = TlsMaterials::load(
        cfg.stream.tls_ca_path.as_ref(),
        cfg.stream.tls_client_cert_path.as_ref(),
        cfg.stream.tls_client_key_path.as_ref(),
    )?;

    log::info!("roadwatch starting");
    log::info!("  Detection service: {}", cfg.service.base_url);
    log::info!(
        "  Enrichment service: {}",
        cfg.service
            .enrichment_url
            .as_deref()
            .unwrap_or(&cfg.service.base_url)
    );
    log::info!(
        "  Stream: {}:{} topic {}",
        endpoint.host,
        endpoint.port,
        cfg.stream.topic
    );
    log::info!("  Poll interval: {:?}", cfg.poll_interval);

    let service = Arc::new(HttpDetectionService::new(
        &cfg.service.base_url,
        cfg.service.enrichment_url.as_deref(),
        cfg.service.timeout,
    )?);
    let source = MqttEventSource::new(MqttSettings {
        endpoint,
        topic: cfg.stream.topic.clone(),
        client_id: cfg.stream.client_id.clone(),
        username: cfg.stream.username.clone(),
        password: cfg.stream.password.clone(),
        tls,
        reconnect_delay: cfg.stream.reconnect_delay,
    });

    let controller = Controller::new(
        service.clone(),
        service,
        Box::new(source),
        ControllerOptions {
            poll_interval: cfg.poll_interval,
            initial_mode: mode,
            initial_camera: camera,
        },
    )?;

    let cameras = controller.available_cameras();
    if cameras.is_empty() {
        log::warn!("no cameras reported by the detection service");
    } else {
        log::info!("cameras: {:?}", cameras);
    }

    let mut started = false;
    if args.start {
        match controller.start_with(mode, camera) {
            Ok(StartOutcome::Confirmed) => log::info!("capture started"),
            Ok(StartOutcome::Unconfirmed(e)) => log::warn!("capture start not confirmed: {}", e),
            Err(e) => return Err(anyhow!("cannot start capture: {}", e)),
        }
        started = true;
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let updates = controller.watch();
    log::info!("roadwatch running; Ctrl-C to exit");
    loop {
        if rx.try_recv().is_ok() {
            break;
        }
        match updates.recv_timeout(Duration::from_millis(250)) {
            Ok(snapshot) => log_snapshot(&snapshot),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("shutdown signal received");
    if started && controller.session().is_active() {
        if let Err(e) = controller.stop() {
            log::warn!("capture may still be running: {}", e);
        }
    }
    controller.dispose()?;
    Ok(())
}

fn log_snapshot(snapshot: &DisplaySnapshot) {
    if snapshot.classes.is_empty() {
        log::info!("Detection classes: none");
    } else {
        log::info!("Detection classes: {}", snapshot.classes.join(", "));
    }
    if snapshot.signs.is_empty() {
        log::info!("No sign information available");
        return;
    }
    for info in &snapshot.signs {
        log::info!(
            "  {} | Details: {} | Action: {}",
            info.sign,
            info.details,
            info.action
        );
    }
}
