use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::mqtt::{DEFAULT_RECONNECT_DELAY, DEFAULT_TOPIC};
use crate::{CameraIndex, CaptureMode};

const DEFAULT_SERVICE_URL: &str = "http://localhost:5000";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "roadwatch";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct RoadwatchConfigFile {
    service: Option<ServiceConfigFile>,
    stream: Option<StreamConfigFile>,
    poll: Option<PollConfigFile>,
    session: Option<SessionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    base_url: Option<String>,
    enrichment_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    broker: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    reconnect_delay_secs: Option<u64>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PollConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    mode: Option<String>,
    camera: Option<CameraIndex>,
}

#[derive(Debug, Clone)]
pub struct RoadwatchConfig {
    pub service: ServiceSettings,
    pub stream: StreamSettings,
    pub poll_interval: Duration,
    pub mode: CaptureMode,
    pub camera: CameraIndex,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub base_url: String,
    pub enrichment_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub broker: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub reconnect_delay: Duration,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
}

impl RoadwatchConfig {
    /// Load from `ROADWATCH_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RoadwatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoadwatchConfigFile) -> Result<Self> {
        let service = file.service.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let session = file.session.unwrap_or_default();

        let mode = match session.mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => CaptureMode::default(),
        };

        Ok(Self {
            service: ServiceSettings {
                base_url: service
                    .base_url
                    .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string()),
                enrichment_url: service.enrichment_url,
                timeout: Duration::from_secs(
                    service.timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
                ),
            },
            stream: StreamSettings {
                broker: stream
                    .broker
                    .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                topic: stream.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                client_id: stream
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: stream.username,
                password: stream.password,
                reconnect_delay: stream
                    .reconnect_delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_RECONNECT_DELAY),
                tls_ca_path: stream.tls_ca_path,
                tls_client_cert_path: stream.tls_client_cert_path,
                tls_client_key_path: stream.tls_client_key_path,
            },
            poll_interval: Duration::from_secs(
                file.poll
                    .and_then(|poll| poll.interval_secs)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            mode,
            camera: session.camera.unwrap_or(0),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("ROADWATCH_SERVICE_URL") {
            self.service.base_url = url;
        }
        if let Some(url) = non_empty_env("ROADWATCH_ENRICHMENT_URL") {
            self.service.enrichment_url = Some(url);
        }
        if let Some(timeout) = non_empty_env("ROADWATCH_HTTP_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("ROADWATCH_HTTP_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.service.timeout = Duration::from_secs(seconds);
        }
        if let Some(broker) = non_empty_env("ROADWATCH_MQTT_BROKER") {
            self.stream.broker = broker;
        }
        if let Some(topic) = non_empty_env("ROADWATCH_MQTT_TOPIC") {
            self.stream.topic = topic;
        }
        if let Some(client_id) = non_empty_env("ROADWATCH_MQTT_CLIENT_ID") {
            self.stream.client_id = client_id;
        }
        if let Some(username) = non_empty_env("ROADWATCH_MQTT_USERNAME") {
            self.stream.username = Some(username);
        }
        if let Some(password) = non_empty_env("ROADWATCH_MQTT_PASSWORD") {
            self.stream.password = Some(password);
        }
        if let Some(interval) = non_empty_env("ROADWATCH_POLL_INTERVAL_SECS") {
            let seconds: u64 = interval.parse().map_err(|_| {
                anyhow!("ROADWATCH_POLL_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.poll_interval = Duration::from_secs(seconds);
        }
        if let Some(mode) = non_empty_env("ROADWATCH_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(camera) = non_empty_env("ROADWATCH_CAMERA") {
            self.camera = camera
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_CAMERA must be a camera index"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_http_url("service.base_url", &self.service.base_url)?;
        if let Some(url) = &self.service.enrichment_url {
            validate_http_url("service.enrichment_url", url)?;
        }
        if self.service.timeout.is_zero() {
            return Err(anyhow!("service timeout must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.stream.reconnect_delay.is_zero() {
            return Err(anyhow!("stream reconnect delay must be greater than zero"));
        }
        if self.stream.topic.trim().is_empty() {
            return Err(anyhow!("stream topic must not be empty"));
        }
        Ok(())
    }
}

fn validate_http_url(key: &str, value: &str) -> Result<()> {
    let url = url::Url::parse(value).with_context(|| format!("{} is not a valid url", key))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("{} must use http or https, got '{}'", key, other)),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RoadwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
