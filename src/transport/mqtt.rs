//! MQTT subscription carrying the detection stream.
//!
//! The detector publishes one JSON message per inference pass on a single
//! topic. rumqttc reconnects on the next poll after a connection error; the
//! topic is resubscribed on every ConnAck because sessions start clean.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::Transport;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::{Host, Url};

use crate::stream::{EventSource, StreamItem, Subscription};
use crate::wait_or_shutdown;

pub const DEFAULT_TOPIC: &str = "roadwatch/latest_result";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 10;

/// MQTT broker address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Certificate material for `mqtts` brokers.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// PEM-encoded CA. `None` uses the webpki roots.
    pub ca: Option<Vec<u8>>,
    /// PEM-encoded client certificate and key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Read PEM files. A client cert and key must come together.
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert), Some(key)) => Some((
                read_pem("client cert", cert)?,
                read_pem("client key", key)?,
            )),
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };
        let ca = ca_path.map(|path| read_pem("CA", path)).transpose()?;
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled; use an mqtts:// broker"
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

/// Everything needed to open the detection stream subscription.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsMaterials,
    pub reconnect_delay: Duration,
}

/// `EventSource` backed by an MQTT topic.
pub struct MqttEventSource {
    settings: MqttSettings,
}

impl MqttEventSource {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn connect(&self) -> Result<(Client, Connection)> {
        let endpoint = &self.settings.endpoint;
        let mut options = MqttOptions::new(&self.settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = &self.settings.username {
            options.set_credentials(user, self.settings.password.clone().unwrap_or_default());
        }
        options.set_transport(self.settings.tls.build_transport(endpoint)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        log::info!(
            "connecting to MQTT broker {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            self.settings.username.is_some()
        );
        Ok((client, connection))
    }
}

impl EventSource for MqttEventSource {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn open(self: Box<Self>) -> Result<Subscription> {
        let (client, connection) = self.connect()?;
        let closed = Arc::new(AtomicBool::new(false));
        let closer_flag = closed.clone();
        let closer_client = client.clone();
        let messages = MqttMessages {
            client,
            connection,
            topic: self.settings.topic,
            reconnect_delay: self.settings.reconnect_delay,
            closed,
        };
        Ok(Subscription {
            messages: Box::new(messages),
            close: Box::new(move || {
                closer_flag.store(true, Ordering::SeqCst);
                if let Err(e) = closer_client.try_disconnect() {
                    log::debug!("MQTT disconnect request not sent: {}", e);
                }
            }),
        })
    }
}

struct MqttMessages {
    client: Client,
    connection: Connection,
    topic: String,
    reconnect_delay: Duration,
    closed: Arc<AtomicBool>,
}

impl Iterator for MqttMessages {
    type Item = StreamItem;

    fn next(&mut self) -> Option<StreamItem> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.connection.iter().next()? {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    if let Err(e) = self.client.try_subscribe(self.topic.clone(), QoS::AtMostOnce)
                    {
                        return Some(StreamItem::Disconnected(format!("subscribe failed: {}", e)));
                    }
                    log::info!("subscribed to {}", self.topic);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    return Some(StreamItem::Message(publish.payload.to_vec()));
                }
                Ok(_) => {}
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return None;
                    }
                    wait_or_shutdown(self.reconnect_delay, &self.closed);
                    return Some(StreamItem::Disconnected(e.to_string()));
                }
            }
        }
    }
}

fn read_pem(what: &str, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("failed to read MQTT TLS {} '{}'", what, path.display()))
}

/// Parse a broker address: `host:port`, `[v6]:port`, or either behind an
/// `mqtt`/`tcp` (plain) or `mqtts`/`ssl` (TLS) scheme. The port is required.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let addr = addr.trim();
    let url = if addr.contains("://") {
        Url::parse(addr)
    } else {
        Url::parse(&format!("mqtt://{}", addr))
    }
    .with_context(|| format!("invalid MQTT broker address '{}'", addr))?;

    let use_tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
    };
    let host = match url.host() {
        Some(Host::Ipv6(ip)) => ip.to_string(),
        Some(host) => host.to_string(),
        None => String::new(),
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in '{}'", addr));
    }
    let port = url
        .port()
        .ok_or_else(|| anyhow!("missing MQTT port in '{}'", addr))?;
    if !matches!(url.path(), "" | "/") {
        return Err(anyhow!("unexpected path in MQTT broker address '{}'", addr));
    }

    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

/// Refuse non-loopback brokers unless the operator opted in.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint) -> Result<()> {
    let loopback = endpoint.host.eq_ignore_ascii_case("localhost")
        || endpoint
            .host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);
    if loopback {
        return Ok(());
    }
    Err(anyhow!(
        "MQTT broker {}:{} is not loopback (use --allow-remote-mqtt to override)",
        endpoint.host,
        endpoint.port
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_port_is_plain_tcp() {
        let ep = parse_mqtt_endpoint("127.0.0.1:1883").unwrap();
        assert_eq!(
            ep,
            MqttEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1883,
                use_tls: false,
            }
        );
    }

    #[test]
    fn scheme_selects_tls() {
        let ep = parse_mqtt_endpoint("mqtts://broker.example.com:8883").unwrap();
        assert_eq!(ep.host, "broker.example.com");
        assert!(ep.use_tls);
        assert!(parse_mqtt_endpoint("ssl://broker.example.com:8883").unwrap().use_tls);
        assert!(!parse_mqtt_endpoint("tcp://localhost:1883").unwrap().use_tls);

        assert!(parse_mqtt_endpoint("ws://localhost:9001").is_err());
    }

    #[test]
    fn ipv6_and_malformed_addresses() {
        let ep = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);

        assert!(parse_mqtt_endpoint("localhost").is_err());
        assert!(parse_mqtt_endpoint("localhost:notaport").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
        assert!(parse_mqtt_endpoint("mqtt://localhost:1883/detections").is_err());
    }

    #[test]
    fn only_loopback_brokers_pass() {
        for addr in ["localhost:1883", "[::1]:1883", "mqtt://127.0.0.1:1883"] {
            let ep = parse_mqtt_endpoint(addr).unwrap();
            assert!(validate_loopback_addr(&ep).is_ok(), "{}", addr);
        }

        let remote = parse_mqtt_endpoint("192.168.1.10:1883").unwrap();
        let err = validate_loopback_addr(&remote).unwrap_err();
        assert!(err.to_string().contains("--allow-remote-mqtt"));
    }

    #[test]
    fn tls_materials_require_cert_and_key_together() {
        let cert_only =
            TlsMaterials::load(None, Some(&PathBuf::from("/nonexistent/cert.pem")), None);
        assert!(cert_only.unwrap_err().to_string().contains("without key"));
        let key_only =
            TlsMaterials::load(None, None, Some(&PathBuf::from("/nonexistent/key.pem")));
        assert!(key_only
            .unwrap_err()
            .to_string()
            .contains("without certificate"));
    }

    #[test]
    fn tls_materials_read_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, b"-----BEGIN CERTIFICATE-----\n").unwrap();

        let materials = TlsMaterials::load(Some(&ca), None, None).unwrap();
        assert_eq!(materials.ca.as_deref(), Some(&b"-----BEGIN CERTIFICATE-----\n"[..]));
        assert!(materials.client_auth.is_none());

        let missing = dir.path().join("missing.pem");
        let err = TlsMaterials::load(Some(&missing), None, None).unwrap_err();
        assert!(err.to_string().contains("CA"));
    }

    #[test]
    fn tls_materials_without_tls_are_rejected() {
        let materials = TlsMaterials {
            ca: Some(b"-----BEGIN CERTIFICATE-----".to_vec()),
            client_auth: None,
        };
        let plain = parse_mqtt_endpoint("127.0.0.1:1883").unwrap();
        assert!(materials.build_transport(&plain).is_err());
        assert!(TlsMaterials::default().build_transport(&plain).is_ok());
    }
}
