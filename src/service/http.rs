//! HTTP client for the detection and enrichment endpoints.
//!
//! Every call is a single blocking request with a bounded timeout. Callers
//! that must not block (the dispatcher) run these on worker threads.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::{DetectionService, EnrichmentService};
use crate::error::ServiceError;
use crate::{CameraIndex, CaptureMode, SignRecord};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const CAMERAS_PATH: &str = "/cameras";
const STOP_PATH: &str = "/stop_camera";
const SIGNS_PATH: &str = "/signs";
const GENERATE_PATH: &str = "/generate";

#[derive(Debug, Deserialize)]
struct CamerasResponse {
    #[serde(default)]
    cameras: Vec<CameraIndex>,
}

#[derive(Debug, Serialize)]
struct StartRequest {
    camera_index: CameraIndex,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    signs: &'a [String],
}

/// `DetectionService` and `EnrichmentService` over HTTP/JSON.
#[derive(Clone, Debug)]
pub struct HttpDetectionService {
    agent: ureq::Agent,
    base_url: String,
    enrichment_url: String,
}

impl HttpDetectionService {
    /// `enrichment_url` defaults to `base_url` when the enrichment endpoint
    /// lives on the detection service itself.
    pub fn new(base_url: &str, enrichment_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base(base_url)?;
        let enrichment_url = match enrichment_url {
            Some(url) => normalize_base(url)?,
            None => base_url.clone(),
        };
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            base_url,
            enrichment_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let endpoint = self.url(path);
        let response = self.agent.get(&endpoint).call();
        decode(&endpoint, check_status(&endpoint, response)?)
    }
}

impl DetectionService for HttpDetectionService {
    fn list_cameras(&self) -> Result<Vec<CameraIndex>, ServiceError> {
        let body: CamerasResponse = self.get_json(CAMERAS_PATH)?;
        Ok(body.cameras)
    }

    fn start_capture(&self, mode: CaptureMode, camera: CameraIndex) -> Result<(), ServiceError> {
        let endpoint = self.url(mode.start_path());
        let response = self.agent.post(&endpoint).send_json(StartRequest {
            camera_index: camera,
        });
        check_status(&endpoint, response)?;
        Ok(())
    }

    fn stop_capture(&self) -> Result<(), ServiceError> {
        let endpoint = self.url(STOP_PATH);
        let response = self.agent.post(&endpoint).call();
        check_status(&endpoint, response)?;
        Ok(())
    }

    fn list_signs(&self) -> Result<Vec<SignRecord>, ServiceError> {
        self.get_json(SIGNS_PATH)
    }
}

impl EnrichmentService for HttpDetectionService {
    fn enrich(&self, labels: &[String]) -> Result<Vec<SignRecord>, ServiceError> {
        let endpoint = format!("{}{}", self.enrichment_url, GENERATE_PATH);
        let response = self
            .agent
            .post(&endpoint)
            .send_json(GenerateRequest { signs: labels });
        decode(&endpoint, check_status(&endpoint, response)?)
    }
}

fn normalize_base(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid service url '{}'", raw))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(anyhow!(
                "unsupported service scheme '{}'; expected http or https",
                other
            ))
        }
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn check_status(
    endpoint: &str,
    response: Result<ureq::Response, ureq::Error>,
) -> Result<ureq::Response, ServiceError> {
    match response {
        Ok(response) if (200..300).contains(&response.status()) => Ok(response),
        Ok(response) => Err(ServiceError::Status {
            endpoint: endpoint.to_string(),
            status: response.status(),
        }),
        Err(ureq::Error::Status(status, _)) => Err(ServiceError::Status {
            endpoint: endpoint.to_string(),
            status,
        }),
        Err(ureq::Error::Transport(transport)) => Err(ServiceError::Transport {
            endpoint: endpoint.to_string(),
            reason: transport.to_string(),
        }),
    }
}

fn decode<T: DeserializeOwned>(endpoint: &str, response: ureq::Response) -> Result<T, ServiceError> {
    let body = response
        .into_string()
        .map_err(|e| ServiceError::Transport {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
    serde_json::from_str(&body).map_err(|e| ServiceError::Decode {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let service =
            HttpDetectionService::new("http://localhost:5000/", None, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(service.base_url(), "http://localhost:5000");
        assert_eq!(service.url(CAMERAS_PATH), "http://localhost:5000/cameras");
        assert_eq!(service.enrichment_url, "http://localhost:5000");
    }

    #[test]
    fn enrichment_url_can_differ() {
        let service = HttpDetectionService::new(
            "http://detector:5000",
            Some("https://signs.example.com/api/"),
            DEFAULT_TIMEOUT,
        )
        .unwrap();
        assert_eq!(service.enrichment_url, "https://signs.example.com/api");
    }

    #[test]
    fn rejects_non_http_schemes() {
        let err = HttpDetectionService::new("mqtt://localhost:1883", None, DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported service scheme"));
        assert!(HttpDetectionService::new("not a url", None, DEFAULT_TIMEOUT).is_err());
    }

    #[test]
    fn start_request_body_matches_wire_shape() {
        let body = serde_json::to_value(StartRequest { camera_index: 1 }).unwrap();
        assert_eq!(body, serde_json::json!({ "camera_index": 1 }));

        let labels = vec!["stop_sign".to_string(), "speed_limit_40".to_string()];
        let body = serde_json::to_value(GenerateRequest { signs: &labels }).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "signs": ["stop_sign", "speed_limit_40"] })
        );
    }
}
