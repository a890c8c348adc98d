//! Roadwatch detection dashboard controller
//!
//! This crate implements the client-side controller for a live traffic-sign
//! and pothole detection dashboard. It drives a remote detector through its
//! HTTP control surface, consumes the detector's push stream, and folds
//! everything into one display-ready list of sign records.
//!
//! # Architecture
//!
//! Leaf-first:
//!
//! 1. `session`: capture lifecycle state (active flag, mode, camera).
//! 2. `stream`: subscription to the detection event stream.
//! 3. `poller`: periodic pull of the authoritative sign list.
//! 4. `reconcile`: merges enrichment results, pothole signals and polled
//!    snapshots into the display list, rejecting stale completions.
//! 5. `camera`: start/stop facade over the detection service.
//!
//! `controller` wires the pieces together and owns every thread it spawns.
//! All display mutation happens on a single dispatcher thread, in arrival
//! order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub mod camera;
pub mod config;
pub mod controller;
pub mod error;
pub mod poller;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod stream;
pub mod transport;

pub use camera::{CameraControl, StartOutcome};
pub use controller::{Controller, ControllerOptions, DisplaySnapshot};
pub use error::{ControllerError, ServiceError, UsageError};
pub use reconcile::{EnrichmentOutcome, EnrichmentTicket, ReconciliationEngine};
pub use service::{http::HttpDetectionService, DetectionService, EnrichmentService};
pub use session::SessionState;
pub use stream::{ChannelEventSource, EventSource, StreamItem};
pub use transport::{parse_stream_payload, DetectionEvent};

/// Index of a capture device as enumerated by the detection service.
pub type CameraIndex = u32;

// -------------------- Capture Mode --------------------

/// Which detector pipeline the remote service runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Traffic,
    Pothole,
    Both,
}

impl CaptureMode {
    /// Path of the start endpoint for this mode.
    pub fn start_path(self) -> &'static str {
        match self {
            CaptureMode::Traffic => "/start_camera",
            CaptureMode::Pothole => "/start_camera_pothole",
            CaptureMode::Both => "/start_camera_both",
        }
    }
}

impl FromStr for CaptureMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "traffic" | "signs" => Ok(Self::Traffic),
            "pothole" | "potholes" => Ok(Self::Pothole),
            "both" => Ok(Self::Both),
            other => Err(anyhow::anyhow!(
                "unknown capture mode '{}': expected 'traffic', 'pothole' or 'both'",
                other
            )),
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Traffic => write!(f, "traffic"),
            Self::Pothole => write!(f, "pothole"),
            Self::Both => write!(f, "both"),
        }
    }
}

// -------------------- Sign Records --------------------

pub const POTHOLE_SIGN: &str = "Pothole";
const POTHOLE_PRESENT_DETAILS: &str = "Pothole detected";
const POTHOLE_PRESENT_ACTION: &str = "Slow down and avoid driving into it.";
const POTHOLE_ABSENT_DETAILS: &str = "No pothole detected";
const POTHOLE_ABSENT_ACTION: &str = "Drive Carefully.";

/// One display entry: a sign with its description and recommended action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRecord {
    pub sign: String,
    pub details: String,
    pub action: String,
}

impl SignRecord {
    pub fn new(
        sign: impl Into<String>,
        details: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            sign: sign.into(),
            details: details.into(),
            action: action.into(),
        }
    }

    /// Canned record for a pothole signal.
    pub fn pothole(present: bool) -> Self {
        if present {
            Self::new(POTHOLE_SIGN, POTHOLE_PRESENT_DETAILS, POTHOLE_PRESENT_ACTION)
        } else {
            Self::new(POTHOLE_SIGN, POTHOLE_ABSENT_DETAILS, POTHOLE_ABSENT_ACTION)
        }
    }
}

// -------------------- Shutdown-aware waiting --------------------

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Sleep for `duration` in short slices. Returns true as soon as `shutdown`
/// is set.
pub(crate) fn wait_or_shutdown(duration: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_selects_start_endpoint() {
        assert_eq!(CaptureMode::Traffic.start_path(), "/start_camera");
        assert_eq!(CaptureMode::Pothole.start_path(), "/start_camera_pothole");
        assert_eq!(CaptureMode::Both.start_path(), "/start_camera_both");
    }

    #[test]
    fn mode_from_str_accepts_aliases() {
        assert_eq!("Traffic".parse::<CaptureMode>().unwrap(), CaptureMode::Traffic);
        assert_eq!("potholes".parse::<CaptureMode>().unwrap(), CaptureMode::Pothole);
        assert_eq!(" BOTH ".parse::<CaptureMode>().unwrap(), CaptureMode::Both);
        assert!("lanes".parse::<CaptureMode>().is_err());
    }

    #[test]
    fn mode_display_round_trips_through_from_str() {
        for mode in [CaptureMode::Traffic, CaptureMode::Pothole, CaptureMode::Both] {
            assert_eq!(mode.to_string().parse::<CaptureMode>().unwrap(), mode);
        }
    }

    #[test]
    fn pothole_records_use_canned_messages() {
        let present = SignRecord::pothole(true);
        assert_eq!(present.sign, "Pothole");
        assert_eq!(present.details, "Pothole detected");
        assert_eq!(present.action, "Slow down and avoid driving into it.");

        let absent = SignRecord::pothole(false);
        assert_eq!(absent.details, "No pothole detected");
        assert_eq!(absent.action, "Drive Carefully.");
    }

    #[test]
    fn wait_returns_early_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        let started = Instant::now();
        assert!(wait_or_shutdown(Duration::from_secs(30), &shutdown));
        assert!(started.elapsed() < Duration::from_secs(1));

        let running = AtomicBool::new(false);
        assert!(!wait_or_shutdown(Duration::from_millis(10), &running));
    }

    #[test]
    fn sign_record_deserializes_service_shape() {
        let record: SignRecord = serde_json::from_str(
            r#"{"sign":"Stop Sign","details":"Come to a halt","action":"Stop"}"#,
        )
        .unwrap();
        assert_eq!(record, SignRecord::new("Stop Sign", "Come to a halt", "Stop"));
    }
}
