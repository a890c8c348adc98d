//! Collaborator interfaces.
//!
//! The detection service owns the cameras and the inference loop; the
//! enrichment service turns class labels into descriptive sign records.
//! Both are traits so the controller can be driven by any transport, and
//! both are `Send + Sync` because requests are issued from worker threads.

pub mod http;

use crate::error::ServiceError;
use crate::{CameraIndex, CaptureMode, SignRecord};

pub trait DetectionService: Send + Sync {
    /// Camera indices currently available to the detector.
    fn list_cameras(&self) -> Result<Vec<CameraIndex>, ServiceError>;

    /// Start capture on `camera` using the pipeline selected by `mode`.
    fn start_capture(&self, mode: CaptureMode, camera: CameraIndex) -> Result<(), ServiceError>;

    /// Stop capture. `Ok` only when the service confirmed the stop.
    fn stop_capture(&self) -> Result<(), ServiceError>;

    /// The authoritative sign list.
    fn list_signs(&self) -> Result<Vec<SignRecord>, ServiceError>;
}

pub trait EnrichmentService: Send + Sync {
    /// Describe every label, in order.
    fn enrich(&self, labels: &[String]) -> Result<Vec<SignRecord>, ServiceError>;
}
