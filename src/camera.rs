//! Camera control facade.
//!
//! Start is optimistic: the session is marked active before the service
//! answers, so the dashboard reflects the operator's intent at once. Stop is
//! confirmed: the session only goes idle when the service acknowledged it,
//! so a failed stop never hides a camera that is still running.

use std::sync::Arc;

use crate::error::{ControllerError, ServiceError, UsageError};
use crate::service::DetectionService;
use crate::session::SessionState;
use crate::{CameraIndex, CaptureMode};

/// Result of an accepted start call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Confirmed,
    /// The request failed but the session stays active.
    Unconfirmed(ServiceError),
}

pub struct CameraControl {
    service: Arc<dyn DetectionService>,
    session: SessionState,
    cameras: Vec<CameraIndex>,
}

impl CameraControl {
    pub fn new(service: Arc<dyn DetectionService>, session: SessionState) -> Self {
        Self {
            service,
            session,
            cameras: Vec::new(),
        }
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    /// Camera indices from the last enumeration.
    pub fn cameras(&self) -> &[CameraIndex] {
        &self.cameras
    }

    /// Enumerate cameras once. A failed query yields an empty list.
    pub fn list_cameras(&mut self) -> Vec<CameraIndex> {
        self.cameras = match self.service.list_cameras() {
            Ok(cameras) => cameras,
            Err(e) => {
                log::warn!("camera enumeration failed: {}", e);
                Vec::new()
            }
        };
        log::info!("available cameras: {:?}", self.cameras);
        self.cameras.clone()
    }

    pub fn set_mode(&mut self, mode: CaptureMode) -> Result<(), UsageError> {
        self.session.set_mode(mode)
    }

    /// Select a camera. It must be one of the last enumerated indices.
    pub fn set_camera(&mut self, camera: CameraIndex) -> Result<(), UsageError> {
        if self.session.is_active() {
            return Err(UsageError::CaptureActive("camera"));
        }
        if !self.cameras.contains(&camera) {
            return Err(UsageError::UnknownCamera {
                camera,
                known: self.cameras.clone(),
            });
        }
        self.session.set_camera(camera)
    }

    /// Select `mode` and `camera`, then start capture.
    pub fn start(
        &mut self,
        mode: CaptureMode,
        camera: CameraIndex,
    ) -> Result<StartOutcome, ControllerError> {
        if self.session.is_active() {
            return Err(UsageError::AlreadyStarted.into());
        }
        if camera != self.session.camera() {
            self.set_camera(camera)?;
        }
        self.session.set_mode(mode)?;
        Ok(self.start_selected()?)
    }

    /// Start capture with the current selection.
    pub fn start_selected(&mut self) -> Result<StartOutcome, UsageError> {
        if self.session.is_active() {
            return Err(UsageError::AlreadyStarted);
        }
        let mode = self.session.mode();
        let camera = self.session.camera();
        self.session.mark_started();
        log::info!("starting capture: mode={} camera={}", mode, camera);

        match self.service.start_capture(mode, camera) {
            Ok(()) => Ok(StartOutcome::Confirmed),
            Err(e) => {
                log::warn!("start request failed, session stays active: {}", e);
                Ok(StartOutcome::Unconfirmed(e))
            }
        }
    }

    /// Stop capture. The session only goes idle on a confirmed stop.
    ///
    /// Stopping an idle session still issues the request.
    pub fn stop(&mut self) -> Result<(), ServiceError> {
        match self.service.stop_capture() {
            Ok(()) => {
                self.session.mark_stopped();
                log::info!("capture stopped");
                Ok(())
            }
            Err(e) => {
                log::warn!("error stopping the camera: {}", e);
                Err(e)
            }
        }
    }
}
