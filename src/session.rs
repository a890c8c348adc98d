use crate::error::UsageError;
use crate::{CameraIndex, CaptureMode};

/// Capture lifecycle state.
///
/// Mode and camera are frozen while capture is active. Only the camera
/// facade flips the active flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionState {
    active: bool,
    mode: CaptureMode,
    camera: CameraIndex,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(CaptureMode::default(), 0)
    }
}

impl SessionState {
    pub fn new(mode: CaptureMode, camera: CameraIndex) -> Self {
        Self {
            active: false,
            mode,
            camera,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn camera(&self) -> CameraIndex {
        self.camera
    }

    pub fn set_mode(&mut self, mode: CaptureMode) -> Result<(), UsageError> {
        if self.active {
            return Err(UsageError::CaptureActive("mode"));
        }
        self.mode = mode;
        Ok(())
    }

    pub fn set_camera(&mut self, camera: CameraIndex) -> Result<(), UsageError> {
        if self.active {
            return Err(UsageError::CaptureActive("camera"));
        }
        self.camera = camera;
        Ok(())
    }

    pub(crate) fn mark_started(&mut self) {
        self.active = true;
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.active = false;
    }
}
