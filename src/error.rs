//! Error taxonomy for the controller.
//!
//! `UsageError` means the caller broke a state rule and nothing was sent.
//! `ServiceError` means a collaborator failed; it is never fatal and never
//! leaves partially applied state behind.

use thiserror::Error;

use crate::CameraIndex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("capture is active; stop it before changing {0}")]
    CaptureActive(&'static str),

    #[error("capture already started; stop it before starting again")]
    AlreadyStarted,

    #[error("camera {camera} is not among the available cameras {known:?}")]
    UnknownCamera {
        camera: CameraIndex,
        known: Vec<CameraIndex>,
    },

    #[error("controller has been disposed")]
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("request to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

impl ServiceError {
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Transport { endpoint, .. }
            | Self::Status { endpoint, .. }
            | Self::Decode { endpoint, .. } => endpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ControllerError {
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}
