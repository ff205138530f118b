use thiserror::Error;

use crate::pipeline::session_state::SessionState;

/// Session-level error taxonomy.
///
/// Fatal variants terminate the session and are delivered through the
/// `error` event (or returned from the controller call). Caller-usage
/// errors (`InvalidSource`, `SessionDisposed`, `InvalidState`) are
/// returned synchronously and never reach subscribers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VitalsError {
    #[error("unreadable media: {0}")]
    UnreadableMedia(String),
    #[error("face detector failed to initialize: {0}")]
    DetectorInit(String),
    #[error("face detector failed on {consecutive} consecutive frames")]
    DetectorFailure { consecutive: usize },
    #[error("face lost at frame {frame_index}")]
    FaceLost { frame_index: usize },
    #[error("estimation failed after {attempts} attempts: {message}")]
    TransientEstimation { attempts: u32, message: String },
    #[error("estimation rejected: {0}")]
    PermanentEstimation(String),
    #[error("invalid video source: {0}")]
    InvalidSource(String),
    #[error("session has been disposed")]
    SessionDisposed,
    #[error("cannot {operation} while {from}")]
    InvalidState {
        from: SessionState,
        operation: &'static str,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid decode options: {0}")]
    InvalidDecodeOptions(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl VitalsError {
    /// Whether the error ends a running session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VitalsError::UnreadableMedia(_)
                | VitalsError::DetectorInit(_)
                | VitalsError::DetectorFailure { .. }
                | VitalsError::FaceLost { .. }
                | VitalsError::TransientEstimation { .. }
                | VitalsError::PermanentEstimation(_)
                | VitalsError::Io(_)
        )
    }
}

impl From<std::io::Error> for VitalsError {
    fn from(e: std::io::Error) -> Self {
        VitalsError::Io(e.to_string())
    }
}

/// Recoverable conditions reported through the `warning` event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Warning {
    #[error("{count} frames dropped")]
    FramesDropped { count: usize },

    #[error("face lost at frame {frame_index}")]
    FaceLost { frame_index: usize },

    #[error("frame {index} skipped: {reason}")]
    FrameSkipped { index: usize, reason: String },

    #[error("detection failed on frame {frame_index}: {reason}")]
    DetectionFailed { frame_index: usize, reason: String },

    #[error("estimation retry {attempt}: {reason}")]
    EstimationRetried { attempt: u32, reason: String },

    #[error("window starting at frame {window_start} dropped, estimation is behind")]
    WindowDropped { window_start: usize },
}

pub type Result<T> = std::result::Result<T, VitalsError>;
