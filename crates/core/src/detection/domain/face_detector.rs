use crate::shared::error::VitalsError;
use crate::shared::frame::RawFrame;
use crate::shared::region::FaceBox;

/// Domain interface for single-face detection.
///
/// Returns the primary face, or `None` when no face is present.
/// Implementations may be stateful, hence `&mut self`.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &RawFrame) -> Result<Option<FaceBox>, Box<dyn std::error::Error>>;
}

/// Builds a detector for a new session.
///
/// Failures surface as `VitalsError::DetectorInit` before any frame is
/// decoded.
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FaceDetector>, VitalsError>;
}

impl<F> DetectorFactory for F
where
    F: Fn() -> Result<Box<dyn FaceDetector>, VitalsError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn FaceDetector>, VitalsError> {
        self()
    }
}
