use thiserror::Error;

use crate::windowing::domain::window::Window;

use super::vitals_estimate::VitalsEstimate;

/// Backend failure, split by whether retrying can help.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimationError {
    #[error("transient estimation failure: {0}")]
    Transient(String),
    #[error("permanent estimation failure: {0}")]
    Permanent(String),
}

/// Caller-supplied secrets for remote backends.
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
    pub api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Turns a window of face crops into vitals.
///
/// The algorithm behind it is opaque; implementations may be local
/// models or remote services. Stateful implementations are allowed,
/// hence `&mut self`.
pub trait EstimationBackend: Send {
    fn estimate(
        &mut self,
        window: &Window,
        credentials: &Credentials,
    ) -> Result<VitalsEstimate, EstimationError>;

    fn name(&self) -> &str;
}

/// Builds a backend for a new session.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn EstimationBackend>, EstimationError>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Result<Box<dyn EstimationBackend>, EstimationError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn EstimationBackend>, EstimationError> {
        self()
    }
}
