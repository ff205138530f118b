use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::estimation::domain::estimation_backend::{
    Credentials, EstimationBackend, EstimationError,
};
use crate::estimation::domain::vitals_estimate::{QualityFlags, VitalsEstimate};
use crate::windowing::domain::window::Window;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Window summary sent to the service: the per-frame mean colour of the
/// face crop, not the pixels themselves.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EstimateRequest {
    window_start_index: usize,
    window_end_index: usize,
    fps: Option<f64>,
    valid_frames: usize,
    partial: bool,
    rgb: Vec<[f64; 3]>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EstimateResponse {
    /// `null` marks a sample the service could not recover.
    #[serde(default)]
    pulse: Vec<Option<f64>>,
    pulse_rate_bpm: Option<f64>,
    respiration_rate_bpm: Option<f64>,
    confidence: f64,
}

/// Remote backend speaking JSON over HTTP with bearer authentication.
pub struct RemoteEstimator {
    client: Client,
    endpoint: String,
}

impl RemoteEstimator {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, EstimationError> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EstimationError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(EstimationError::Permanent("empty endpoint".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EstimationError::Permanent(format!("http client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EstimationBackend for RemoteEstimator {
    fn estimate(
        &mut self,
        window: &Window,
        credentials: &Credentials,
    ) -> Result<VitalsEstimate, EstimationError> {
        let request = EstimateRequest {
            window_start_index: window.start_index,
            window_end_index: window.end_index(),
            fps: window.fps(),
            valid_frames: window.valid_frames,
            partial: window.partial,
            rgb: window.mean_rgb_trace(),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| EstimationError::Permanent(format!("encode request: {e}")))?;

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = &credentials.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            log::debug!("estimation service answered {status}: {detail}");
            return Err(classify_status(status));
        }

        let bytes = response.bytes().map_err(classify_transport)?;
        let parsed: EstimateResponse = serde_json::from_slice(&bytes)
            .map_err(|e| EstimationError::Permanent(format!("malformed response: {e}")))?;

        Ok(VitalsEstimate {
            window_start_index: window.start_index,
            window_end_index: window.end_index(),
            pulse: parsed
                .pulse
                .into_iter()
                .map(|sample| sample.unwrap_or(f64::NAN))
                .collect(),
            pulse_rate_bpm: parsed.pulse_rate_bpm,
            respiration_rate_bpm: parsed.respiration_rate_bpm,
            confidence: parsed.confidence,
            quality: QualityFlags::default(),
        })
    }

    fn name(&self) -> &str {
        "remote"
    }
}

/// 408, 429 and 5xx are worth retrying; every other failure status is not.
fn classify_status(status: StatusCode) -> EstimationError {
    let message = format!("HTTP {status}");
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        EstimationError::Transient(message)
    } else {
        EstimationError::Permanent(message)
    }
}

fn classify_transport(e: reqwest::Error) -> EstimationError {
    if e.is_builder() || e.is_redirect() {
        EstimationError::Permanent(e.to_string())
    } else {
        EstimationError::Transient(e.to_string())
    }
}
