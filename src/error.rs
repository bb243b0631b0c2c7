use reqwest::StatusCode;
use thiserror::Error;

/// Failures that leave the relay core or the producer API client.
///
/// Mid-session forwarding faults are not represented here: they end a pump and
/// are reported through [`crate::pump::PumpEnd`] instead.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("producer unavailable for camera {camera_id} after {attempts} attempts")]
    ProducerUnavailable { camera_id: String, attempts: u32 },

    #[error("connect-camera request failed: {0}")]
    ProducerRequest(#[from] reqwest::Error),

    #[error("connect-camera rejected: {status} {body}")]
    ProducerRejected { status: StatusCode, body: String },
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
