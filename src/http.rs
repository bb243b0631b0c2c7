use std::time::Duration;

use anyhow::Result;
use reqwest::{Client as HttpClient, ClientBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, RelayResult};

/// HTTP client for the producer's control endpoints.
#[derive(Clone)]
pub struct ProducerApi {
    base: String,
    http: HttpClient,
}

impl ProducerApi {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("camrelay/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()?;
        Ok(ProducerApi {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Ask the producer to start capturing `req.camera_id` from `req.rtsp_url`.
    pub async fn connect_camera(&self, req: &ConnectCameraRequest) -> RelayResult<()> {
        let url = format!("{}/connect-camera", self.base);
        let resp = self.http.post(url).json(req).send().await?;
        map_status(resp).await
    }
}

async fn map_status(resp: Response) -> RelayResult<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RelayError::ProducerRejected { status, body })
}

/// Body of `POST /connect-camera`; also what the relay's `/start-camera` accepts.
///
/// `camera_id` is kept as the caller sent it (string or number) so the producer
/// sees the same JSON type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectCameraRequest {
    #[serde(deserialize_with = "deserialize_camera_id")]
    pub camera_id: Value,
    pub rtsp_url: String,
}

fn deserialize_camera_id<'de, D>(deserializer: D) -> std::result::Result<Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::String(s) if !s.trim().is_empty() => Ok(value),
        Value::Number(_) => Ok(value),
        _ => Err(serde::de::Error::custom(
            "camera_id must be a non-empty string or a number",
        )),
    }
}
