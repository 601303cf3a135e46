//! Remote stress model.
//!
//! Posts `{hr, temp, eda}` to an external scoring service and reads back
//! `{prediction | label, confidence}`.

use crate::model::{ModelError, Prediction, SensorReading, StressModel};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;

/// Response body of the scoring service.
#[derive(Debug, Deserialize)]
struct ScoreResponse {
    #[serde(alias = "prediction")]
    label: Option<String>,
    confidence: Option<f64>,
}

/// HTTP client for an external scoring endpoint.
pub struct RemoteModel {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteModel {
    /// Create a client for `endpoint` (full URL of the scoring route).
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ModelError::Unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    async fn score(&self, reading: SensorReading) -> Result<Prediction, ModelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&reading)
            .send()
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ModelError::Unavailable(format!(
                "scoring service returned {status}: {body}"
            )));
        }

        let body: ScoreResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;

        match (body.label, body.confidence) {
            (Some(label), Some(confidence)) => Ok(Prediction::new(label, confidence)),
            _ => Err(ModelError::Malformed(
                "response lacks label or confidence".to_string(),
            )),
        }
    }
}

impl StressModel for RemoteModel {
    fn name(&self) -> &str {
        "remote"
    }

    fn predict(&self, reading: SensorReading) -> BoxFuture<'_, Result<Prediction, ModelError>> {
        self.score(reading).boxed()
    }
}
