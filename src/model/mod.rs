//! Stress classification.
//!
//! The predictive model is a black box behind [`StressModel`]. The ingest
//! path never talks to it directly: it goes through
//! [`ClassificationInvoker`], which turns every kind of model failure into
//! the degraded prediction (`"error"`, `0.0`) instead of failing the sample.

pub mod baseline;
#[cfg(feature = "remote-model")]
pub mod remote;

pub use baseline::{BaselineModel, RestingBaseline};
#[cfg(feature = "remote-model")]
pub use remote::RemoteModel;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Label of the degraded prediction.
pub const DEGRADED_LABEL: &str = "error";

/// Confidence of the degraded prediction.
pub const DEGRADED_CONFIDENCE: f64 = 0.0;

/// Stress labels produced by the bundled models.
pub const LABEL_NORMAL: &str = "normal";
pub const LABEL_MEDIUM: &str = "medium";
pub const LABEL_HIGH_STRESS: &str = "high_stress";
pub const LABEL_VERY_HIGH_STRESS: &str = "very_high_stress";

/// Physiological inputs to the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub hr: f64,
    pub temp: f64,
    pub eda: f64,
}

/// Model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// The result substituted when classification fails.
    pub fn degraded() -> Self {
        Self::new(DEGRADED_LABEL, DEGRADED_CONFIDENCE)
    }

    pub fn is_degraded(&self) -> bool {
        self.label == DEGRADED_LABEL && self.confidence == DEGRADED_CONFIDENCE
    }

    fn check(self) -> Result<Self, ModelError> {
        if self.label.trim().is_empty() {
            return Err(ModelError::Malformed("empty label".to_string()));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ModelError::Malformed(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(self)
    }
}

/// Model failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Model could not be reached or loaded
    Unavailable(String),
    /// Model answered with something that is not a prediction
    Malformed(String),
    /// Model did not answer in time
    Timeout(Duration),
    /// Model panicked
    Panicked,
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Unavailable(e) => write!(f, "Model unavailable: {e}"),
            ModelError::Malformed(e) => write!(f, "Malformed model output: {e}"),
            ModelError::Timeout(d) => write!(f, "Model timed out after {}ms", d.as_millis()),
            ModelError::Panicked => write!(f, "Model panicked"),
        }
    }
}

impl std::error::Error for ModelError {}

/// A stress classifier.
pub trait StressModel: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn predict(&self, reading: SensorReading) -> BoxFuture<'_, Result<Prediction, ModelError>>;
}

/// Which model backs the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Baseline,
    Remote,
}

/// Model selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: ModelKind,
    /// Scoring endpoint for the remote model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::Baseline,
            endpoint: None,
        }
    }
}

/// Build the model selected by the configuration.
pub fn build_model(config: &ModelConfig) -> Result<Arc<dyn StressModel>, ModelError> {
    match config.kind {
        ModelKind::Baseline => Ok(Arc::new(BaselineModel::default())),
        #[cfg(feature = "remote-model")]
        ModelKind::Remote => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                ModelError::Unavailable("remote model selected without an endpoint".to_string())
            })?;
            Ok(Arc::new(RemoteModel::new(endpoint)?))
        }
        #[cfg(not(feature = "remote-model"))]
        ModelKind::Remote => Err(ModelError::Unavailable(
            "remote model requires the remote-model feature".to_string(),
        )),
    }
}

/// Calls the model and never fails.
#[derive(Clone)]
pub struct ClassificationInvoker {
    model: Arc<dyn StressModel>,
    timeout: Duration,
}

impl ClassificationInvoker {
    pub fn new(model: Arc<dyn StressModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Classify a reading, substituting [`Prediction::degraded`] on any failure.
    pub async fn classify(&self, hr: f64, temp: f64, eda: f64) -> Prediction {
        let reading = SensorReading { hr, temp, eda };
        match self.try_classify(reading).await {
            Ok(prediction) => prediction,
            Err(e) => {
                tracing::warn!(
                    "Stress prediction degraded ({}): {} [hr={}, temp={}, eda={}]",
                    self.model.name(),
                    e,
                    hr,
                    temp,
                    eda
                );
                Prediction::degraded()
            }
        }
    }

    async fn try_classify(&self, reading: SensorReading) -> Result<Prediction, ModelError> {
        let call = AssertUnwindSafe(self.model.predict(reading)).catch_unwind();
        match tokio::time::timeout(self.timeout, call).await {
            Err(_) => Err(ModelError::Timeout(self.timeout)),
            Ok(Err(_)) => Err(ModelError::Panicked),
            Ok(Ok(result)) => result?.check(),
        }
    }
}
