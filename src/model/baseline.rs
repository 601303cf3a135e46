//! Built-in baseline stress model.
//!
//! Each signal is turned into a z-score against a resting baseline and the
//! weighted sum gives an arousal score. The score is bucketed into four
//! stress bands. Confidence is the probability mass of the chosen band under
//! a normal distribution centred on the score, so readings near a band edge
//! get low confidence and readings deep inside a band get high confidence.

use crate::model::{
    ModelError, Prediction, SensorReading, StressModel, LABEL_HIGH_STRESS, LABEL_MEDIUM,
    LABEL_NORMAL, LABEL_VERY_HIGH_STRESS,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Upper edges of the normal, medium and high bands. Above the last edge is very high.
const BAND_EDGES: [f64; 3] = [1.0, 2.0, 3.0];

/// Spread of the arousal score estimate.
const SCORE_NOISE_SD: f64 = 0.35;

/// Resting reference values and the weight of each signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestingBaseline {
    pub hr_mean: f64,
    pub hr_sd: f64,
    pub temp_mean: f64,
    pub temp_sd: f64,
    pub eda_mean: f64,
    pub eda_sd: f64,
    pub hr_weight: f64,
    pub temp_weight: f64,
    pub eda_weight: f64,
}

impl Default for RestingBaseline {
    fn default() -> Self {
        Self {
            hr_mean: 72.0,
            hr_sd: 10.0,
            temp_mean: 36.5,
            temp_sd: 0.4,
            eda_mean: 0.4,
            eda_sd: 0.15,
            hr_weight: 0.4,
            temp_weight: 0.2,
            eda_weight: 0.4,
        }
    }
}

impl RestingBaseline {
    /// Weighted z-score of a reading. Readings below baseline pull the score down.
    pub fn arousal(&self, reading: &SensorReading) -> f64 {
        let z = |value: f64, mean: f64, sd: f64| if sd > 0.0 { (value - mean) / sd } else { 0.0 };
        self.hr_weight * z(reading.hr, self.hr_mean, self.hr_sd)
            + self.temp_weight * z(reading.temp, self.temp_mean, self.temp_sd)
            + self.eda_weight * z(reading.eda, self.eda_mean, self.eda_sd)
    }
}

/// Stress model driven by a [`RestingBaseline`].
#[derive(Debug, Clone, Default)]
pub struct BaselineModel {
    baseline: RestingBaseline,
}

impl BaselineModel {
    pub fn new(baseline: RestingBaseline) -> Self {
        Self { baseline }
    }

    /// Classify synchronously.
    pub fn score(&self, reading: &SensorReading) -> Result<Prediction, ModelError> {
        if !(reading.hr.is_finite() && reading.temp.is_finite() && reading.eda.is_finite()) {
            return Err(ModelError::Malformed("non-finite input".to_string()));
        }

        let noise =
            Normal::new(0.0, SCORE_NOISE_SD).map_err(|e| ModelError::Unavailable(e.to_string()))?;
        let score = self.baseline.arousal(reading);

        let band = BAND_EDGES
            .iter()
            .position(|edge| score < *edge)
            .unwrap_or(BAND_EDGES.len());
        let lower = if band == 0 { f64::NEG_INFINITY } else { BAND_EDGES[band - 1] };
        let upper = BAND_EDGES.get(band).copied().unwrap_or(f64::INFINITY);

        let mass_below = |edge: f64| {
            if edge == f64::INFINITY {
                1.0
            } else if edge == f64::NEG_INFINITY {
                0.0
            } else {
                noise.cdf(edge - score)
            }
        };
        let confidence = (mass_below(upper) - mass_below(lower)).clamp(0.0, 1.0);

        let label = match band {
            0 => LABEL_NORMAL,
            1 => LABEL_MEDIUM,
            2 => LABEL_HIGH_STRESS,
            _ => LABEL_VERY_HIGH_STRESS,
        };

        Ok(Prediction::new(label, confidence))
    }
}

impl StressModel for BaselineModel {
    fn name(&self) -> &str {
        "baseline"
    }

    fn predict(&self, reading: SensorReading) -> BoxFuture<'_, Result<Prediction, ModelError>> {
        futures::future::ready(self.score(&reading)).boxed()
    }
}
