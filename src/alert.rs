//! High-stress alerting.
//!
//! An alert fires when a record's label is one of the configured alert
//! labels and its confidence is strictly above the threshold. Alerts are
//! derived on the fly and never stored.

use crate::model::{LABEL_HIGH_STRESS, LABEL_VERY_HIGH_STRESS};
use crate::store::ClassifiedRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default confidence an alert label must exceed.
pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.7;

/// When to raise an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    /// Confidence must be strictly greater than this
    pub threshold: f64,
    /// Labels that can trigger an alert
    pub labels: Vec<String>,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ALERT_THRESHOLD,
            labels: vec![
                LABEL_HIGH_STRESS.to_string(),
                LABEL_VERY_HIGH_STRESS.to_string(),
            ],
        }
    }
}

impl AlertPolicy {
    pub fn new(threshold: f64, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            threshold,
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fires(&self, label: &str, confidence: f64) -> bool {
        confidence > self.threshold && self.labels.iter().any(|l| l == label)
    }

    /// Build the alert for `record`, if the policy fires.
    pub fn evaluate(&self, record: &ClassifiedRecord) -> Option<Alert> {
        if !self.fires(&record.label, record.confidence) {
            return None;
        }
        let percent = to_percent(record.confidence);
        Some(Alert {
            kind: "stress_alert".to_string(),
            level: record.label.clone(),
            confidence: percent,
            timestamp: record.timestamp,
            message: format!(
                "High stress level detected with {:.1}% confidence",
                record.confidence * 100.0
            ),
            record_id: record.id,
            device_id: record.device_id.clone(),
            sensor_data: AlertSample {
                hr: record.hr,
                temp: record.temp,
                eda: record.eda,
            },
        })
    }
}

/// Sensor values that triggered an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSample {
    pub hr: f64,
    pub temp: f64,
    pub eda: f64,
}

/// Alert broadcast to alert subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: String,
    /// Stress label that fired
    pub level: String,
    /// Confidence as a percentage (0-100)
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub record_id: u64,
    pub device_id: String,
    pub sensor_data: AlertSample,
}

/// Convert a [0, 1] confidence to a percentage rounded to two decimals.
pub fn to_percent(confidence: f64) -> f64 {
    (confidence * 100.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(label: &str, confidence: f64) -> ClassifiedRecord {
        ClassifiedRecord {
            id: 7,
            timestamp: Utc::now(),
            hr: 112.0,
            temp: 37.6,
            eda: 0.9,
            label: label.to_string(),
            confidence,
            device_id: "ESP32_001".to_string(),
            notes: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_fires_above_threshold() {
        let policy = AlertPolicy::default();
        let alert = policy.evaluate(&record("high_stress", 0.71)).unwrap();
        assert_eq!(alert.level, "high_stress");
        assert_eq!(alert.confidence, 71.0);
        assert_eq!(alert.record_id, 7);
        assert_eq!(alert.message, "High stress level detected with 71.0% confidence");
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let policy = AlertPolicy::default();
        assert!(policy.evaluate(&record("high_stress", 0.70)).is_none());
    }

    #[test]
    fn test_non_alert_label_never_fires() {
        let policy = AlertPolicy::default();
        assert!(policy.evaluate(&record("medium", 0.99)).is_none());
        assert!(policy.evaluate(&record("error", 0.0)).is_none());
    }

    #[test]
    fn test_very_high_stress_fires() {
        let policy = AlertPolicy::default();
        assert!(policy.evaluate(&record("very_high_stress", 0.95)).is_some());
    }

    #[test]
    fn test_policy_is_overridable() {
        let policy = AlertPolicy::new(0.5, ["medium"]);
        assert!(policy.evaluate(&record("medium", 0.6)).is_some());
        assert!(policy.evaluate(&record("high_stress", 0.99)).is_none());
    }

    #[test]
    fn test_alert_serializes_type_field() {
        let alert = AlertPolicy::default()
            .evaluate(&record("high_stress", 0.8))
            .unwrap();
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "stress_alert");
        assert_eq!(json["sensor_data"]["hr"], 112.0);
    }
}
