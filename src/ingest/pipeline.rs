//! The ingest pipeline: validate → classify → persist → broadcast → alert.
//!
//! One pipeline instance runs per sample. A record reaches the observers
//! room only after it has been stored; a storage failure stops the pipeline
//! before anything is broadcast.

use crate::alert::{Alert, AlertPolicy};
use crate::ingest::validator::IngestValidator;
use crate::ingest::IngestError;
use crate::model::{ClassificationInvoker, Prediction};
use crate::protocol::ServerMessage;
use crate::session::{Role, Room, RoomRouter};
use crate::store::{ClassifiedRecord, NewRecord, PersistenceSink};
use serde_json::Value;
use std::sync::Arc;

/// Outcome of a sample that made it all the way through.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub record: ClassifiedRecord,
    pub prediction: Prediction,
    pub alert: Option<Alert>,
    /// Observers the record was queued for
    pub observers_reached: usize,
}

/// Runs samples through validation, classification, storage and fan-out.
pub struct IngestPipeline {
    validator: IngestValidator,
    invoker: ClassificationInvoker,
    sink: PersistenceSink,
    router: Arc<RoomRouter>,
    alerts: AlertPolicy,
}

impl IngestPipeline {
    pub fn new(
        validator: IngestValidator,
        invoker: ClassificationInvoker,
        sink: PersistenceSink,
        router: Arc<RoomRouter>,
        alerts: AlertPolicy,
    ) -> Self {
        Self {
            validator,
            invoker,
            sink,
            router,
            alerts,
        }
    }

    pub fn invoker(&self) -> &ClassificationInvoker {
        &self.invoker
    }

    pub fn alert_policy(&self) -> &AlertPolicy {
        &self.alerts
    }

    /// Process one sample submitted by a connection holding `role`.
    pub async fn submit(&self, role: Role, raw: &Value) -> Result<Ingested, IngestError> {
        let sample = self.validator.validate(role, raw).map_err(|e| {
            match &e {
                IngestError::Unauthorized(_) => tracing::warn!("Rejected sensor data: {}", e),
                _ => tracing::debug!("Rejected sensor data: {}", e),
            }
            e
        })?;

        let reading = sample.reading;
        let prediction = self
            .invoker
            .classify(reading.hr, reading.temp, reading.eda)
            .await;

        let record = self
            .sink
            .append(NewRecord {
                timestamp: sample.timestamp,
                hr: reading.hr,
                temp: reading.temp,
                eda: reading.eda,
                label: prediction.label.clone(),
                confidence: prediction.confidence,
                notes: Some(format!("Data from {}", sample.device_id)),
                device_id: sample.device_id,
            })
            .await
            .map_err(|e| {
                tracing::error!("Database error, sample dropped: {}", e);
                IngestError::Persistence(e)
            })?;

        tracing::info!(
            "Saved sensor data from {}: HR={}, Temp={}, EDA={}, Stress={} ({:.2})",
            record.device_id,
            record.hr,
            record.temp,
            record.eda,
            record.label,
            record.confidence
        );

        let observers_reached = self
            .router
            .broadcast(Room::Observers, ServerMessage::sensor_record(&record))
            .await;

        let alert = self.alerts.evaluate(&record);
        if let Some(alert) = &alert {
            let subscribers = self
                .router
                .broadcast(Room::AlertSubscribers, ServerMessage::stress_alert(alert))
                .await;
            tracing::warn!(
                "Stress alert sent: {} ({:.2}%) to {} subscribers",
                alert.level,
                alert.confidence,
                subscribers
            );
        }

        Ok(Ingested {
            record,
            prediction,
            alert,
            observers_reached,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::FixedModel;
    use crate::model::{ModelError, DEGRADED_LABEL};
    use crate::protocol::events;
    use crate::session::ConnectionId;
    use crate::store::{MemoryStore, RecordQuery, RecordStore, StoreError};
    use serde_json::json;
    use std::time::Duration;

    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn append(&self, _record: NewRecord) -> Result<ClassifiedRecord, StoreError> {
            Err(StoreError::Io("disk full".to_string()))
        }
        fn query(&self, _query: &RecordQuery) -> Result<Vec<ClassifiedRecord>, StoreError> {
            Ok(Vec::new())
        }
        fn get(&self, id: u64) -> Result<ClassifiedRecord, StoreError> {
            Err(StoreError::NotFound(id))
        }
        fn delete(&self, id: u64) -> Result<(), StoreError> {
            Err(StoreError::NotFound(id))
        }
        fn len(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    struct Fixture {
        pipeline: IngestPipeline,
        store: Arc<dyn RecordStore>,
        observer: crate::session::Outbox,
        subscriber: crate::session::Outbox,
    }

    async fn fixture(
        store: Arc<dyn RecordStore>,
        model: Result<Prediction, ModelError>,
    ) -> Fixture {
        let router = Arc::new(RoomRouter::new(16));
        let observer_id = ConnectionId::new();
        let subscriber_id = ConnectionId::new();
        let observer = router.attach(observer_id).await;
        let subscriber = router.attach(subscriber_id).await;
        router.join(observer_id, Room::Observers).await;
        router.join(subscriber_id, Room::AlertSubscribers).await;

        let pipeline = IngestPipeline::new(
            IngestValidator::default(),
            ClassificationInvoker::new(Arc::new(FixedModel(model)), Duration::from_millis(100)),
            PersistenceSink::new(Arc::clone(&store), Duration::from_secs(1)),
            router,
            AlertPolicy::default(),
        );
        Fixture {
            pipeline,
            store,
            observer,
            subscriber,
        }
    }

    fn sample() -> Value {
        json!({"hr": 112.0, "temp": 37.6, "eda": 0.9, "device_id": "ESP32_001"})
    }

    #[tokio::test]
    async fn test_high_stress_sample_is_stored_broadcast_and_alerted() {
        let mut f = fixture(
            Arc::new(MemoryStore::new()),
            Ok(Prediction::new("high_stress", 0.85)),
        )
        .await;

        let ingested = f.pipeline.submit(Role::Producer, &sample()).await.unwrap();
        assert_eq!(ingested.record.id, 1);
        assert_eq!(ingested.observers_reached, 1);
        assert!(ingested.alert.is_some());
        assert_eq!(f.store.len().unwrap(), 1);

        let record = f.observer.try_recv().unwrap();
        assert_eq!(record.event, events::SENSOR_RECORD);
        assert_eq!(record.data["confidence"], 85.0);

        let alert = f.subscriber.try_recv().unwrap();
        assert_eq!(alert.event, events::STRESS_ALERT);
        assert_eq!(alert.data["level"], "high_stress");
    }

    #[tokio::test]
    async fn test_degraded_classification_still_persists_and_broadcasts() {
        let mut f = fixture(
            Arc::new(MemoryStore::new()),
            Err(ModelError::Unavailable("model file missing".into())),
        )
        .await;

        let ingested = f.pipeline.submit(Role::Producer, &sample()).await.unwrap();
        assert_eq!(ingested.record.label, DEGRADED_LABEL);
        assert_eq!(ingested.record.confidence, 0.0);
        assert!(ingested.alert.is_none());
        assert_eq!(f.store.len().unwrap(), 1);
        assert_eq!(f.observer.try_recv().unwrap().data["stress_level"], DEGRADED_LABEL);
        assert!(f.subscriber.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sample_without_timestamp_is_stamped_with_server_time() {
        let f = fixture(
            Arc::new(MemoryStore::new()),
            Ok(Prediction::new("normal", 0.9)),
        )
        .await;

        let before = chrono::Utc::now();
        let ingested = f.pipeline.submit(Role::Producer, &sample()).await.unwrap();
        let after = chrono::Utc::now();

        assert!(ingested.record.timestamp >= before);
        assert!(ingested.record.timestamp <= after);
        let stored = f.store.get(ingested.record.id).unwrap();
        assert!((after - stored.timestamp) < chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_persistence_failure_blocks_broadcast() {
        let mut f = fixture(Arc::new(BrokenStore), Ok(Prediction::new("high_stress", 0.9))).await;

        let err = f.pipeline.submit(Role::Producer, &sample()).await.unwrap_err();
        assert_eq!(err.code(), "PERSISTENCE_FAILURE");
        assert!(f.observer.try_recv().is_err());
        assert!(f.subscriber.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_sample_has_no_side_effects() {
        let mut f = fixture(
            Arc::new(MemoryStore::new()),
            Ok(Prediction::new("normal", 0.9)),
        )
        .await;

        let err = f
            .pipeline
            .submit(Role::Observer, &sample())
            .await
            .unwrap_err();
        assert_eq!(err, IngestError::Unauthorized(Role::Observer));

        let err = f
            .pipeline
            .submit(Role::Producer, &json!({"hr": 80}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IngestError::MissingFields(vec!["temp".into(), "eda".into()])
        );

        assert!(f.store.is_empty().unwrap());
        assert!(f.observer.try_recv().is_err());
    }
}
