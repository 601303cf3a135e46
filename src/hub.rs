//! Transport-independent core of the real-time channel.
//!
//! The [`Hub`] owns the connection registry and room router, runs inbound
//! events through the ingest pipeline and history service, and keeps
//! observers informed of who is connected. The WebSocket layer in
//! [`crate::server`] only moves frames between sockets and the hub.

use crate::alert::AlertPolicy;
use crate::config::Config;
use crate::history::{HistoryLimits, HistoryRequest, HistoryService};
use crate::ingest::{IngestError, IngestPipeline, IngestValidator};
use crate::model::{ClassificationInvoker, Prediction, StressModel};
use crate::protocol::{ClientEvent, HealthStatus, SampleAck, ServerMessage};
use crate::session::{ClientCounts, ConnectionId, ConnectionRegistry, Outbox, Role, Room, RoomRouter};
use crate::store::{PersistenceSink, RecordStore};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Hub tunables.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub outbound_buffer: usize,
    pub persist_timeout: Duration,
    pub classify_timeout: Duration,
    pub alert: AlertPolicy,
    pub history: HistoryLimits,
    pub default_device_id: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings::from(&Config::default())
    }
}

impl From<&Config> for HubSettings {
    fn from(config: &Config) -> Self {
        Self {
            outbound_buffer: config.outbound_buffer,
            persist_timeout: config.persist_timeout,
            classify_timeout: config.classify_timeout,
            alert: config.alert.clone(),
            history: config.history,
            default_device_id: config.default_device_id.clone(),
        }
    }
}

/// Room a role joins on connect.
pub fn home_room(role: Role) -> Option<Room> {
    match role {
        Role::Producer => Some(Room::Producers),
        Role::Observer => Some(Room::Observers),
        Role::Unknown => None,
    }
}

pub struct Hub {
    registry: ConnectionRegistry,
    router: Arc<RoomRouter>,
    pipeline: IngestPipeline,
    history: HistoryService,
    server_info: String,
}

impl Hub {
    pub fn new(
        settings: HubSettings,
        store: Arc<dyn RecordStore>,
        model: Arc<dyn StressModel>,
    ) -> Self {
        let router = Arc::new(RoomRouter::new(settings.outbound_buffer));
        let sink = PersistenceSink::new(store, settings.persist_timeout);
        let pipeline = IngestPipeline::new(
            IngestValidator::new(settings.default_device_id),
            ClassificationInvoker::new(model, settings.classify_timeout),
            sink.clone(),
            Arc::clone(&router),
            settings.alert,
        );
        let history = HistoryService::new(sink, settings.history);

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            registry: ConnectionRegistry::new(),
            router,
            pipeline,
            history,
            server_info: format!("stress-monitor {} on {}", crate::VERSION, host),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &RoomRouter {
        &self.router
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    pub async fn client_counts(&self) -> ClientCounts {
        self.registry.counts_by_role().await
    }

    /// Admit a new connection.
    ///
    /// The connection joins its role's room, receives a one-time
    /// `connection_status`, and observers get fresh client stats.
    pub async fn connect(&self, role: Role) -> (ConnectionId, Outbox) {
        let id = ConnectionId::new();
        let outbox = self.router.attach(id).await;
        self.registry.register(id, role).await;

        let room = home_room(role);
        if let Some(room) = room {
            self.router.join(id, room).await;
        }

        self.router
            .send_to(id, ServerMessage::connection_status(id, role, room))
            .await;
        tracing::info!(
            "Client connected: {} (role: {}, room: {})",
            id,
            role,
            room.map(|r| r.as_str()).unwrap_or("none")
        );

        self.broadcast_stats().await;
        (id, outbox)
    }

    /// Tear down a connection. Safe to call more than once.
    pub async fn disconnect(&self, id: ConnectionId) {
        self.router.detach(id).await;
        match self.registry.unregister(id).await {
            Some(role) => {
                tracing::info!("Client disconnected: {} (role: {})", id, role);
                self.broadcast_stats().await;
            }
            None => tracing::debug!("Disconnect for unknown connection {}", id),
        }
    }

    async fn broadcast_stats(&self) {
        let counts = self.registry.counts_by_role().await;
        self.router
            .broadcast(Room::Observers, ServerMessage::client_stats(counts))
            .await;
    }

    /// Handle one inbound text frame from `id`.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        self.registry.touch(id).await;
        match ClientEvent::parse(text) {
            Ok(event) => self.dispatch(id, event).await,
            Err(e) => {
                tracing::debug!("Bad frame from {}: {}", id, e);
                self.router
                    .send_to(id, ServerMessage::error(e.code(), e.to_string()))
                    .await;
            }
        }
    }

    /// Run a decoded event for `id`.
    pub async fn dispatch(&self, id: ConnectionId, event: ClientEvent) {
        let Some(role) = self.registry.role_of(id).await else {
            tracing::debug!("Ignoring '{}' from departed connection {}", event.name(), id);
            return;
        };

        match event {
            ClientEvent::SubmitSample(raw) => {
                let result = self.pipeline.submit(role, &raw).await;
                let ack = SampleAck::from_result(&result);
                self.router.send_to(id, ServerMessage::sample_ack(&ack)).await;
            }
            ClientEvent::RequestHistory(request) => self.send_history(id, role, &request).await,
            ClientEvent::SubscribeAlerts => {
                if role != Role::Observer {
                    tracing::warn!("Unauthorized alert subscription from {} ({})", id, role);
                    self.router
                        .send_to(
                            id,
                            ServerMessage::error(
                                "UNAUTHORIZED",
                                "Unauthorized: only observer clients can subscribe to alerts",
                            ),
                        )
                        .await;
                    return;
                }
                self.router.join(id, Room::AlertSubscribers).await;
                tracing::info!("Client {} subscribed to stress alerts", id);
                self.router
                    .send_to(id, ServerMessage::subscription_status(true))
                    .await;
            }
            ClientEvent::UnsubscribeAlerts => {
                if self.router.leave(id, Room::AlertSubscribers).await {
                    tracing::info!("Client {} unsubscribed from stress alerts", id);
                }
                self.router
                    .send_to(id, ServerMessage::subscription_status(false))
                    .await;
            }
            ClientEvent::Ping => {
                self.router.send_to(id, ServerMessage::pong(Utc::now())).await;
            }
            ClientEvent::HealthCheck => {
                let status = self.health().await;
                self.router
                    .send_to(id, ServerMessage::health_status(&status))
                    .await;
            }
        }
    }

    async fn send_history(&self, id: ConnectionId, role: Role, request: &HistoryRequest) {
        match self.history.query(role, request).await {
            Ok(page) => {
                tracing::info!(
                    "Sent {} history records to {} (limit {})",
                    page.records.len(),
                    id,
                    page.params.limit
                );
                self.router
                    .send_to(id, ServerMessage::history_result(&page))
                    .await;
            }
            Err(e) => {
                match e.code() {
                    "UNAUTHORIZED" => tracing::warn!("History request from {}: {}", id, e),
                    _ => tracing::error!("History request from {}: {}", id, e),
                }
                self.router
                    .send_to(id, ServerMessage::error(e.code(), e.to_string()))
                    .await;
            }
        }
    }

    /// Liveness snapshot.
    pub async fn health(&self) -> HealthStatus {
        let clients = self.registry.counts_by_role().await;
        HealthStatus {
            status: "healthy".to_string(),
            timestamp: Utc::now(),
            connected_clients: clients.total,
            clients,
            server_info: self.server_info.clone(),
        }
    }

    /// Synchronous ingestion for producers without a persistent connection.
    pub async fn ingest_http(&self, raw: &Value) -> SampleAck {
        let result = self.pipeline.submit(Role::Producer, raw).await;
        SampleAck::from_result(&result)
    }

    /// Classify without storing or broadcasting.
    pub async fn predict(&self, raw: &Value) -> Result<Prediction, IngestError> {
        let reading = crate::ingest::validator::read_sensor_fields(raw)?;
        Ok(self
            .pipeline
            .invoker()
            .classify(reading.hr, reading.temp, reading.eda)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::FixedModel;
    use crate::protocol::events;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn hub_with(prediction: Prediction) -> Hub {
        Hub::new(
            HubSettings::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedModel(Ok(prediction))),
        )
    }

    fn drain(outbox: &mut Outbox) -> Vec<Arc<ServerMessage>> {
        let mut out = Vec::new();
        while let Ok(message) = outbox.try_recv() {
            out.push(message);
        }
        out
    }

    fn events_of(messages: &[Arc<ServerMessage>]) -> Vec<&str> {
        messages.iter().map(|m| m.event.as_str()).collect()
    }

    #[tokio::test]
    async fn test_connect_acknowledges_with_room() {
        let hub = hub_with(Prediction::new("normal", 0.9));
        let (_, mut outbox) = hub.connect(Role::Producer).await;

        let messages = drain(&mut outbox);
        assert_eq!(events_of(&messages), vec![events::CONNECTION_STATUS]);
        assert_eq!(messages[0].data["room"], "producers");
    }

    #[tokio::test]
    async fn test_stats_follow_connects_and_disconnects() {
        let hub = hub_with(Prediction::new("normal", 0.9));
        let (_, mut watcher) = hub.connect(Role::Observer).await;
        let (producer, _p) = hub.connect(Role::Producer).await;
        let (other, _o) = hub.connect(Role::Observer).await;
        hub.disconnect(other).await;

        let stats: Vec<_> = drain(&mut watcher)
            .into_iter()
            .filter(|m| m.event == events::CLIENT_STATS)
            .collect();
        assert_eq!(stats.len(), 4);
        let last: ClientCounts = serde_json::from_value(stats[3].data.clone()).unwrap();
        assert_eq!(
            last,
            ClientCounts {
                producers: 1,
                observers: 1,
                total: 2
            }
        );

        hub.disconnect(producer).await;
        assert_eq!(hub.client_counts().await.total, 1);
    }

    #[tokio::test]
    async fn test_unknown_role_joins_no_room() {
        let hub = hub_with(Prediction::new("normal", 0.9));
        let (id, mut outbox) = hub.connect(Role::Unknown).await;
        for room in Room::ALL {
            assert!(!hub.router().is_member(id, room).await);
        }
        assert!(drain(&mut outbox)[0].data["room"].is_null());
    }

    #[tokio::test]
    async fn test_sample_flows_to_observers_and_subscribers() {
        let hub = hub_with(Prediction::new("very_high_stress", 0.95));
        let (observer, mut observer_out) = hub.connect(Role::Observer).await;
        hub.handle_text(observer, r#"{"event": "subscribe_alerts"}"#).await;
        let (producer, mut producer_out) = hub.connect(Role::Producer).await;
        drain(&mut observer_out);
        drain(&mut producer_out);

        hub.handle_text(
            producer,
            r#"{"event": "esp32_sensor_data", "data": {"hr": 120, "temp": 37.9, "eda": 1.2}}"#,
        )
        .await;

        let acks = drain(&mut producer_out);
        assert_eq!(events_of(&acks), vec![events::SAMPLE_ACK]);
        assert_eq!(acks[0].data["status"], "success");
        assert_eq!(acks[0].data["message"], "Data processed successfully");
        assert_eq!(acks[0].data["prediction"]["label"], "very_high_stress");

        let seen = drain(&mut observer_out);
        assert_eq!(
            events_of(&seen),
            vec![events::SENSOR_RECORD, events::STRESS_ALERT]
        );
        assert_eq!(seen[0].data["device_id"], "ESP32_Unknown");
    }

    #[tokio::test]
    async fn test_observer_cannot_submit_and_producer_cannot_subscribe() {
        let hub = hub_with(Prediction::new("normal", 0.9));
        let (observer, mut observer_out) = hub.connect(Role::Observer).await;
        let (producer, mut producer_out) = hub.connect(Role::Producer).await;
        drain(&mut observer_out);
        drain(&mut producer_out);

        hub.handle_text(
            observer,
            r#"{"event": "submit_sample", "data": {"hr": 70, "temp": 36.5, "eda": 0.4}}"#,
        )
        .await;
        let ack = drain(&mut observer_out);
        assert_eq!(ack[0].data["status"], "error");
        assert_eq!(ack[0].data["code"], "UNAUTHORIZED");

        hub.handle_text(producer, r#"{"event": "subscribe_alerts"}"#).await;
        let reply = drain(&mut producer_out);
        assert_eq!(reply[0].event, events::ERROR);
        assert!(!hub.router().is_member(producer, Room::AlertSubscribers).await);

        hub.handle_text(producer, r#"{"event": "request_history", "data": {}}"#)
            .await;
        assert_eq!(drain(&mut producer_out)[0].data["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_history_after_ingest() {
        let hub = hub_with(Prediction::new("medium", 0.6));
        let (producer, _p) = hub.connect(Role::Producer).await;
        for hr in [70, 80, 90] {
            hub.handle_text(
                producer,
                &json!({"event": "submit_sample", "data": {"hr": hr, "temp": 36.5, "eda": 0.4}})
                    .to_string(),
            )
            .await;
        }

        let (observer, mut out) = hub.connect(Role::Observer).await;
        drain(&mut out);
        hub.handle_text(
            observer,
            r#"{"event": "frontend_request_history", "data": {"limit": 2, "start_date": "garbage"}}"#,
        )
        .await;

        let reply = drain(&mut out);
        assert_eq!(reply[0].event, events::HISTORY_RESULT);
        assert_eq!(reply[0].data["count"], 2);
        assert_eq!(reply[0].data["request_params"]["limit"], 2);
        assert!(reply[0].data["request_params"]["start_date"].is_null());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_utility_events() {
        let hub = hub_with(Prediction::new("normal", 0.9));
        let (id, mut out) = hub.connect(Role::Observer).await;
        hub.handle_text(id, r#"{"event": "subscribe_alerts"}"#).await;
        hub.handle_text(id, r#"{"event": "unsubscribe_alerts"}"#).await;
        assert!(!hub.router().is_member(id, Room::AlertSubscribers).await);

        hub.handle_text(id, r#"{"event": "ping"}"#).await;
        hub.handle_text(id, r#"{"event": "health_check"}"#).await;
        hub.handle_text(id, "{oops").await;
        hub.handle_text(id, r#"{"event": "self_destruct"}"#).await;

        let messages = drain(&mut out);
        let tail: Vec<_> = messages.iter().rev().take(4).rev().collect();
        assert_eq!(tail[0].event, events::PONG);
        assert_eq!(tail[1].event, events::HEALTH_STATUS);
        assert_eq!(tail[1].data["connected_clients"], 1);
        assert_eq!(tail[2].data["code"], "BAD_MESSAGE");
        assert_eq!(tail[3].data["code"], "UNKNOWN_EVENT");
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_harmless() {
        let hub = hub_with(Prediction::new("normal", 0.9));
        let (id, _out) = hub.connect(Role::Producer).await;
        hub.disconnect(id).await;
        hub.disconnect(id).await;
        assert!(hub.registry().is_empty().await);

        // Events from a departed connection are dropped.
        hub.handle_text(id, r#"{"event": "ping"}"#).await;
    }

    #[tokio::test]
    async fn test_http_paths() {
        let hub = hub_with(Prediction::new("high_stress", 0.8));
        let ack = hub
            .ingest_http(&json!({"hr": 100, "temp": 37.0, "eda": 0.8, "device_id": "ESP32_009"}))
            .await;
        assert!(ack.is_success());
        assert_eq!(ack.record_id, Some(1));

        let ack = hub.ingest_http(&json!({"hr": 100})).await;
        assert_eq!(ack.code.as_deref(), Some("VALIDATION_ERROR"));

        let prediction = hub
            .predict(&json!({"hr": 100, "temp": 37.0, "eda": 0.8}))
            .await
            .unwrap();
        assert_eq!(prediction.label, "high_stress");
        assert!(hub.predict(&json!({"hr": "x", "temp": 37.0, "eda": 0.8})).await.is_err());
    }
}
