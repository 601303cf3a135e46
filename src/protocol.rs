//! Wire protocol for the real-time channel.
//!
//! Every frame is a JSON envelope `{"event": <name>, "data": <payload>}`.
//! Inbound event names are resolved through [`DISPATCH_TABLE`], which pairs
//! each name (including legacy device aliases) with the decoder for its
//! payload. Outbound events are built by the constructors on
//! [`ServerMessage`].

use crate::alert::{to_percent, Alert};
use crate::history::{HistoryPage, HistoryParams, HistoryRequest};
use crate::ingest::{IngestError, Ingested};
use crate::model::Prediction;
use crate::session::{ClientCounts, ConnectionId, Role, Room};
use crate::store::ClassifiedRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outbound event names.
pub mod events {
    pub const CONNECTION_STATUS: &str = "connection_status";
    pub const SAMPLE_ACK: &str = "sample_ack";
    pub const SENSOR_RECORD: &str = "sensor_record";
    pub const STRESS_ALERT: &str = "stress_alert";
    pub const CLIENT_STATS: &str = "client_stats";
    pub const HISTORY_RESULT: &str = "history_result";
    pub const SUBSCRIPTION_STATUS: &str = "subscription_status";
    pub const PONG: &str = "pong";
    pub const HEALTH_STATUS: &str = "health_status";
    pub const ERROR: &str = "error";
}

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// A decoded client event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Producer submits one sample (validated later by the pipeline)
    SubmitSample(Value),
    /// Observer asks for past records
    RequestHistory(HistoryRequest),
    /// Observer opts in to alerts
    SubscribeAlerts,
    /// Observer opts out of alerts
    UnsubscribeAlerts,
    Ping,
    HealthCheck,
}

/// Turns an event payload into a [`ClientEvent`].
pub type Decoder = fn(Value) -> Result<ClientEvent, ProtocolError>;

fn decode_sample(data: Value) -> Result<ClientEvent, ProtocolError> {
    Ok(ClientEvent::SubmitSample(data))
}

fn decode_history(data: Value) -> Result<ClientEvent, ProtocolError> {
    Ok(ClientEvent::RequestHistory(HistoryRequest::from_value(&data)))
}

fn decode_subscribe(_: Value) -> Result<ClientEvent, ProtocolError> {
    Ok(ClientEvent::SubscribeAlerts)
}

fn decode_unsubscribe(_: Value) -> Result<ClientEvent, ProtocolError> {
    Ok(ClientEvent::UnsubscribeAlerts)
}

fn decode_ping(_: Value) -> Result<ClientEvent, ProtocolError> {
    Ok(ClientEvent::Ping)
}

fn decode_health(_: Value) -> Result<ClientEvent, ProtocolError> {
    Ok(ClientEvent::HealthCheck)
}

/// Inbound event name → payload decoder.
pub const DISPATCH_TABLE: &[(&str, Decoder)] = &[
    ("submit_sample", decode_sample),
    ("esp32_sensor_data", decode_sample),
    ("request_history", decode_history),
    ("frontend_request_history", decode_history),
    ("subscribe_alerts", decode_subscribe),
    ("frontend_subscribe_alerts", decode_subscribe),
    ("unsubscribe_alerts", decode_unsubscribe),
    ("ping", decode_ping),
    ("health_check", decode_health),
];

impl ClientEvent {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::decode(&envelope.event, envelope.data)
    }

    /// Decode a named event with its payload.
    pub fn decode(event: &str, data: Value) -> Result<Self, ProtocolError> {
        let (_, decoder) = DISPATCH_TABLE
            .iter()
            .find(|(name, _)| *name == event)
            .ok_or_else(|| ProtocolError::UnknownEvent(event.to_string()))?;
        decoder(data)
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SubmitSample(_) => "submit_sample",
            ClientEvent::RequestHistory(_) => "request_history",
            ClientEvent::SubscribeAlerts => "subscribe_alerts",
            ClientEvent::UnsubscribeAlerts => "unsubscribe_alerts",
            ClientEvent::Ping => "ping",
            ClientEvent::HealthCheck => "health_check",
        }
    }
}

/// Frames that cannot be turned into a [`ClientEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Not a JSON envelope
    Malformed(String),
    /// Envelope names an event nobody handles
    UnknownEvent(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "BAD_MESSAGE",
            ProtocolError::UnknownEvent(_) => "UNKNOWN_EVENT",
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "Malformed message: {e}"),
            ProtocolError::UnknownEvent(name) => write!(f, "Unknown event '{name}'"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ============================================================================
// Outbound
// ============================================================================

/// A server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub event: String,
    pub data: Value,
}

/// Record as broadcast to observers, confidence as a percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub hr: f64,
    pub temp: f64,
    pub eda: f64,
    pub stress_level: String,
    /// Confidence as a percentage (0-100)
    pub confidence: f64,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&ClassifiedRecord> for RecordView {
    fn from(record: &ClassifiedRecord) -> Self {
        Self {
            id: record.id,
            timestamp: record.timestamp,
            hr: record.hr,
            temp: record.temp,
            eda: record.eda,
            stress_level: record.label.clone(),
            confidence: to_percent(record.confidence),
            device_id: record.device_id.clone(),
            notes: record.notes.clone(),
            created_at: record.created_at,
        }
    }
}

/// Reply to a submitted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleAck {
    /// `success` or `error`
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl SampleAck {
    pub fn success(ingested: &Ingested) -> Self {
        Self {
            status: "success".to_string(),
            message: "Data processed successfully".to_string(),
            record_id: Some(ingested.record.id),
            prediction: Some(ingested.prediction.clone()),
            code: None,
        }
    }

    pub fn failure(error: &IngestError) -> Self {
        Self {
            status: "error".to_string(),
            message: error.to_string(),
            record_id: None,
            prediction: None,
            code: Some(error.code().to_string()),
        }
    }

    pub fn from_result(result: &Result<Ingested, IngestError>) -> Self {
        match result {
            Ok(ingested) => Self::success(ingested),
            Err(e) => Self::failure(e),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[derive(Debug, Serialize)]
struct ConnectionStatus<'a> {
    status: &'a str,
    message: String,
    connection_id: ConnectionId,
    role: Role,
    room: Option<Room>,
}

#[derive(Debug, Serialize)]
struct HistoryResult {
    status: &'static str,
    records: Vec<RecordView>,
    count: usize,
    request_params: HistoryParams,
}

/// Body of `health_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub connected_clients: usize,
    pub clients: ClientCounts,
    pub server_info: String,
}

impl ServerMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    fn encode<T: Serialize>(event: &str, payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(data) => Self::new(event, data),
            Err(e) => {
                tracing::error!("Failed to encode '{}' payload: {}", event, e);
                Self::error("INTERNAL_ERROR", "Failed to encode server event")
            }
        }
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({"event": events::ERROR, "data": {"code": "INTERNAL_ERROR", "message": e.to_string()}})
                .to_string()
        })
    }

    pub fn connection_status(id: ConnectionId, role: Role, room: Option<Room>) -> Self {
        let message = match role {
            Role::Producer => "Sensor device connected successfully".to_string(),
            Role::Observer => "Connected to stress monitoring server".to_string(),
            Role::Unknown => "Connected without a role; no rooms joined".to_string(),
        };
        Self::encode(
            events::CONNECTION_STATUS,
            &ConnectionStatus {
                status: "connected",
                message,
                connection_id: id,
                role,
                room,
            },
        )
    }

    pub fn sample_ack(ack: &SampleAck) -> Self {
        Self::encode(events::SAMPLE_ACK, ack)
    }

    pub fn sensor_record(record: &ClassifiedRecord) -> Self {
        Self::encode(events::SENSOR_RECORD, &RecordView::from(record))
    }

    pub fn stress_alert(alert: &Alert) -> Self {
        Self::encode(events::STRESS_ALERT, alert)
    }

    pub fn client_stats(counts: ClientCounts) -> Self {
        Self::encode(events::CLIENT_STATS, &counts)
    }

    pub fn history_result(page: &HistoryPage) -> Self {
        let records: Vec<RecordView> = page.records.iter().map(RecordView::from).collect();
        Self::encode(
            events::HISTORY_RESULT,
            &HistoryResult {
                status: "success",
                count: records.len(),
                records,
                request_params: page.params.clone(),
            },
        )
    }

    pub fn subscription_status(subscribed: bool) -> Self {
        let (status, message) = if subscribed {
            ("subscribed", "Successfully subscribed to stress alerts")
        } else {
            ("unsubscribed", "Unsubscribed from stress alerts")
        };
        Self::new(
            events::SUBSCRIPTION_STATUS,
            json!({"status": status, "message": message}),
        )
    }

    pub fn pong(now: DateTime<Utc>) -> Self {
        Self::new(events::PONG, json!({"timestamp": now}))
    }

    pub fn health_status(status: &HealthStatus) -> Self {
        Self::encode(events::HEALTH_STATUS, status)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            events::ERROR,
            json!({"code": code, "message": message.into()}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_events_and_aliases() {
        assert_eq!(
            ClientEvent::parse(r#"{"event": "ping"}"#).unwrap(),
            ClientEvent::Ping
        );
        assert_eq!(
            ClientEvent::parse(r#"{"event": "frontend_subscribe_alerts", "data": {}}"#).unwrap(),
            ClientEvent::SubscribeAlerts
        );

        let event =
            ClientEvent::parse(r#"{"event": "esp32_sensor_data", "data": {"hr": 75.5}}"#).unwrap();
        assert_eq!(event, ClientEvent::SubmitSample(json!({"hr": 75.5})));
    }

    #[test]
    fn test_history_payload_is_decoded() {
        let event =
            ClientEvent::parse(r#"{"event": "request_history", "data": {"limit": 5, "startDate": "2024-12-01"}}"#)
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::RequestHistory(HistoryRequest {
                limit: Some(5),
                start_date: Some("2024-12-01".to_string()),
                end_date: None,
            })
        );
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        let err = ClientEvent::parse(r#"{"event": "reboot"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownEvent("reboot".to_string()));
        assert_eq!(err.code(), "UNKNOWN_EVENT");

        let err = ClientEvent::parse("not json").unwrap_err();
        assert_eq!(err.code(), "BAD_MESSAGE");
    }

    #[test]
    fn test_every_table_entry_decodes() {
        for (name, _) in DISPATCH_TABLE {
            assert!(ClientEvent::decode(name, json!({})).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_failure_ack_shape() {
        let ack = SampleAck::failure(&IngestError::MissingFields(vec!["hr".to_string()]));
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert_eq!(json["message"], "Missing required fields: hr");
        assert!(json.get("record_id").is_none());
    }

    #[test]
    fn test_connection_status_names_room() {
        let message =
            ServerMessage::connection_status(ConnectionId::new(), Role::Observer, Some(Room::Observers));
        assert_eq!(message.event, events::CONNECTION_STATUS);
        assert_eq!(message.data["room"], "observers");
        assert_eq!(message.data["role"], "observer");
    }

    #[test]
    fn test_frame_round_trips_through_text() {
        let message = ServerMessage::pong(Utc::now());
        let text = message.to_json();
        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, message);
    }
}
