//! Stress Monitor - real-time stress classification hub for wearable sensors.
//!
//! Sensor devices stream heart rate, skin temperature and electrodermal
//! activity over a WebSocket (or plain HTTP). Each sample is validated,
//! scored by a stress model, stored, and pushed live to connected
//! dashboards. High-stress samples additionally raise an alert for
//! dashboards that subscribed to alerts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Stress Monitor                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │  Validator  │──▶│   Model     │──▶│   Store     │        │
//! │  │ (ingest)    │   │ (classify)  │   │ (persist)   │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! │         ▲                                    │              │
//! │         │                                    ▼              │
//! │  ┌─────────────┐                     ┌─────────────┐        │
//! │  │  Registry   │                     │ Room Router │──▶ observers
//! │  │ (producers) │                     │  + Alerts   │──▶ alert-subscribers
//! │  └─────────────┘                     └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stress_monitor::{hub::{Hub, HubSettings}, model::BaselineModel, store::MemoryStore, Role};
//!
//! # async fn demo() {
//! let hub = Hub::new(
//!     HubSettings::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(BaselineModel::default()),
//! );
//! let (id, mut outbox) = hub.connect(Role::Producer).await;
//! hub.handle_text(id, r#"{"event": "submit_sample", "data": {"hr": 88, "temp": 36.9, "eda": 0.7}}"#)
//!     .await;
//! while let Ok(message) = outbox.try_recv() {
//!     println!("{}", message.to_json());
//! }
//! # }
//! ```

pub mod alert;
pub mod config;
pub mod history;
pub mod hub;
pub mod ingest;
pub mod model;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

// Re-export key types at crate root for convenience
pub use alert::{Alert, AlertPolicy};
pub use config::{Config, ConfigError};
pub use history::{HistoryLimits, HistoryRequest, HistoryService};
pub use hub::{Hub, HubSettings};
pub use ingest::{IngestError, IngestPipeline, IngestValidator};
pub use model::{ClassificationInvoker, ModelError, Prediction, SensorReading, StressModel};
pub use protocol::{ClientEvent, ServerMessage};
pub use session::{ClientCounts, ConnectionId, ConnectionRegistry, Role, Room, RoomRouter};
pub use store::{ClassifiedRecord, RecordStore, StoreError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default `tracing` filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "stress_monitor=info,tower_http=info";
