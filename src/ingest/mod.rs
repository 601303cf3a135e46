//! Sample ingestion.
//!
//! This module contains:
//! - The validator that checks and normalises raw samples
//! - The pipeline that classifies, persists and fans out each sample

pub mod pipeline;
pub mod validator;

// Re-export commonly used types
pub use pipeline::{IngestPipeline, Ingested};
pub use validator::{IngestValidator, TimestampSource, ValidSample, DEFAULT_DEVICE_ID};

use crate::session::Role;
use crate::store::StoreError;

/// Reasons a sample is not accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestError {
    /// The submitting connection is not a producer
    Unauthorized(Role),
    /// The payload is not a JSON object
    NotAnObject,
    /// Required fields absent (or null)
    MissingFields(Vec<String>),
    /// Required fields present but not numeric
    InvalidFields(Vec<String>),
    /// The classified record could not be stored
    Persistence(StoreError),
}

impl IngestError {
    /// Stable code sent on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Unauthorized(_) => "UNAUTHORIZED",
            IngestError::NotAnObject
            | IngestError::MissingFields(_)
            | IngestError::InvalidFields(_) => "VALIDATION_ERROR",
            IngestError::Persistence(_) => "PERSISTENCE_FAILURE",
        }
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Unauthorized(role) => write!(
                f,
                "Unauthorized: only producer clients can send sensor data (role: {role})"
            ),
            IngestError::NotAnObject => write!(f, "Sensor data must be a JSON object"),
            IngestError::MissingFields(names) => {
                write!(f, "Missing required fields: {}", names.join(", "))
            }
            IngestError::InvalidFields(names) => {
                write!(f, "Fields must be numeric: {}", names.join(", "))
            }
            IngestError::Persistence(e) => write!(f, "Failed to save data: {e}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        IngestError::Persistence(e)
    }
}
