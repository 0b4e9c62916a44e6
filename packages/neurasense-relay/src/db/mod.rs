// Session persistence
//
// The relay core only ever calls `add_session_record` when a session ends.
// The remaining operations back the patient history views.

pub mod memory_store;
pub mod session_db;

pub use memory_store::InMemorySessionStore;
pub use session_db::SqliteSessionStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in a session store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Patient not found: {0}")]
    PatientNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(i64),

    #[error("Invalid session record: {0}")]
    InvalidRecord(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Raw recording payloads attached to a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawData {
    pub eeg: Option<Vec<u8>>,
    pub fnirs: Option<Vec<u8>>,
}

/// One monitoring period for one patient.
///
/// Open-ended (`ended_at == None`) while the session runs; `id` is assigned by
/// the store once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Option<i64>,
    pub patient_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw: RawData,
}

impl SessionRecord {
    /// Provisional record for a session that just started
    pub fn open(patient_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            patient_id: patient_id.into(),
            started_at,
            ended_at: None,
            raw: RawData::default(),
        }
    }

    pub fn finalize(&mut self, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at);
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Patient demographics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub health_number: String,
    pub name: String,
    pub birthdate: NaiveDate,
    pub ecmo_reason: Option<String>,
}

impl PatientRecord {
    pub fn new(
        health_number: impl Into<String>,
        name: impl Into<String>,
        birthdate: NaiveDate,
    ) -> Self {
        Self {
            health_number: health_number.into(),
            name: name.into(),
            birthdate,
            ecmo_reason: None,
        }
    }
}

/// Storage backend for session records
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a finished session. Returns the new record id.
    async fn add_session_record(
        &self,
        patient_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        raw: Option<RawData>,
    ) -> StoreResult<i64>;

    /// Sessions for one patient, oldest first
    async fn sessions_for_patient(&self, patient_id: &str) -> StoreResult<Vec<SessionRecord>>;

    async fn delete_session(&self, id: i64) -> StoreResult<()>;
}

pub(crate) fn check_interval(
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
) -> StoreResult<()> {
    if ended_at < started_at {
        return Err(StoreError::InvalidRecord(format!(
            "session ends ({}) before it starts ({})",
            ended_at.to_rfc3339(),
            started_at.to_rfc3339()
        )));
    }
    Ok(())
}
