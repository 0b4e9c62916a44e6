use crate::db::{
    check_interval, PatientRecord, RawData, SessionRecord, SessionStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct MemoryState {
    patients: HashMap<String, PatientRecord>,
    sessions: Vec<SessionRecord>,
    next_id: i64,
}

/// Process-local store, for tests and runs without a database file
#[derive(Default)]
pub struct InMemorySessionStore {
    state: Mutex<MemoryState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patient(&self, patient: PatientRecord) {
        self.state
            .lock()
            .patients
            .insert(patient.health_number.clone(), patient);
    }

    pub fn all_sessions(&self) -> Vec<SessionRecord> {
        self.state.lock().sessions.clone()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn add_session_record(
        &self,
        patient_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        raw: Option<RawData>,
    ) -> StoreResult<i64> {
        check_interval(started_at, ended_at)?;

        let mut state = self.state.lock();
        if !state.patients.contains_key(patient_id) {
            return Err(StoreError::PatientNotFound(patient_id.to_string()));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.sessions.push(SessionRecord {
            id: Some(id),
            patient_id: patient_id.to_string(),
            started_at,
            ended_at: Some(ended_at),
            raw: raw.unwrap_or_default(),
        });
        Ok(id)
    }

    async fn sessions_for_patient(&self, patient_id: &str) -> StoreResult<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self
            .state
            .lock()
            .sessions
            .iter()
            .filter(|session| session.patient_id == patient_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.started_at);
        Ok(sessions)
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let before = state.sessions.len();
        state.sessions.retain(|session| session.id != Some(id));
        if state.sessions.len() == before {
            return Err(StoreError::SessionNotFound(id));
        }
        Ok(())
    }
}
