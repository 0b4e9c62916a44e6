use crate::db::{
    check_interval, PatientRecord, RawData, SessionRecord, SessionStore, StoreError, StoreResult,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SESSION_COLUMNS: &str =
    "record_id, patient_health_number, ecmo_start, ecmo_end, eeg_file, fnirs_file";

/// SQLite-backed patient and session store
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open session database at {}", db_path.display()))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        info!("Session database ready at {}", db_path.display());
        Ok(store)
    }

    /// Private database that lives as long as the store
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS patients (
                health_number TEXT PRIMARY KEY,
                patient_name TEXT NOT NULL,
                birthdate TEXT NOT NULL,
                ecmo_reason TEXT
            )",
            [],
        )
        .context("Failed to create patients table")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS recordings (
                record_id INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_health_number TEXT NOT NULL,
                ecmo_start TEXT NOT NULL,
                ecmo_end TEXT NOT NULL,
                eeg_file BLOB,
                fnirs_file BLOB,
                FOREIGN KEY(patient_health_number) REFERENCES patients(health_number)
            )",
            [],
        )
        .context("Failed to create recordings table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_recordings_patient
             ON recordings(patient_health_number, ecmo_start)",
            [],
        )
        .context("Failed to create recordings index")?;

        Ok(())
    }

    /// Insert or replace a patient
    pub fn add_patient(&self, patient: &PatientRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO patients (health_number, patient_name, birthdate, ecmo_reason)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                patient.health_number,
                patient.name,
                patient.birthdate,
                patient.ecmo_reason
            ],
        )?;
        debug!("Stored patient {}", patient.health_number);
        Ok(())
    }

    pub fn patient(&self, health_number: &str) -> StoreResult<Option<PatientRecord>> {
        let conn = self.conn.lock();
        let patient = conn
            .query_row(
                "SELECT health_number, patient_name, birthdate, ecmo_reason
                 FROM patients WHERE health_number = ?1",
                params![health_number],
                |row| {
                    Ok(PatientRecord {
                        health_number: row.get(0)?,
                        name: row.get(1)?,
                        birthdate: row.get(2)?,
                        ecmo_reason: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(patient)
    }

    pub fn all_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM recordings ORDER BY ecmo_start ASC, record_id ASC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Remove every recording and patient
    pub fn clear(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM recordings", [])?;
        conn.execute("DELETE FROM patients", [])?;
        info!("Cleared session database");
        Ok(())
    }
}

fn session_from_row(row: &Row) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: Some(row.get(0)?),
        patient_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: Some(row.get(3)?),
        raw: RawData {
            eeg: row.get(4)?,
            fnirs: row.get(5)?,
        },
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn add_session_record(
        &self,
        patient_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        raw: Option<RawData>,
    ) -> StoreResult<i64> {
        check_interval(started_at, ended_at)?;
        let raw = raw.unwrap_or_default();

        let conn = self.conn.lock();
        let known = conn
            .query_row(
                "SELECT 1 FROM patients WHERE health_number = ?1",
                params![patient_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !known {
            return Err(StoreError::PatientNotFound(patient_id.to_string()));
        }

        conn.execute(
            "INSERT INTO recordings
             (patient_health_number, ecmo_start, ecmo_end, eeg_file, fnirs_file)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![patient_id, started_at, ended_at, raw.eeg, raw.fnirs],
        )?;
        let id = conn.last_insert_rowid();

        info!("Stored session {} for patient {}", id, patient_id);
        Ok(id)
    }

    async fn sessions_for_patient(&self, patient_id: &str) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM recordings
             WHERE patient_health_number = ?1
             ORDER BY ecmo_start ASC, record_id ASC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![patient_id], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM recordings WHERE record_id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::SessionNotFound(id));
        }
        debug!("Deleted session {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use tempfile::TempDir;

    fn patient(id: &str) -> PatientRecord {
        PatientRecord::new(
            id,
            "Jane Doe",
            NaiveDate::from_ymd_opt(1980, 4, 12).unwrap(),
        )
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_list_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteSessionStore::open(&temp_dir.path().join("ecmo.db")).unwrap();
        store.add_patient(&patient("1001")).unwrap();
        store.add_patient(&patient("1002")).unwrap();

        let raw = RawData {
            eeg: Some(vec![1, 2, 3]),
            fnirs: None,
        };
        let later = store
            .add_session_record("1001", at(10), at(11), Some(raw.clone()))
            .await
            .unwrap();
        let earlier = store
            .add_session_record("1001", at(8), at(9), None)
            .await
            .unwrap();
        store
            .add_session_record("1002", at(8), at(12), None)
            .await
            .unwrap();

        let sessions = store.sessions_for_patient("1001").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, Some(earlier));
        assert_eq!(sessions[1].id, Some(later));
        assert_eq!(sessions[1].raw, raw);
        assert_eq!(sessions[1].started_at, at(10));
        assert_eq!(sessions[1].duration(), Some(Duration::hours(1)));

        assert_eq!(store.all_sessions().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_patient_rejected() {
        let store = SqliteSessionStore::in_memory().unwrap();

        let result = store.add_session_record("9999", at(8), at(9), None).await;
        assert!(matches!(result, Err(StoreError::PatientNotFound(id)) if id == "9999"));
        assert!(store.all_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_before_start_rejected() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.add_patient(&patient("1001")).unwrap();

        let result = store.add_session_record("1001", at(9), at(8), None).await;
        assert!(matches!(result, Err(StoreError::InvalidRecord(_))));
    }

    #[tokio::test]
    async fn test_delete_session() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.add_patient(&patient("1001")).unwrap();
        let id = store
            .add_session_record("1001", at(8), at(9), None)
            .await
            .unwrap();

        store.delete_session(id).await.unwrap();
        assert!(store.sessions_for_patient("1001").await.unwrap().is_empty());
        assert!(matches!(
            store.delete_session(id).await,
            Err(StoreError::SessionNotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ecmo.db");

        {
            let store = SqliteSessionStore::open(&path).unwrap();
            let mut record = patient("1001");
            record.ecmo_reason = Some("Cardiogenic shock".to_string());
            store.add_patient(&record).unwrap();
            store
                .add_session_record("1001", at(8), at(9), None)
                .await
                .unwrap();
        }

        let store = SqliteSessionStore::open(&path).unwrap();
        let stored = store.patient("1001").unwrap().unwrap();
        assert_eq!(stored.ecmo_reason.as_deref(), Some("Cardiogenic shock"));
        assert_eq!(stored.birthdate, NaiveDate::from_ymd_opt(1980, 4, 12).unwrap());
        assert_eq!(store.sessions_for_patient("1001").await.unwrap().len(), 1);

        store.clear().unwrap();
        assert!(store.patient("1001").unwrap().is_none());
        assert!(store.all_sessions().unwrap().is_empty());
    }
}
