//! Case persistence — the parsed email, per-layer results and final verdict
//! for each processed message.
//!
//! Writes are once per message: a duplicate persist is rejected so retried
//! invocations can never corrupt the recorded evidence history.

use crate::email::ParsedEmail;
use crate::error::PersistenceError;
use crate::pipeline::PipelineResult;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

#[async_trait]
pub trait EmailStorage: Send + Sync {
    /// Persist one invocation's record; returns the new record id.
    async fn persist(
        &self,
        email: &ParsedEmail,
        result: &PipelineResult,
    ) -> Result<String, PersistenceError>;

    async fn fetch(
        &self,
        record_id: &str,
    ) -> Result<(ParsedEmail, PipelineResult), PersistenceError>;
}

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(db_path: &str) -> Result<Self, PersistenceError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cases (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                verdict TEXT NOT NULL,
                stage TEXT NOT NULL,
                created_at TEXT NOT NULL,
                email_json TEXT NOT NULL,
                result_json TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl EmailStorage for SqliteStorage {
    async fn persist(
        &self,
        email: &ParsedEmail,
        result: &PipelineResult,
    ) -> Result<String, PersistenceError> {
        let record_id = uuid::Uuid::new_v4().to_string();
        let email_json = serde_json::to_string(email)?;
        let result_json = serde_json::to_string(result)?;
        let created_at = chrono::Utc::now().to_rfc3339();

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let inserted = conn.execute(
            "INSERT INTO cases (id, message_id, verdict, stage, created_at, email_json, result_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record_id,
                email.message_id,
                result.final_verdict.as_str(),
                result.stage_reached.as_str(),
                created_at,
                email_json,
                result_json,
            ],
        );

        match inserted {
            Ok(_) => Ok(record_id),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(PersistenceError::Duplicate(email.message_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(
        &self,
        record_id: &str,
    ) -> Result<(ParsedEmail, PipelineResult), PersistenceError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row: Result<(String, String), rusqlite::Error> = conn.query_row(
            "SELECT email_json, result_json FROM cases WHERE id = ?1",
            params![record_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );

        match row {
            Ok((email_json, result_json)) => Ok((
                serde_json::from_str(&email_json)?,
                serde_json::from_str(&result_json)?,
            )),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(PersistenceError::NotFound(record_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and the CLI test-email flow.
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, (ParsedEmail, PipelineResult)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmailStorage for MemoryStorage {
    async fn persist(
        &self,
        email: &ParsedEmail,
        result: &PipelineResult,
    ) -> Result<String, PersistenceError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records
            .values()
            .any(|(stored, _)| stored.message_id == email.message_id)
        {
            return Err(PersistenceError::Duplicate(email.message_id.clone()));
        }
        let record_id = uuid::Uuid::new_v4().to_string();
        records.insert(record_id.clone(), (email.clone(), result.clone()));
        Ok(record_id)
    }

    async fn fetch(
        &self,
        record_id: &str,
    ) -> Result<(ParsedEmail, PipelineResult), PersistenceError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(record_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(record_id.to_string()))
    }
}
