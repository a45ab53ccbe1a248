//! Verdict/stage counters for processed email, flushed to SQLite by a
//! background task. Recording never blocks the pipeline; a full or closed
//! channel only costs a log line.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::evidence::{Stage, Verdict};

#[derive(Debug, Clone)]
pub enum StatEvent {
    Processed {
        verdict: Verdict,
        stage: Stage,
        elapsed_ms: u64,
    },
    LayerDegraded {
        layer: &'static str,
    },
    PersistFailed,
}

pub struct StatisticsCollector {
    sender: mpsc::UnboundedSender<StatEvent>,
    _handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    pub fn new(db_path: String, flush_interval_seconds: u64) -> Result<Self> {
        if let Some(parent) = Path::new(&db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create stats directory: {}", parent.display())
                })?;
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            if let Err(e) = Self::stats_worker(db_path, receiver, flush_interval_seconds).await {
                log::error!("statistics worker error: {e}");
            }
        });

        Ok(Self {
            sender,
            _handle: handle,
        })
    }

    pub fn record(&self, event: StatEvent) {
        if let Err(e) = self.sender.send(event) {
            log::warn!("failed to record statistics event: {e}");
        }
    }

    async fn stats_worker(
        db_path: String,
        mut receiver: mpsc::UnboundedReceiver<StatEvent>,
        flush_interval_seconds: u64,
    ) -> Result<()> {
        let conn = Self::init_database(&db_path)?;
        let mut buffer: HashMap<String, u64> = HashMap::new();
        let mut elapsed_total_ms: u64 = 0;

        let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds.max(1)));
        flush_timer.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => Self::process_event(event, &mut buffer, &mut elapsed_total_ms),
                        None => {
                            Self::flush(&conn, &mut buffer, &mut elapsed_total_ms)?;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if let Err(e) = Self::flush(&conn, &mut buffer, &mut elapsed_total_ms) {
                        log::error!("failed to flush statistics: {e}");
                    }
                }
            }
        }

        Ok(())
    }

    fn process_event(
        event: StatEvent,
        buffer: &mut HashMap<String, u64>,
        elapsed_total_ms: &mut u64,
    ) {
        match event {
            StatEvent::Processed {
                verdict,
                stage,
                elapsed_ms,
            } => {
                *buffer.entry("emails_processed".to_string()).or_default() += 1;
                *buffer
                    .entry(format!("verdict_{}", verdict.as_str()))
                    .or_default() += 1;
                *buffer
                    .entry(format!("stage_{}", stage.as_str()))
                    .or_default() += 1;
                *elapsed_total_ms += elapsed_ms;
            }
            StatEvent::LayerDegraded { layer } => {
                *buffer.entry(format!("degraded_{layer}")).or_default() += 1;
            }
            StatEvent::PersistFailed => {
                *buffer.entry("persist_failures".to_string()).or_default() += 1;
            }
        }
    }

    fn init_database(db_path: &str) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open statistics database: {db_path}"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT
            )",
            [],
        )?;
        Ok(conn)
    }

    fn flush(
        conn: &Connection,
        buffer: &mut HashMap<String, u64>,
        elapsed_total_ms: &mut u64,
    ) -> Result<()> {
        if *elapsed_total_ms > 0 {
            *buffer.entry("processing_time_ms".to_string()).or_default() += *elapsed_total_ms;
            *elapsed_total_ms = 0;
        }
        if buffer.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        for (name, value) in buffer.drain() {
            conn.execute(
                "INSERT INTO counters (name, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET value = value + ?2, updated_at = ?3",
                params![name, value as i64, now],
            )?;
        }
        Ok(())
    }
}

/// Read back the counter table for the `--stats` CLI flow.
pub fn load_counters(db_path: &str) -> Result<Vec<(String, u64)>> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open statistics database: {db_path}"))?;
    let mut stmt = conn.prepare("SELECT name, value FROM counters ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    let mut counters = Vec::new();
    for row in rows {
        counters.push(row?);
    }
    Ok(counters)
}
