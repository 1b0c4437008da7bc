// src/session_store.rs

use crate::models::{SessionRecord, SessionStatus};
use log::{info, warn};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const LAST_SESSION_KEY: &str = "last_session_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable registry of download sessions keyed by session id.
///
/// Cloning is cheap; every clone talks to the same background connection,
/// which serializes access so readers never observe a half-written record.
#[derive(Clone)]
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Opens (creating if needed) the session database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    /// A store that lives only as long as the process. Used by tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS sessions (
                        id              INTEGER PRIMARY KEY,
                        record          TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS session_counter (
                        key             TEXT PRIMARY KEY,
                        value           INTEGER NOT NULL
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Hands out the next session id and persists it before returning, so a
    /// restart can never reissue it.
    pub async fn allocate_session_id(&self) -> Result<u64, StoreError> {
        let id = self
            .conn
            .call(|conn| {
                let tx = conn.transaction()?;
                let last: Option<i64> = tx
                    .query_row(
                        "SELECT value FROM session_counter WHERE key = ?1",
                        params![LAST_SESSION_KEY],
                        |row| row.get(0),
                    )
                    .optional()?;
                let max_stored: Option<i64> =
                    tx.query_row("SELECT MAX(id) FROM sessions", [], |row| row.get(0))?;

                let next = match last.into_iter().chain(max_stored).max() {
                    Some(previous) => previous + 1,
                    None => 0,
                };
                tx.execute(
                    "INSERT OR REPLACE INTO session_counter (key, value) VALUES (?1, ?2)",
                    params![LAST_SESSION_KEY, next],
                )?;
                tx.commit()?;
                Ok(next)
            })
            .await?;
        Ok(id as u64)
    }

    /// Inserts or replaces the record with the same session id.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let data = serde_json::to_string(record)?;
        let id = record.session_id as i64;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO sessions (id, record) VALUES (?1, ?2)",
                    params![id, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Deletes a record. Removing an unknown id is not an error.
    pub async fn remove(&self, session_id: u64) -> Result<(), StoreError> {
        let id = session_id as i64;
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get(&self, session_id: u64) -> Result<Option<SessionRecord>, StoreError> {
        let id = session_id as i64;
        let data: Option<String> = self
            .conn
            .call(move |conn| {
                let data = conn
                    .query_row(
                        "SELECT record FROM sessions WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(data)
            })
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Snapshot of every record. Order carries no meaning.
    pub async fn list_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record FROM sessions")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for data in rows {
            records.push(serde_json::from_str(&data)?);
        }
        Ok(records)
    }

    /// Partial update of the byte counter and status.
    ///
    /// Progress can race a removal, so an unknown id is logged and ignored.
    pub async fn update_progress(
        &self,
        session_id: u64,
        bytes_downloaded: u64,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let id = session_id as i64;
        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let data: Option<String> = tx
                    .query_row(
                        "SELECT record FROM sessions WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(data) = data else {
                    return Ok(false);
                };

                let mut record: SessionRecord =
                    serde_json::from_str(&data).map_err(conversion_failure)?;
                record.bytes_downloaded = bytes_downloaded;
                record.status = status;
                let data = serde_json::to_string(&record).map_err(conversion_failure)?;

                tx.execute(
                    "UPDATE sessions SET record = ?2 WHERE id = ?1",
                    params![id, data],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !updated {
            warn!("Store: progress update for unknown session {} ignored.", session_id);
        }
        Ok(())
    }

    /// Moves every record still claiming `downloading` to `pause`.
    ///
    /// Must run before any record is shown after a restart: nothing is
    /// transferring yet, so no record may report live progress.
    pub async fn reconcile_stale(&self) -> Result<Vec<u64>, StoreError> {
        let reconciled = self
            .conn
            .call(|conn| {
                let tx = conn.transaction()?;
                let rows = {
                    let mut stmt = tx.prepare("SELECT id, record FROM sessions")?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    rows
                };

                let mut reconciled = Vec::new();
                for (id, data) in rows {
                    let mut record: SessionRecord =
                        serde_json::from_str(&data).map_err(conversion_failure)?;
                    if record.status != SessionStatus::Downloading {
                        continue;
                    }
                    record.status = SessionStatus::Paused;
                    let data = serde_json::to_string(&record).map_err(conversion_failure)?;
                    tx.execute(
                        "UPDATE sessions SET record = ?2 WHERE id = ?1",
                        params![id, data],
                    )?;
                    reconciled.push(id as u64);
                }
                tx.commit()?;
                Ok(reconciled)
            })
            .await?;

        if !reconciled.is_empty() {
            info!("Store: reconciled {} stalled session(s) to paused.", reconciled.len());
        }
        Ok(reconciled)
    }
}

fn conversion_failure(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}
