// src/state_manager.rs

use crate::models::{DownloadId, DownloadModel};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persists one resume checkpoint per download id in SQLite.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Connects to the database file, creating it and the table if needed.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(db_path).await?;
        Self::with_connection(conn).await
    }

    /// A store that lives only as long as the process.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self, StateError> {
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS downloads (
                        id              INTEGER PRIMARY KEY,
                        job_data        TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the checkpoint for `model.id`.
    pub async fn save_model(&self, model: &DownloadModel) -> Result<(), StateError> {
        let job_data = serde_json::to_string(model)?;
        let id = model.id.get();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO downloads (id, job_data) VALUES (?1, ?2)",
                    params![id, job_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_model(&self, id: DownloadId) -> Result<Option<DownloadModel>, StateError> {
        let raw = id.get();
        let job_data: Option<String> = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT job_data FROM downloads WHERE id = ?1",
                        params![raw],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        match job_data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Loads every checkpoint. Rows that no longer decode are skipped.
    pub async fn load_all_models(&self) -> Result<Vec<DownloadModel>, StateError> {
        let rows: Vec<(u32, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, job_data FROM downloads")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        let mut models = Vec::with_capacity(rows.len());
        for (id, json) in rows {
            match serde_json::from_str::<DownloadModel>(&json) {
                Ok(model) => models.push(model),
                Err(err) => warn!(id, error = %err, "skipping undecodable checkpoint"),
            }
        }
        Ok(models)
    }

    pub async fn delete_model(&self, id: DownloadId) -> Result<(), StateError> {
        let raw = id.get();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM downloads WHERE id = ?1", params![raw])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn model(id: u32, downloaded: u64) -> DownloadModel {
        DownloadModel {
            version: crate::models::MODEL_VERSION,
            id: DownloadId::from_raw(id),
            url: format!("http://host/{id}"),
            dir_path: PathBuf::from("/data"),
            file_name: format!("{id}.bin"),
            etag: Some("\"abc\"".to_string()),
            total_bytes: Some(1_000),
            downloaded_bytes: downloaded,
            last_modified_at: 1,
        }
    }

    #[tokio::test]
    async fn test_save_load_replace_delete() {
        let state = StateManager::in_memory().await.unwrap();
        let id = DownloadId::from_raw(7);
        assert_eq!(state.load_model(id).await.unwrap(), None);

        state.save_model(&model(7, 100)).await.unwrap();
        state.save_model(&model(7, 400)).await.unwrap();
        let loaded = state.load_model(id).await.unwrap().unwrap();
        assert_eq!(loaded.downloaded_bytes, 400);
        assert_eq!(state.load_all_models().await.unwrap().len(), 1);

        state.delete_model(id).await.unwrap();
        assert_eq!(state.load_model(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested/state.db");
        {
            let state = StateManager::new(&db_path).await.unwrap();
            state.save_model(&model(1, 10)).await.unwrap();
            state.save_model(&model(2, 20)).await.unwrap();
        }
        let state = StateManager::new(&db_path).await.unwrap();
        let mut models = state.load_all_models().await.unwrap();
        models.sort_by_key(|m| m.id);
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].downloaded_bytes, 20);
    }
}
