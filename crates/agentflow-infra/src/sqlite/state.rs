//! SQLite session state backend.
//!
//! Values are stored as JSON text. `expires_at` is a Unix timestamp in
//! milliseconds; expired rows read as absent and are removed by
//! `purge_expired`.

use std::time::Duration;

use agentflow_core::storage::state_backend::StateBackend;
use agentflow_types::error::StoreError;
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `StateBackend`.
pub struct SqliteStateBackend {
    pool: DatabasePool,
}

impl SqliteStateBackend {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Delete every expired row. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM session_state WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn query_error(err: sqlx::Error) -> StoreError {
    StoreError::Query(err.to_string())
}

impl StateBackend for SqliteStateBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            "SELECT value FROM session_state WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let text: String = row.try_get("value").map_err(query_error)?;
                let value = serde_json::from_str(&text)
                    .map_err(|e| StoreError::Query(format!("invalid JSON value for '{key}': {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let text = serde_json::to_string(value)
            .map_err(|e| StoreError::Query(format!("failed to serialize value: {e}")))?;
        let expires_at = ttl.map(|ttl| {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            now_millis().saturating_add(millis)
        });

        sqlx::query(
            r#"INSERT INTO session_state (key, value, expires_at, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(&text)
        .bind(expires_at)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        tracing::debug!(key, "session state written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM session_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }
}
