//! SQLite 续接后端
//!
//! 线程元数据一行一条，步骤历史以 JSON 存储；多个守护进程可共享同一个库文件。
//! 追加步骤用单条条件 UPDATE（按 JSON 数组长度比对），并发写入者之一会落空并重读。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use sqlx::Row;

use super::backend::{BackendError, ContinuationBackend, ContinuationStep, ContinuationThread};

impl From<sqlx::Error> for BackendError {
    fn from(e: sqlx::Error) -> Self {
        BackendError::Storage(e.to_string())
    }
}

pub struct SqliteBackend {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteBackend {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let backend = Self { pool };
        backend.init_tables().await?;
        tracing::info!(path = %db_path.as_ref().display(), "SQLite continuation backend ready");
        Ok(backend)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS continuation_threads (
                id TEXT PRIMARY KEY,
                bound_provider_id TEXT NOT NULL,
                steps TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_continuation_expires ON continuation_threads(expires_at_ms)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ContinuationBackend for SqliteBackend {
    async fn get(&self, continuation_id: &str) -> Result<Option<ContinuationThread>, BackendError> {
        let row = sqlx::query(
            "SELECT id, bound_provider_id, steps, created_at_ms, expires_at_ms
             FROM continuation_threads WHERE id = ?",
        )
        .bind(continuation_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let steps: String = row.get("steps");
        let step_history: Vec<ContinuationStep> = serde_json::from_str(&steps)?;
        Ok(Some(ContinuationThread {
            continuation_id: row.get("id"),
            bound_provider_id: row.get("bound_provider_id"),
            step_history,
            created_at_ms: row.get("created_at_ms"),
            expires_at_ms: row.get("expires_at_ms"),
        }))
    }

    async fn put(&self, thread: &ContinuationThread) -> Result<(), BackendError> {
        let steps = serde_json::to_string(&thread.step_history)?;
        sqlx::query(
            "INSERT OR REPLACE INTO continuation_threads
             (id, bound_provider_id, steps, created_at_ms, expires_at_ms)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&thread.continuation_id)
        .bind(&thread.bound_provider_id)
        .bind(&steps)
        .bind(thread.created_at_ms)
        .bind(thread.expires_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_if_steps(
        &self,
        thread: &ContinuationThread,
        expected_steps: usize,
    ) -> Result<bool, BackendError> {
        let steps = serde_json::to_string(&thread.step_history)?;
        let result = sqlx::query(
            "UPDATE continuation_threads SET steps = ?, expires_at_ms = ?
             WHERE id = ? AND bound_provider_id = ? AND json_array_length(steps) = ?",
        )
        .bind(&steps)
        .bind(thread.expires_at_ms)
        .bind(&thread.continuation_id)
        .bind(&thread.bound_provider_id)
        .bind(expected_steps as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire(&self, before_ms: i64) -> Result<usize, BackendError> {
        let result = sqlx::query("DELETE FROM continuation_threads WHERE expires_at_ms < ?")
            .bind(before_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_expire() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("threads.db")).await.unwrap();

        let thread = ContinuationThread {
            continuation_id: "c1".into(),
            bound_provider_id: "alpha".into(),
            step_history: vec![ContinuationStep::new("plan", "r1", "alpha", "alpha-pro", json!({"n": 1}))],
            created_at_ms: 10,
            expires_at_ms: 1_000,
        };
        backend.put(&thread).await.unwrap();
        assert_eq!(backend.get("c1").await.unwrap(), Some(thread));

        assert_eq!(backend.expire(500).await.unwrap(), 0);
        assert_eq!(backend.expire(2_000).await.unwrap(), 1);
        assert!(backend.get("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_update_detects_concurrent_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threads.db");
        let first = SqliteBackend::new(&path).await.unwrap();
        let second = SqliteBackend::new(&path).await.unwrap();

        let thread = ContinuationThread {
            continuation_id: "c1".into(),
            bound_provider_id: "alpha".into(),
            step_history: vec![],
            created_at_ms: 10,
            expires_at_ms: 1_000,
        };
        first.put(&thread).await.unwrap();

        let mut from_first = thread.clone();
        from_first
            .step_history
            .push(ContinuationStep::new("plan", "r1", "alpha", "alpha-pro", json!({})));
        let mut from_second = thread.clone();
        from_second
            .step_history
            .push(ContinuationStep::new("plan", "r2", "alpha", "alpha-pro", json!({})));

        assert!(first.put_if_steps(&from_first, 0).await.unwrap());
        assert!(!second.put_if_steps(&from_second, 0).await.unwrap());

        let stored = second.get("c1").await.unwrap().unwrap();
        assert_eq!(stored.step_history.len(), 1);
        assert_eq!(stored.step_history[0].request_id, "r1");
    }
}
