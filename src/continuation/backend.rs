//! 续接线程的存储后端（get / put / expire）

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::error::DispatchError;

/// 续接线程中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationStep {
    pub tool_name: String,
    pub request_id: String,
    pub provider_id: String,
    pub model: String,
    pub arguments: serde_json::Value,
    pub recorded_at_ms: i64,
}

impl ContinuationStep {
    pub fn new(
        tool_name: impl Into<String>,
        request_id: impl Into<String>,
        provider_id: impl Into<String>,
        model: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            request_id: request_id.into(),
            provider_id: provider_id.into(),
            model: model.into(),
            arguments,
            recorded_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 多步工作流线程：首步时绑定 Provider，之后不可改绑
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationThread {
    pub continuation_id: String,
    pub bound_provider_id: String,
    pub step_history: Vec<ContinuationStep>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl ContinuationThread {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<BackendError> for DispatchError {
    fn from(e: BackendError) -> Self {
        DispatchError::Execution(format!("continuation backend: {}", e))
    }
}

/// 存储后端接口；多进程部署时可换成共享存储
#[async_trait]
pub trait ContinuationBackend: Send + Sync {
    async fn get(&self, continuation_id: &str) -> Result<Option<ContinuationThread>, BackendError>;

    async fn put(&self, thread: &ContinuationThread) -> Result<(), BackendError>;

    /// 仅当已存线程的步数仍为 `expected_steps` 时写入，返回是否写入
    ///
    /// 共享后端上多个守护进程并发追加时，靠它发现冲突而不是互相覆盖。
    async fn put_if_steps(
        &self,
        thread: &ContinuationThread,
        expected_steps: usize,
    ) -> Result<bool, BackendError>;

    /// 删除 expires_at 早于 `before_ms` 的线程，返回删除数
    async fn expire(&self, before_ms: i64) -> Result<usize, BackendError>;

    fn name(&self) -> &'static str;
}

/// 进程内后端（默认）
#[derive(Default)]
pub struct MemoryBackend {
    threads: RwLock<HashMap<String, ContinuationThread>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContinuationBackend for MemoryBackend {
    async fn get(&self, continuation_id: &str) -> Result<Option<ContinuationThread>, BackendError> {
        Ok(self.threads.read().get(continuation_id).cloned())
    }

    async fn put(&self, thread: &ContinuationThread) -> Result<(), BackendError> {
        self.threads
            .write()
            .insert(thread.continuation_id.clone(), thread.clone());
        Ok(())
    }

    async fn put_if_steps(
        &self,
        thread: &ContinuationThread,
        expected_steps: usize,
    ) -> Result<bool, BackendError> {
        let mut threads = self.threads.write();
        let current = threads
            .get(&thread.continuation_id)
            .map(|t| t.step_history.len());
        if current != Some(expected_steps) {
            return Ok(false);
        }
        threads.insert(thread.continuation_id.clone(), thread.clone());
        Ok(true)
    }

    async fn expire(&self, before_ms: i64) -> Result<usize, BackendError> {
        let mut threads = self.threads.write();
        let before = threads.len();
        threads.retain(|_, t| t.expires_at_ms >= before_ms);
        Ok(before - threads.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: &str, expires_at_ms: i64) -> ContinuationThread {
        ContinuationThread {
            continuation_id: id.to_string(),
            bound_provider_id: "alpha".to_string(),
            step_history: vec![],
            created_at_ms: 0,
            expires_at_ms,
        }
    }

    #[tokio::test]
    async fn test_memory_backend_get_put_expire() {
        let backend = MemoryBackend::new();
        backend.put(&thread("a", 100)).await.unwrap();
        backend.put(&thread("b", 300)).await.unwrap();

        assert_eq!(backend.get("a").await.unwrap().unwrap().expires_at_ms, 100);
        assert!(backend.get("zzz").await.unwrap().is_none());

        assert_eq!(backend.expire(200).await.unwrap(), 1);
        assert!(backend.get("a").await.unwrap().is_none());
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_put_if_steps_rejects_stale_writer() {
        let backend = MemoryBackend::new();
        backend.put(&thread("a", 100)).await.unwrap();

        let mut stale = thread("a", 200);
        stale.step_history.push(ContinuationStep::new("plan", "r1", "alpha", "m", serde_json::json!({})));
        assert!(backend.put_if_steps(&stale, 0).await.unwrap());
        assert!(!backend.put_if_steps(&stale, 0).await.unwrap());
        assert!(!backend.put_if_steps(&thread("missing", 100), 0).await.unwrap());
        assert_eq!(backend.get("a").await.unwrap().unwrap().step_history.len(), 1);
    }

    #[test]
    fn test_backend_error_maps_to_execution_error() {
        let err: DispatchError = BackendError::Storage("disk full".into()).into();
        assert_eq!(err.kind(), "execution_error");
    }
}
