//! 续接线程存储
//!
//! 线程在创建时绑定 Provider；之后的每一步必须指向同一个 Provider，否则返回 ScopeViolation，
//! 绝不静默改绑。线程在空闲 TTL 后过期，过期记录保留一段墓碑期，
//! 期间引用返回 ExpiredThread（而不是 UnknownContinuation）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::backend::{ContinuationBackend, ContinuationStep, ContinuationThread, MemoryBackend};
use crate::core::error::DispatchError;

#[derive(Debug, Clone)]
pub struct ContinuationConfig {
    pub idle_ttl: Duration,
    pub tombstone: Duration,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(3 * 3600),
            tombstone: Duration::from_secs(3600),
        }
    }
}

/// 共享后端上并发追加冲突时的重读次数
const APPEND_RETRIES: usize = 8;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct ContinuationStore {
    backend: Arc<dyn ContinuationBackend>,
    config: ContinuationConfig,
    /// 本进程内串行化 append_step；跨进程由后端的条件写入兜住
    write_lock: Mutex<()>,
}

impl ContinuationStore {
    pub fn new(backend: Arc<dyn ContinuationBackend>, config: ContinuationConfig) -> Self {
        tracing::debug!(backend = backend.name(), "Continuation store initialized");
        Self {
            backend,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory(config: ContinuationConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    pub fn config(&self) -> &ContinuationConfig {
        &self.config
    }

    fn ttl_ms(&self) -> i64 {
        self.config.idle_ttl.as_millis() as i64
    }

    /// 新建线程并绑定 Provider
    pub async fn create(&self, provider_id: &str) -> Result<String, DispatchError> {
        let now = now_ms();
        let thread = ContinuationThread {
            continuation_id: uuid::Uuid::new_v4().to_string(),
            bound_provider_id: provider_id.to_string(),
            step_history: Vec::new(),
            created_at_ms: now,
            expires_at_ms: now + self.ttl_ms(),
        };
        self.backend.put(&thread).await?;
        tracing::debug!(
            continuation_id = %thread.continuation_id,
            provider = %provider_id,
            "Continuation thread created"
        );
        Ok(thread.continuation_id)
    }

    async fn load_active(&self, continuation_id: &str) -> Result<ContinuationThread, DispatchError> {
        let thread = self
            .backend
            .get(continuation_id)
            .await?
            .ok_or_else(|| DispatchError::UnknownContinuation(continuation_id.to_string()))?;
        if thread.is_expired(now_ms()) {
            return Err(DispatchError::ExpiredThread(continuation_id.to_string()));
        }
        Ok(thread)
    }

    /// 检查线程可用，且（给定时）目标 Provider 与绑定一致
    pub async fn validate(
        &self,
        continuation_id: &str,
        provider_id: Option<&str>,
    ) -> Result<ContinuationThread, DispatchError> {
        let thread = self.load_active(continuation_id).await?;
        if let Some(provider_id) = provider_id {
            check_scope(&thread, provider_id)?;
        }
        Ok(thread)
    }

    /// 追加一步并刷新 TTL，返回当前步数
    pub async fn append_step(
        &self,
        continuation_id: &str,
        step: ContinuationStep,
        provider_id: &str,
    ) -> Result<usize, DispatchError> {
        let _guard = self.write_lock.lock().await;
        for attempt in 1..=APPEND_RETRIES {
            let mut thread = self.load_active(continuation_id).await?;
            check_scope(&thread, provider_id)?;

            let expected = thread.step_history.len();
            thread.step_history.push(step.clone());
            thread.expires_at_ms = now_ms() + self.ttl_ms();
            if self.backend.put_if_steps(&thread, expected).await? {
                return Ok(thread.step_history.len());
            }
            tracing::debug!(
                continuation_id = %continuation_id,
                attempt,
                "Concurrent append on shared backend; re-reading thread"
            );
        }
        tracing::warn!(continuation_id = %continuation_id, "Continuation append kept conflicting; step dropped");
        Err(DispatchError::Execution(format!(
            "continuation {} is under contention; step not recorded",
            continuation_id
        )))
    }

    /// 删除墓碑期也已结束的线程
    pub async fn sweep(&self) -> Result<usize, DispatchError> {
        let cutoff = now_ms() - self.config.tombstone.as_millis() as i64;
        let removed = self.backend.expire(cutoff).await?;
        if removed > 0 {
            tracing::debug!(removed, "Swept expired continuation threads");
        }
        Ok(removed)
    }
}

fn check_scope(thread: &ContinuationThread, provider_id: &str) -> Result<(), DispatchError> {
    if thread.bound_provider_id != provider_id {
        tracing::warn!(
            continuation_id = %thread.continuation_id,
            bound = %thread.bound_provider_id,
            requested = %provider_id,
            "Continuation scope violation"
        );
        return Err(DispatchError::ScopeViolation {
            continuation_id: thread.continuation_id.clone(),
            bound: thread.bound_provider_id.clone(),
            requested: provider_id.to_string(),
        });
    }
    Ok(())
}
