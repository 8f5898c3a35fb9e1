//! 并发账本（准入控制）
//!
//! 三级信号量池：会话 / Provider / 全局。所有调用方都按 会话 → Provider → 全局 的固定顺序获取，
//! 任一级在准入期限内拿不到槽位即快速失败，并释放本次已拿到的槽位。
//! 槽位由 `PoolSlot` 持有，Drop 时归还，保证每次成功获取恰好对应一次释放。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::core::error::DispatchError;

/// 池类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Global,
    Session,
    Provider,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Global => write!(f, "global"),
            PoolKind::Session => write!(f, "session"),
            PoolKind::Provider => write!(f, "provider"),
        }
    }
}

/// 单个池的计数快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub kind: PoolKind,
    pub name: String,
    pub capacity: usize,
    pub held: usize,
    pub granted: u64,
    pub released: u64,
}

/// 并发池：capacity 固定，held = capacity - 可用许可
pub struct ConcurrencyPool {
    kind: PoolKind,
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    granted: AtomicU64,
    released: AtomicU64,
}

impl ConcurrencyPool {
    fn new(kind: PoolKind, name: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            granted: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn held(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            kind: self.kind,
            name: self.name.clone(),
            capacity: self.capacity,
            held: self.held(),
            granted: self.granted.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }

    /// deadline 为 None 时只做一次非阻塞尝试
    async fn acquire(self: &Arc<Self>, deadline: Option<Instant>) -> Option<PoolSlot> {
        let permit = match deadline {
            None => self.semaphore.clone().try_acquire_owned().ok()?,
            Some(deadline) => {
                tokio::time::timeout_at(deadline, self.semaphore.clone().acquire_owned())
                    .await
                    .ok()?
                    .ok()?
            }
        };
        self.granted.fetch_add(1, Ordering::SeqCst);
        Some(PoolSlot {
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }
}

/// 单个池中的一个槽位；Drop 即归还
struct PoolSlot {
    pool: Arc<ConcurrencyPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.pool.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct LeaseSlots {
    // 字段顺序即 Drop 顺序：与获取顺序相反
    global: PoolSlot,
    provider: PoolSlot,
    session: PoolSlot,
}

/// 一次准入成功得到的租约（三个池各一个槽位）
///
/// `release()` 至多生效一次，重复调用只记日志；未显式释放时 Drop 兜底释放。
pub struct Lease {
    session_id: String,
    provider_id: String,
    slots: Option<LeaseSlots>,
}

impl Lease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn is_released(&self) -> bool {
        self.slots.is_none()
    }

    pub fn release(&mut self) {
        match self.slots.take() {
            Some(slots) => {
                drop(slots);
                tracing::trace!(
                    session_id = %self.session_id,
                    provider = %self.provider_id,
                    "lease released"
                );
            }
            None => {
                tracing::warn!(
                    session_id = %self.session_id,
                    provider = %self.provider_id,
                    "Lease released twice; ignoring second release"
                );
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.slots.take();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("session_id", &self.session_id)
            .field("provider_id", &self.provider_id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// 账本配置
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub global_capacity: usize,
    pub session_capacity: usize,
    pub provider_capacity: usize,
    /// 按 Provider 覆盖容量
    pub provider_overrides: HashMap<String, usize>,
    /// 准入期限；为 0 表示不排队，拿不到立即拒绝
    pub admission_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            global_capacity: 32,
            session_capacity: 8,
            provider_capacity: 16,
            provider_overrides: HashMap::new(),
            admission_timeout: Duration::ZERO,
        }
    }
}

/// 全部池的快照
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub global: PoolStats,
    pub sessions: Vec<PoolStats>,
    pub providers: Vec<PoolStats>,
}

/// 并发账本
pub struct Ledger {
    config: LedgerConfig,
    global: Arc<ConcurrencyPool>,
    sessions: Mutex<HashMap<String, Arc<ConcurrencyPool>>>,
    providers: Mutex<HashMap<String, Arc<ConcurrencyPool>>>,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Self {
        let global = ConcurrencyPool::new(PoolKind::Global, "global", config.global_capacity);
        Self {
            config,
            global,
            sessions: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn admission_timeout(&self) -> Duration {
        self.config.admission_timeout
    }

    /// 握手成功后为会话建池
    pub fn register_session(&self, session_id: &str) {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| {
                ConcurrencyPool::new(PoolKind::Session, session_id, self.config.session_capacity)
            });
    }

    /// 会话拆除时丢弃其池；仍在执行的租约持有 Arc，结束时照常归还
    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    /// 会话池句柄；执行持有它，发起会话被拆除后后续尝试仍按同一个池准入
    pub fn session_pool(&self, session_id: &str) -> Option<Arc<ConcurrencyPool>> {
        self.sessions.lock().get(session_id).cloned()
    }

    fn provider_pool(&self, provider_id: &str) -> Arc<ConcurrencyPool> {
        let mut providers = self.providers.lock();
        let capacity = self
            .config
            .provider_overrides
            .get(provider_id)
            .copied()
            .unwrap_or(self.config.provider_capacity);
        Arc::clone(
            providers
                .entry(provider_id.to_string())
                .or_insert_with(|| ConcurrencyPool::new(PoolKind::Provider, provider_id, capacity)),
        )
    }

    /// 按配置的准入期限获取租约
    pub async fn try_acquire(
        &self,
        session_id: &str,
        provider_id: &str,
    ) -> Result<Lease, DispatchError> {
        self.try_acquire_within(session_id, provider_id, self.config.admission_timeout)
            .await
    }

    /// 按 会话 → Provider → 全局 顺序获取；三级共享同一个准入期限
    pub async fn try_acquire_within(
        &self,
        session_id: &str,
        provider_id: &str,
        admission_timeout: Duration,
    ) -> Result<Lease, DispatchError> {
        let session_pool = self.session_pool(session_id).ok_or(DispatchError::Cancelled)?;
        self.acquire_in(&session_pool, provider_id, admission_timeout)
            .await
    }

    /// 用已持有的会话池句柄准入，不再按 id 查表
    pub async fn try_acquire_in(
        &self,
        session_pool: &Arc<ConcurrencyPool>,
        provider_id: &str,
    ) -> Result<Lease, DispatchError> {
        self.acquire_in(session_pool, provider_id, self.config.admission_timeout)
            .await
    }

    async fn acquire_in(
        &self,
        session_pool: &Arc<ConcurrencyPool>,
        provider_id: &str,
        admission_timeout: Duration,
    ) -> Result<Lease, DispatchError> {
        let provider_pool = self.provider_pool(provider_id);
        let deadline = (!admission_timeout.is_zero()).then(|| Instant::now() + admission_timeout);

        // 提前返回时已获取的槽位随局部变量 Drop 归还
        let session = session_pool
            .acquire(deadline)
            .await
            .ok_or(DispatchError::CapacityExceeded { pool: PoolKind::Session })?;
        let provider = provider_pool
            .acquire(deadline)
            .await
            .ok_or(DispatchError::CapacityExceeded { pool: PoolKind::Provider })?;
        let global = self
            .global
            .acquire(deadline)
            .await
            .ok_or(DispatchError::CapacityExceeded { pool: PoolKind::Global })?;

        Ok(Lease {
            session_id: session_pool.name.clone(),
            provider_id: provider_id.to_string(),
            slots: Some(LeaseSlots {
                global,
                provider,
                session,
            }),
        })
    }

    pub fn global_stats(&self) -> PoolStats {
        self.global.stats()
    }

    pub fn session_stats(&self, session_id: &str) -> Option<PoolStats> {
        self.session_pool(session_id).map(|p| p.stats())
    }

    pub fn provider_stats(&self, provider_id: &str) -> Option<PoolStats> {
        self.providers.lock().get(provider_id).map(|p| p.stats())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            global: self.global.stats(),
            sessions: self.sessions.lock().values().map(|p| p.stats()).collect(),
            providers: self.providers.lock().values().map(|p| p.stats()).collect(),
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}
