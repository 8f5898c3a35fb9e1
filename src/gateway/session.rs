//! 会话管理
//!
//! 一个会话对应一条已认证的连接。会话拥有自己发起的 request_id（及其任务与取消令牌）；
//! 拆除会话时取消并等待这些任务，在限定时间内结束不了的直接 abort，最后删除账本中的会话池。
//! 拆除是幂等的：先在锁内摘除会话，之后的并发调用都看不到它。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::DispatchError;
use crate::core::inflight::RequestId;
use crate::core::ledger::Ledger;

/// 会话 ID
pub type SessionId = String;

/// 握手凭证校验
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> bool;
}

/// 静态令牌表（auth.tokens）
pub struct StaticTokenAuthenticator {
    tokens: HashSet<String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().filter(|t| !t.is_empty()).collect(),
        }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

struct RequestHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// 单个会话
pub struct Session {
    pub id: SessionId,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: Instant,
    requests: HashMap<RequestId, RequestHandle>,
    /// 会话级取消令牌；请求令牌都是它的子令牌
    cancel_token: CancellationToken,
}

impl Session {
    fn new(id: SessionId, parent: &CancellationToken) -> Self {
        Self {
            id,
            authenticated: true,
            created_at: Utc::now(),
            last_activity_at: Instant::now(),
            requests: HashMap::new(),
            cancel_token: parent.child_token(),
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.requests.len()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity_at.elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            authenticated: self.authenticated,
            created_at: self.created_at,
            idle_ms: self.idle_for().as_millis() as u64,
            inflight_count: self.inflight_count(),
        }
    }
}

/// 会话快照
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub inflight_count: usize,
}

/// 会话管理器
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Session>>,
    ledger: Arc<Ledger>,
    authenticator: Arc<dyn Authenticator>,
    root: CancellationToken,
    teardown_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        ledger: Arc<Ledger>,
        authenticator: Arc<dyn Authenticator>,
        root: CancellationToken,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ledger,
            authenticator,
            root,
            teardown_timeout,
        }
    }

    /// 握手：令牌缺失或无效时不创建任何状态
    pub async fn handshake(
        &self,
        token: Option<&str>,
        claimed_session_id: Option<&str>,
    ) -> Result<SessionId, DispatchError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DispatchError::Authentication("missing token".to_string()))?;
        if !self.authenticator.authenticate(token) {
            tracing::warn!(claimed = ?claimed_session_id, "Handshake rejected: invalid token");
            return Err(DispatchError::Authentication("invalid token".to_string()));
        }

        let mut sessions = self.sessions.write().await;
        let id = match claimed_session_id.filter(|s| !s.is_empty()) {
            Some(claimed) if sessions.contains_key(claimed) => {
                return Err(DispatchError::Protocol(format!(
                    "session id '{}' is already in use",
                    claimed
                )));
            }
            Some(claimed) => claimed.to_string(),
            None => format!("session_{}", uuid::Uuid::new_v4()),
        };

        self.ledger.register_session(&id);
        sessions.insert(id.clone(), Session::new(id.clone(), &self.root));
        tracing::info!(session_id = %id, "Session established");
        Ok(id)
    }

    /// 登记请求；返回该请求的取消令牌
    pub async fn reserve_request(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<CancellationToken, DispatchError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or(DispatchError::Cancelled)?;
        if session.requests.contains_key(request_id) {
            return Err(DispatchError::DuplicateRequest(request_id.to_string()));
        }
        let cancel = session.cancel_token.child_token();
        session.requests.insert(
            request_id.to_string(),
            RequestHandle {
                cancel: cancel.clone(),
                task: None,
            },
        );
        session.last_activity_at = Instant::now();
        Ok(cancel)
    }

    /// 关联请求任务；请求已结束时直接丢弃句柄
    pub async fn attach_task(&self, session_id: &str, request_id: &str, task: JoinHandle<()>) {
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions
            .get_mut(session_id)
            .and_then(|s| s.requests.get_mut(request_id))
        {
            handle.task = Some(task);
        }
    }

    pub async fn complete_request(&self, session_id: &str, request_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.last_activity_at = Instant::now();
                session.requests.remove(request_id).is_some()
            }
            None => false,
        }
    }

    /// 取消会话自己的某个请求（由请求任务负责发出终止事件）
    pub async fn cancel_request(&self, session_id: &str, request_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        match sessions
            .get(session_id)
            .and_then(|s| s.requests.get(request_id))
        {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_activity_at = Instant::now();
        }
    }

    pub async fn is_live(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(session_id).map(Session::info)
    }

    pub async fn idle_for(&self, session_id: &str) -> Option<Duration> {
        self.sessions.read().await.get(session_id).map(Session::idle_for)
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn inflight_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, Session::inflight_count)
    }

    /// 拆除会话（幂等）；返回本次调用是否真正执行了拆除
    pub async fn teardown(&self, session_id: &str) -> bool {
        let Some(mut session) = self.sessions.write().await.remove(session_id) else {
            return false;
        };
        session.cancel_token.cancel();

        let deadline = Instant::now() + self.teardown_timeout;
        let mut aborted = 0usize;
        for (request_id, handle) in session.requests.drain() {
            let Some(mut task) = handle.task else {
                continue;
            };
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!(
                    session_id = %session_id,
                    request_id = %request_id,
                    "Request task did not finish within teardown timeout; aborting"
                );
                task.abort();
                aborted += 1;
            }
        }

        self.ledger.remove_session(session_id);
        tracing::info!(session_id = %session_id, aborted, "Session torn down");
        true
    }

    /// 拆除空闲超时的会话
    pub async fn teardown_idle(&self, idle_timeout: Duration) -> usize {
        let idle: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.requests.is_empty() && s.idle_for() >= idle_timeout)
            .map(|s| s.id.clone())
            .collect();
        let mut removed = 0;
        for id in idle {
            if self.teardown(&id).await {
                tracing::info!(session_id = %id, "Idle session expired");
                removed += 1;
            }
        }
        removed
    }

    pub async fn teardown_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if self.teardown(&id).await {
                removed += 1;
            }
        }
        removed
    }
}
