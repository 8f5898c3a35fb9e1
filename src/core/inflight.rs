//! 在途调用表（去重 / 合并）
//!
//! `begin_or_attach` 在同一个临界区内完成「查找 + 插入或挂靠」：同一 call_key 任意时刻至多一次执行，
//! 重复请求作为等待者挂靠并拿到完全相同的结果。执行完成后成功结果降级为带 TTL 的缓存记录；
//! 缓存是否过期在同一临界区内按时间判断，不依赖后台清理的时机。
//!
//! 所有挂靠者（含发起者自己的请求）都放弃关注时，执行被协作式取消。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::{CapabilityNotice, DispatchError};

pub type CallKey = String;
pub type RequestId = String;

const PROGRESS_CAPACITY: usize = 64;

/// 一次执行的成功结果（广播给所有等待者）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallResult {
    pub value: serde_json::Value,
    pub provider: String,
    pub model: String,
    pub continuation_id: Option<String>,
    pub notices: Vec<CapabilityNotice>,
}

pub type CallOutcome = Result<CallResult, DispatchError>;

/// 进度消息发送端（交给工具处理器）
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: broadcast::Sender<String>,
}

impl ProgressSink {
    pub fn emit(&self, message: impl Into<String>) {
        // 没有订阅者时丢弃即可
        let _ = self.tx.send(message.into());
    }

    /// 不连接任何订阅者（测试或独立调用）
    pub fn detached() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }
}

struct RunningCall {
    execution_id: u64,
    waiters: Vec<RequestId>,
    outcome_rx: watch::Receiver<Option<CallOutcome>>,
    progress_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
}

enum Entry {
    Running(RunningCall),
    Cached {
        result: CallResult,
        completed_at: Instant,
    },
}

/// begin_or_attach 的结果
pub enum Role {
    /// 负责执行；必须通过 ticket 发布结果（Drop 兜底为 Cancelled）
    Originator(CallTicket, Subscription),
    /// 挂靠到已有执行或命中缓存
    Waiter(Subscription),
}

impl Role {
    pub fn is_originator(&self) -> bool {
        matches!(self, Role::Originator(..))
    }
}

/// 在途调用表
pub struct InFlightTable {
    entries: Mutex<HashMap<CallKey, Entry>>,
    ttl: Duration,
    cancel_root: CancellationToken,
    next_execution: AtomicU64,
}

impl InFlightTable {
    pub fn new(ttl: Duration, cancel_root: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            cancel_root,
            next_execution: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 原子地「开始执行或挂靠」；`coalesce = false` 的工具永远是发起者且不进表
    pub fn begin_or_attach(
        self: &Arc<Self>,
        call_key: &str,
        request_id: &str,
        coalesce: bool,
    ) -> Role {
        let execution_id = self.next_execution.fetch_add(1, Ordering::Relaxed);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (progress_tx, progress_rx) = broadcast::channel(PROGRESS_CAPACITY);
        let cancel = self.cancel_root.child_token();

        if !coalesce {
            let ticket = CallTicket {
                table: Arc::clone(self),
                call_key: call_key.to_string(),
                execution_id,
                coalesced: false,
                outcome_tx,
                progress_tx,
                cancel: cancel.clone(),
                finished: false,
            };
            let sub = Subscription::live(
                request_id,
                outcome_rx,
                progress_rx,
                Interest::Exclusive(cancel),
                false,
            );
            return Role::Originator(ticket, sub);
        }

        let mut entries = self.entries.lock();
        match entries.get_mut(call_key) {
            // 已被取消的执行只等退出，不再接收挂靠
            Some(Entry::Running(running)) if !running.cancel.is_cancelled() => {
                running.waiters.push(request_id.to_string());
                tracing::debug!(
                    call_key = %call_key,
                    request_id = %request_id,
                    waiters = running.waiters.len(),
                    "attached to in-flight call"
                );
                return Role::Waiter(Subscription::live(
                    request_id,
                    running.outcome_rx.clone(),
                    running.progress_tx.subscribe(),
                    Interest::Shared {
                        table: Arc::clone(self),
                        call_key: call_key.to_string(),
                        execution_id: running.execution_id,
                    },
                    true,
                ));
            }
            Some(Entry::Cached {
                result,
                completed_at,
            }) if completed_at.elapsed() < self.ttl => {
                tracing::debug!(call_key = %call_key, request_id = %request_id, "served from result cache");
                return Role::Waiter(Subscription::ready(request_id, Ok(result.clone())));
            }
            // 缓存已过期、执行已取消或不存在：由本请求重新执行
            _ => {}
        }

        entries.insert(
            call_key.to_string(),
            Entry::Running(RunningCall {
                execution_id,
                waiters: vec![request_id.to_string()],
                outcome_rx: outcome_rx.clone(),
                progress_tx: progress_tx.clone(),
                cancel: cancel.clone(),
            }),
        );
        drop(entries);

        let ticket = CallTicket {
            table: Arc::clone(self),
            call_key: call_key.to_string(),
            execution_id,
            coalesced: true,
            outcome_tx,
            progress_tx,
            cancel,
            finished: false,
        };
        let sub = Subscription::live(
            request_id,
            outcome_rx,
            progress_rx,
            Interest::Shared {
                table: Arc::clone(self),
                call_key: call_key.to_string(),
                execution_id,
            },
            false,
        );
        Role::Originator(ticket, sub)
    }

    /// 发布结果并降级为缓存记录（与广播处于同一临界区）
    fn publish(&self, call_key: &str, execution_id: u64, outcome: &CallOutcome) -> usize {
        let mut entries = self.entries.lock();
        let waiters = match entries.get(call_key) {
            Some(Entry::Running(r)) if r.execution_id == execution_id => r.waiters.len(),
            _ => return 0,
        };
        match outcome {
            Ok(result) if !self.ttl.is_zero() => {
                entries.insert(
                    call_key.to_string(),
                    Entry::Cached {
                        result: result.clone(),
                        completed_at: Instant::now(),
                    },
                );
            }
            _ => {
                entries.remove(call_key);
            }
        }
        waiters
    }

    fn detach(&self, call_key: &str, execution_id: u64, request_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(Entry::Running(running)) = entries.get_mut(call_key) {
            if running.execution_id != execution_id {
                return;
            }
            if let Some(pos) = running.waiters.iter().position(|w| w == request_id) {
                running.waiters.swap_remove(pos);
            }
            if running.waiters.is_empty() {
                tracing::debug!(call_key = %call_key, "no remaining interest; cancelling execution");
                running.cancel.cancel();
            }
        }
    }

    /// 清理过期缓存记录
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| match entry {
            Entry::Running(_) => true,
            Entry::Cached { completed_at, .. } => completed_at.elapsed() < ttl,
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| matches!(e, Entry::Running(_)))
            .count()
    }

    pub fn waiter_count(&self, call_key: &str) -> usize {
        match self.entries.lock().get(call_key) {
            Some(Entry::Running(r)) => r.waiters.len(),
            _ => 0,
        }
    }
}

/// 发起者的执行凭证：发布结果恰好一次
pub struct CallTicket {
    table: Arc<InFlightTable>,
    call_key: CallKey,
    execution_id: u64,
    coalesced: bool,
    outcome_tx: watch::Sender<Option<CallOutcome>>,
    progress_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
    finished: bool,
}

impl CallTicket {
    pub fn call_key(&self) -> &str {
        &self.call_key
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> ProgressSink {
        ProgressSink {
            tx: self.progress_tx.clone(),
        }
    }

    /// 发布结果给所有等待者（含发起者自身），返回收到结果的挂靠数
    pub fn complete(mut self, outcome: CallOutcome) -> usize {
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: CallOutcome) -> usize {
        if self.finished {
            return 0;
        }
        self.finished = true;
        let delivered = if self.coalesced {
            self.table.publish(&self.call_key, self.execution_id, &outcome)
        } else {
            1
        };
        self.outcome_tx.send_replace(Some(outcome));
        delivered
    }
}

impl Drop for CallTicket {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                call_key = %self.call_key,
                "call ticket dropped without an outcome; finalizing as cancelled"
            );
            self.finish(Err(DispatchError::Cancelled));
        }
    }
}

enum Interest {
    Shared {
        table: Arc<InFlightTable>,
        call_key: CallKey,
        execution_id: u64,
    },
    Exclusive(CancellationToken),
    None,
}

enum Source {
    Live {
        outcome_rx: watch::Receiver<Option<CallOutcome>>,
        progress_rx: Option<broadcast::Receiver<String>>,
    },
    Ready(Option<CallOutcome>),
}

enum Polled {
    Progress(Result<String, broadcast::error::RecvError>),
    Outcome(CallOutcome),
}

/// 订阅事件
#[derive(Debug)]
pub enum CallEvent {
    Progress(String),
    Done(CallOutcome),
}

/// 单个请求对一次执行的订阅；Drop 时若尚未拿到结果则放弃关注
pub struct Subscription {
    request_id: RequestId,
    source: Source,
    interest: Interest,
    coalesced: bool,
    done: bool,
}

impl Subscription {
    fn live(
        request_id: &str,
        outcome_rx: watch::Receiver<Option<CallOutcome>>,
        progress_rx: broadcast::Receiver<String>,
        interest: Interest,
        coalesced: bool,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            source: Source::Live {
                outcome_rx,
                progress_rx: Some(progress_rx),
            },
            interest,
            coalesced,
            done: false,
        }
    }

    fn ready(request_id: &str, outcome: CallOutcome) -> Self {
        Self {
            request_id: request_id.to_string(),
            source: Source::Ready(Some(outcome)),
            interest: Interest::None,
            coalesced: true,
            done: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// 结果是否来自其他请求发起的执行（或缓存）
    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    /// 下一个事件：进度或最终结果（结果之后不再产生事件）
    pub async fn next_event(&mut self) -> CallEvent {
        if self.done {
            return CallEvent::Done(Err(DispatchError::Cancelled));
        }
        let event = match &mut self.source {
            Source::Ready(outcome) => {
                CallEvent::Done(outcome.take().unwrap_or(Err(DispatchError::Cancelled)))
            }
            Source::Live {
                outcome_rx,
                progress_rx,
            } => loop {
                let polled = {
                    let progress = async {
                        match progress_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        biased;
                        // 先发完已产生的进度，再给出结果
                        msg = progress => Polled::Progress(msg),
                        res = outcome_rx.wait_for(Option::is_some) => Polled::Outcome(match res {
                            Ok(value) => (*value).clone().unwrap_or(Err(DispatchError::Cancelled)),
                            Err(_) => {
                                tracing::warn!(request_id = %self.request_id, "outcome channel closed without a result");
                                Err(DispatchError::Cancelled)
                            }
                        }),
                    }
                };
                match polled {
                    Polled::Progress(Ok(message)) => break CallEvent::Progress(message),
                    Polled::Progress(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        tracing::debug!(request_id = %self.request_id, skipped, "progress receiver lagged");
                    }
                    Polled::Progress(Err(broadcast::error::RecvError::Closed)) => *progress_rx = None,
                    Polled::Outcome(outcome) => break CallEvent::Done(outcome),
                }
            },
        };
        if matches!(event, CallEvent::Done(_)) {
            self.done = true;
        }
        event
    }

    /// 跳过进度，直接等待最终结果
    pub async fn outcome(&mut self) -> CallOutcome {
        loop {
            if let CallEvent::Done(outcome) = self.next_event().await {
                return outcome;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        match &self.interest {
            Interest::Shared {
                table,
                call_key,
                execution_id,
            } => table.detach(call_key, *execution_id, &self.request_id),
            Interest::Exclusive(cancel) => cancel.cancel(),
            Interest::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(ttl: Duration) -> Arc<InFlightTable> {
        Arc::new(InFlightTable::new(ttl, CancellationToken::new()))
    }

    fn result(value: serde_json::Value) -> CallResult {
        CallResult {
            value,
            provider: "alpha".into(),
            model: "alpha-pro".into(),
            continuation_id: None,
            notices: vec![],
        }
    }

    fn expect_originator(role: Role) -> (CallTicket, Subscription) {
        match role {
            Role::Originator(t, s) => (t, s),
            Role::Waiter(_) => panic!("Expected originator"),
        }
    }

    fn expect_waiter(role: Role) -> Subscription {
        match role {
            Role::Waiter(s) => s,
            Role::Originator(..) => panic!("Expected waiter"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_attaches_and_sees_same_outcome() {
        let table = table(Duration::from_secs(30));
        let (ticket, mut origin) = expect_originator(table.begin_or_attach("k", "r1", true));
        let mut waiter = expect_waiter(table.begin_or_attach("k", "r2", true));
        assert!(waiter.is_coalesced());
        assert!(!origin.is_coalesced());
        assert_eq!(table.waiter_count("k"), 2);

        let delivered = ticket.complete(Ok(result(json!({"n": 1}))));
        assert_eq!(delivered, 2);

        assert_eq!(origin.outcome().await, waiter.outcome().await);
    }

    #[tokio::test]
    async fn test_cached_result_served_within_ttl() {
        let table = table(Duration::from_secs(30));
        let (ticket, _sub) = expect_originator(table.begin_or_attach("k", "r1", true));
        ticket.complete(Ok(result(json!("cached"))));

        let mut hit = expect_waiter(table.begin_or_attach("k", "r2", true));
        assert_eq!(hit.outcome().await.unwrap().value, json!("cached"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cache_is_never_served() {
        let table = table(Duration::from_secs(5));
        let (ticket, _sub) = expect_originator(table.begin_or_attach("k", "r1", true));
        ticket.complete(Ok(result(json!("old"))));

        tokio::time::advance(Duration::from_secs(6)).await;
        // 过期记录尚未被清理，但新请求仍成为发起者
        assert_eq!(table.len(), 1);
        assert!(table.begin_or_attach("k", "r2", true).is_originator());
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let table = table(Duration::from_secs(30));
        let (ticket, mut sub) = expect_originator(table.begin_or_attach("k", "r1", true));
        ticket.complete(Err(DispatchError::Execution("boom".into())));
        assert!(sub.outcome().await.is_err());
        assert!(table.is_empty());
        assert!(table.begin_or_attach("k", "r2", true).is_originator());
    }

    #[tokio::test]
    async fn test_opt_out_always_originates() {
        let table = table(Duration::from_secs(30));
        let first = table.begin_or_attach("k", "r1", false);
        let second = table.begin_or_attach("k", "r2", false);
        assert!(first.is_originator());
        assert!(second.is_originator());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_last_detach_cancels_execution() {
        let table = table(Duration::from_secs(30));
        let (ticket, origin) = expect_originator(table.begin_or_attach("k", "r1", true));
        let waiter = expect_waiter(table.begin_or_attach("k", "r2", true));
        let token = ticket.cancel_token();

        drop(origin);
        assert!(!token.is_cancelled());
        drop(waiter);
        assert!(token.is_cancelled());
        drop(ticket);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_new_request_does_not_attach_to_cancelled_execution() {
        let table = table(Duration::from_secs(30));
        let (old_ticket, origin) = expect_originator(table.begin_or_attach("k", "r1", true));
        drop(origin);
        assert!(old_ticket.cancel_token().is_cancelled());

        // 旧执行尚未退出；新请求另起一次执行
        let (ticket, mut sub) = expect_originator(table.begin_or_attach("k", "r2", true));
        assert!(!ticket.cancel_token().is_cancelled());

        // 旧执行收尾不影响新条目
        assert_eq!(old_ticket.complete(Err(DispatchError::Cancelled)), 0);
        assert_eq!(table.waiter_count("k"), 1);

        assert_eq!(ticket.complete(Ok(result(json!({"fresh": true})))), 1);
        assert_eq!(sub.outcome().await.unwrap().value, json!({"fresh": true}));
    }

    #[tokio::test]
    async fn test_dropped_ticket_finalizes_as_cancelled() {
        let table = table(Duration::from_secs(30));
        let (ticket, mut sub) = expect_originator(table.begin_or_attach("k", "r1", true));
        let mut waiter = expect_waiter(table.begin_or_attach("k", "r2", true));
        drop(ticket);

        assert_eq!(sub.outcome().await, Err(DispatchError::Cancelled));
        assert_eq!(waiter.outcome().await, Err(DispatchError::Cancelled));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_progress_reaches_waiters() {
        let table = table(Duration::from_secs(30));
        let (ticket, mut origin) = expect_originator(table.begin_or_attach("k", "r1", true));
        let mut waiter = expect_waiter(table.begin_or_attach("k", "r2", true));

        ticket.progress().emit("halfway");
        match waiter.next_event().await {
            CallEvent::Progress(msg) => assert_eq!(msg, "halfway"),
            CallEvent::Done(_) => panic!("Expected progress"),
        }
        match origin.next_event().await {
            CallEvent::Progress(msg) => assert_eq!(msg, "halfway"),
            CallEvent::Done(_) => panic!("Expected progress"),
        }
        ticket.complete(Ok(result(json!(null))));
        assert!(matches!(waiter.next_event().await, CallEvent::Done(Ok(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_keeps_running() {
        let table = table(Duration::from_secs(1));
        let (done, _s1) = expect_originator(table.begin_or_attach("done", "r1", true));
        done.complete(Ok(result(json!(1))));
        let (_running, _s2) = expect_originator(table.begin_or_attach("running", "r2", true));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.evict_expired(), 1);
        assert_eq!(table.running_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attach_yields_single_originator() {
        let table = table(Duration::from_secs(30));
        let mut handles = Vec::new();
        for i in 0..32 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                match table.begin_or_attach("same", &format!("r{i}"), true) {
                    Role::Originator(ticket, sub) => (Some(ticket), sub),
                    Role::Waiter(sub) => (None, sub),
                }
            }));
        }
        let mut tickets = Vec::new();
        let mut subs = Vec::new();
        for handle in handles {
            let (ticket, sub) = handle.await.unwrap();
            tickets.extend(ticket);
            subs.push(sub);
        }
        assert_eq!(tickets.len(), 1);

        tickets.pop().unwrap().complete(Ok(result(json!("shared"))));
        for mut sub in subs {
            assert_eq!(sub.outcome().await.unwrap().value, json!("shared"));
        }
    }
}
