//! Dispatch Runtime（调度运行时）
//!
//! 把一个 call_tool 请求串起来：
//! 会话登记 → call_key → 在途表（发起 / 挂靠）→ 路由 + 熔断 → 账本准入 → 分层期限内执行 →
//! 先释放槽位、更新熔断与续接状态，再把结果广播给所有等待者。
//!
//! 每个请求只通过 `Responder` 发送终止事件，它被消费一次；未发送就被丢弃时兜底发送 cancelled。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::message::{GatewayMessage, ToolCallRequest};
use super::session::{SessionId, SessionManager};
use crate::continuation::{ContinuationConfig, ContinuationStep, ContinuationStore};
use crate::core::error::{DispatchError, ToolError};
use crate::core::fingerprint::{call_key, CallScope};
use crate::core::inflight::{CallEvent, CallOutcome, CallResult, CallTicket, InFlightTable, ProgressSink, Role};
use crate::core::ledger::{ConcurrencyPool, Ledger, LedgerConfig};
use crate::core::supervisor::{run_with_deadline, DeadlineLayer, DeadlineLayers, Supervisor};
use crate::observability::{args_preview, AuditEvent, AuditSink};
use crate::provider::{BreakerBank, BreakerConfig, ProviderId, ProviderRouter, RouteRequest, Selection};
use crate::tools::{ToolDescriptor, ToolInvocation, ToolRegistry};

/// Runtime 配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub layers: DeadlineLayers,
    pub ledger: LedgerConfig,
    pub breaker: BreakerConfig,
    pub continuation: ContinuationConfig,
    /// 全局合并开关
    pub coalescing_enabled: bool,
    /// 成功结果缓存时间；0 表示只合并同时在途的请求
    pub result_ttl: Duration,
    /// 不参与合并的工具
    pub coalesce_opt_out: HashSet<String>,
    /// 空表示使用 [[providers]] 声明顺序
    pub fallback_order: Vec<ProviderId>,
    /// 瞬时故障后最多再尝试几个 Provider
    pub max_fallback_depth: usize,
    pub teardown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            layers: DeadlineLayers::default(),
            ledger: LedgerConfig::default(),
            breaker: BreakerConfig::default(),
            continuation: ContinuationConfig::default(),
            coalescing_enabled: true,
            result_ttl: Duration::from_secs(30),
            coalesce_opt_out: HashSet::new(),
            fallback_order: Vec::new(),
            max_fallback_depth: 2,
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

/// 一次执行所需的上下文（由发起者请求构造，与具体等待者无关）
struct ExecutionContext {
    session_id: SessionId,
    /// 发起者会话的池；fallback 重试沿用它，发起会话拆除后挂靠者仍能完成
    session_pool: Arc<ConcurrencyPool>,
    request_id: String,
    call_key: String,
    descriptor: Arc<ToolDescriptor>,
    arguments: serde_json::Value,
    requested_model: Option<String>,
    capabilities: Vec<String>,
    continuation_id: Option<String>,
    bound_provider: Option<ProviderId>,
    history: Vec<ContinuationStep>,
}

/// Dispatch Runtime
pub struct DispatchRuntime {
    config: RuntimeConfig,
    supervisor: Supervisor,
    ledger: Arc<Ledger>,
    inflight: Arc<InFlightTable>,
    router: Arc<ProviderRouter>,
    continuations: Arc<ContinuationStore>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    audit: Arc<dyn AuditSink>,
    /// 实际执行次数（不含合并与缓存命中）
    executions: AtomicU64,
}

impl DispatchRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        ledger: Arc<Ledger>,
        router: Arc<ProviderRouter>,
        continuations: Arc<ContinuationStore>,
        tools: Arc<ToolRegistry>,
        sessions: Arc<SessionManager>,
        audit: Arc<dyn AuditSink>,
        root: CancellationToken,
    ) -> Self {
        let inflight = Arc::new(InFlightTable::new(config.result_ttl, root.clone()));
        Self {
            supervisor: Supervisor::new(config.layers, root),
            config,
            ledger,
            inflight,
            router,
            continuations,
            tools,
            sessions,
            audit,
            executions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn inflight(&self) -> &Arc<InFlightTable> {
        &self.inflight
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub fn breakers(&self) -> &Arc<BreakerBank> {
        self.router.breakers()
    }

    pub fn continuations(&self) -> &Arc<ContinuationStore> {
        &self.continuations
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// 提交请求：先确认（恰好一次），再异步执行；之后的事件全部经 `tx` 发出
    ///
    /// 重复的 request_id 直接回 duplicate_request 错误，不确认也不执行。
    pub async fn submit(
        self: &Arc<Self>,
        session_id: &str,
        request: ToolCallRequest,
        tx: mpsc::UnboundedSender<GatewayMessage>,
    ) {
        let request_id = request.request_id.clone();
        let cancel = match self.sessions.reserve_request(session_id, &request_id).await {
            Ok(cancel) => cancel,
            Err(e) => {
                tracing::warn!(session_id = %session_id, request_id = %request_id, error = %e, "Request rejected");
                let _ = tx.send(GatewayMessage::error(Some(&request_id), &e));
                return;
            }
        };

        let _ = tx.send(GatewayMessage::CallToolAck {
            request_id: request_id.clone(),
        });

        let runtime = Arc::clone(self);
        let session = session_id.to_string();
        let task = tokio::spawn(async move {
            runtime.run_request(session, request, cancel, tx).await;
        });
        self.sessions.attach_task(session_id, &request_id, task).await;
    }

    /// 取消本会话的某个请求
    pub async fn cancel(&self, session_id: &str, request_id: &str) -> bool {
        let cancelled = self.sessions.cancel_request(session_id, request_id).await;
        if cancelled {
            tracing::debug!(session_id = %session_id, request_id = %request_id, "Request cancelled by client");
        }
        cancelled
    }

    async fn run_request(
        self: Arc<Self>,
        session_id: SessionId,
        request: ToolCallRequest,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<GatewayMessage>,
    ) {
        let responder = Responder::new(&request.request_id, tx);
        let outcome = self.dispatch(&session_id, &request, &cancel, &responder).await;
        self.sessions
            .complete_request(&session_id, &request.request_id)
            .await;
        responder.finish(outcome);
    }

    async fn dispatch(
        self: &Arc<Self>,
        session_id: &str,
        request: &ToolCallRequest,
        cancel: &CancellationToken,
        responder: &Responder,
    ) -> Result<(CallResult, bool), DispatchError> {
        let descriptor = self
            .tools
            .get(&request.name)
            .ok_or_else(|| DispatchError::UnknownTool(request.name.clone()))?;

        let mut bound_provider = None;
        let mut history = Vec::new();
        if let Some(continuation_id) = &request.continuation_id {
            let requested_provider = match &request.model {
                Some(model) => Some(
                    self.router
                        .registry()
                        .resolve_model(model)
                        .map(|(p, _)| p.id.clone())
                        .ok_or_else(|| {
                            DispatchError::ProviderUnavailable(format!("unknown model '{}'", model))
                        })?,
                ),
                None => None,
            };
            let thread = self
                .continuations
                .validate(continuation_id, requested_provider.as_deref())
                .await?;
            bound_provider = Some(thread.bound_provider_id);
            history = thread.step_history;
        }

        let scope = CallScope {
            session_id: descriptor.session_scoped.then_some(session_id),
            continuation_id: request.continuation_id.as_deref(),
            requested_model: request.model.as_deref(),
            capabilities: &request.capabilities,
        };
        let key = call_key(&descriptor.name, &request.arguments, &scope);
        let coalesce = descriptor.coalesce
            && self.config.coalescing_enabled
            && !self.config.coalesce_opt_out.contains(&descriptor.name);
        let session_pool = self
            .ledger
            .session_pool(session_id)
            .ok_or(DispatchError::Cancelled)?;

        let (mut subscription, execution) =
            match self.inflight.begin_or_attach(&key, &request.request_id, coalesce) {
                Role::Originator(ticket, subscription) => {
                    let ctx = ExecutionContext {
                        session_id: session_id.to_string(),
                        session_pool,
                        request_id: request.request_id.clone(),
                        call_key: key.clone(),
                        descriptor: Arc::clone(&descriptor),
                        arguments: request.arguments.clone(),
                        requested_model: request.model.clone(),
                        capabilities: request.capabilities.clone(),
                        continuation_id: request.continuation_id.clone(),
                        bound_provider,
                        history,
                    };
                    let exec_cancel = ticket.cancel_token();
                    let runtime = Arc::clone(self);
                    let handle = tokio::spawn(async move { runtime.execute_call(ctx, ticket).await });
                    (subscription, Some((handle, exec_cancel)))
                }
                Role::Waiter(subscription) => {
                    tracing::debug!(
                        request_id = %request.request_id,
                        call_key = %key,
                        "Request coalesced onto existing call"
                    );
                    (subscription, None)
                }
            };

        let coalesced = subscription.is_coalesced();
        let waited = run_with_deadline(DeadlineLayer::Client, self.config.layers.client, cancel, async {
            loop {
                match subscription.next_event().await {
                    CallEvent::Progress(message) => responder.progress(message),
                    CallEvent::Done(outcome) => return Ok(outcome),
                }
            }
        })
        .await;
        drop(subscription);

        // 执行已无人关注而被取消时，等它退出（槽位随之归还）再返回
        if let Some((handle, exec_cancel)) = execution {
            if exec_cancel.is_cancelled() {
                if let Err(e) = handle.await {
                    tracing::warn!(request_id = %request.request_id, call_key = %key, error = %e, "Execution task failed");
                }
            }
        }

        let outcome: CallOutcome = waited?;
        outcome.map(|result| (result, coalesced))
    }

    async fn execute_call(self: Arc<Self>, ctx: ExecutionContext, ticket: CallTicket) {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let token = ticket.cancel_token();
        let progress = ticket.progress();
        let mut attempts = 0u32;

        let outcome = self
            .supervisor
            .run_layer(
                DeadlineLayer::Watchdog,
                &token,
                self.run_attempts(&ctx, &token, &progress, &mut attempts),
            )
            .await;

        if let Err(e) = &outcome {
            if !matches!(e, DispatchError::Cancelled) {
                tracing::warn!(
                    tool = %ctx.descriptor.name,
                    request_id = %ctx.request_id,
                    call_key = %ctx.call_key,
                    attempts,
                    error = %e,
                    "Tool call failed"
                );
            }
        }

        let (ok, outcome_label, provider, model) = match &outcome {
            Ok(result) => (true, "ok".to_string(), Some(result.provider.clone()), Some(result.model.clone())),
            Err(e) => (false, e.kind().to_string(), None, None),
        };
        let delivered = ticket.complete(outcome);

        self.audit.record(AuditEvent {
            event: "tool_audit",
            request_id: ctx.request_id.clone(),
            session_id: ctx.session_id.clone(),
            tool: ctx.descriptor.name.clone(),
            call_key: ctx.call_key.clone(),
            provider,
            model,
            ok,
            outcome: outcome_label,
            attempts,
            delivered,
            duration_ms: started.elapsed().as_millis() as u64,
            args_preview: args_preview(&ctx.arguments),
        });
    }

    /// 路由 + 准入 + 执行；瞬时故障时换下一个 Provider，整条链受工具执行期限约束
    async fn run_attempts(
        &self,
        ctx: &ExecutionContext,
        token: &CancellationToken,
        progress: &ProgressSink,
        attempts: &mut u32,
    ) -> Result<CallResult, DispatchError> {
        let layers = self.config.layers;
        let deadline = Instant::now() + layers.tool_execution;
        let requirements = ctx.descriptor.requirements.with_requested(&ctx.capabilities);

        // 续接线程只能在绑定的 Provider 上执行，不做跨 Provider fallback
        let bound_order: Vec<ProviderId> = ctx.bound_provider.iter().cloned().collect();
        let fallback_order = (!bound_order.is_empty()).then_some(bound_order.as_slice());
        let max_attempts = if ctx.bound_provider.is_some() {
            1
        } else {
            1 + self.config.max_fallback_depth as u32
        };

        let mut exclude: HashSet<ProviderId> = HashSet::new();
        let mut last_failure: Option<String> = None;

        while *attempts < max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DispatchError::Timeout {
                    layer: DeadlineLayer::ToolExecution,
                });
            }

            let selection = self.router.select(RouteRequest {
                requested_model: ctx.requested_model.as_deref(),
                requirements: &requirements,
                fallback_order,
                exclude: &exclude,
            });
            let Selection {
                provider_id,
                model,
                disabled_capabilities,
                notices,
                permit,
            } = match selection {
                Ok(selection) => selection,
                Err(e) => {
                    return Err(match last_failure {
                        Some(last) => DispatchError::ProviderUnavailable(format!(
                            "no provider left after {} attempt(s); last failure: {}",
                            attempts, last
                        )),
                        None => e,
                    });
                }
            };
            *attempts += 1;

            let mut lease = self.ledger.try_acquire_in(&ctx.session_pool, &provider_id).await?;

            let attempt_token = token.child_token();
            let invocation = ToolInvocation {
                request_id: ctx.request_id.clone(),
                tool_name: ctx.descriptor.name.clone(),
                arguments: ctx.arguments.clone(),
                provider_id: provider_id.clone(),
                model: model.clone(),
                disabled_capabilities,
                history: ctx.history.clone(),
                progress: progress.clone(),
                cancel: attempt_token.clone(),
            };
            // 首次尝试按 Provider 单次期限；之后受剩余的工具执行时间约束
            let limit = if *attempts == 1 {
                layers.provider_call
            } else {
                layers.provider_call.min(remaining)
            };
            let layer = if limit == layers.provider_call {
                DeadlineLayer::ProviderCall
            } else {
                DeadlineLayer::ToolExecution
            };
            let handler = Arc::clone(&ctx.descriptor.handler);
            let result = run_with_deadline(layer, limit, &attempt_token, async move {
                Ok(handler.execute(invocation).await)
            })
            .await;
            lease.release();

            match result {
                Ok(Ok(value)) => {
                    permit.record_success();
                    let continuation_id = self
                        .record_continuation(ctx, &provider_id, &model)
                        .await?;
                    return Ok(CallResult {
                        value,
                        provider: provider_id,
                        model,
                        continuation_id,
                        notices,
                    });
                }
                Ok(Err(ToolError::Failed(message))) => {
                    // 工具自身失败不是 Provider 的问题
                    permit.record_success();
                    return Err(DispatchError::Execution(message));
                }
                Ok(Err(ToolError::Transient(message))) => {
                    let state = permit.record_failure();
                    tracing::warn!(
                        tool = %ctx.descriptor.name,
                        request_id = %ctx.request_id,
                        call_key = %ctx.call_key,
                        provider = %provider_id,
                        breaker = %state,
                        error = %message,
                        "Transient provider failure; trying next provider"
                    );
                    last_failure = Some(format!("{}: {}", provider_id, message));
                    exclude.insert(provider_id);
                }
                Err(DispatchError::Timeout { layer }) => {
                    // 剩余预算耗尽不算 Provider 故障；未结算的许可 Drop 时只归还探测名额
                    if layer == DeadlineLayer::ProviderCall {
                        permit.record_failure();
                    }
                    return Err(DispatchError::Timeout { layer });
                }
                Err(other) => return Err(other),
            }
        }

        Err(DispatchError::ProviderUnavailable(format!(
            "gave up after {} attempt(s); last failure: {}",
            attempts,
            last_failure.unwrap_or_else(|| "none".to_string())
        )))
    }

    async fn record_continuation(
        &self,
        ctx: &ExecutionContext,
        provider_id: &str,
        model: &str,
    ) -> Result<Option<String>, DispatchError> {
        let continuation_id = match &ctx.continuation_id {
            Some(id) => id.clone(),
            None if ctx.descriptor.continuable => self.continuations.create(provider_id).await?,
            None => return Ok(None),
        };
        let step = ContinuationStep::new(
            &ctx.descriptor.name,
            &ctx.request_id,
            provider_id,
            model,
            ctx.arguments.clone(),
        );
        self.continuations
            .append_step(&continuation_id, step, provider_id)
            .await?;
        Ok(Some(continuation_id))
    }

    /// 后台维护：清理过期缓存与续接线程、拆除空闲会话
    pub async fn maintenance(&self, idle_timeout: Duration) -> MaintenanceReport {
        let evicted = self.inflight.evict_expired();
        let swept = match self.continuations.sweep().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Continuation sweep failed");
                0
            }
        };
        let idle_sessions = self.sessions.teardown_idle(idle_timeout).await;
        let report = MaintenanceReport {
            evicted,
            swept,
            idle_sessions,
            active_sessions: self.sessions.active_count().await,
            inflight_entries: self.inflight.len(),
            global_held: self.ledger.global_stats().held,
        };
        tracing::debug!(?report, "Maintenance pass");
        report
    }

    /// 各 Provider 熔断状态（provider → state）
    pub fn breaker_states(&self) -> HashMap<String, String> {
        self.breakers()
            .snapshot()
            .into_iter()
            .map(|s| (s.provider_id, s.state.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub swept: usize,
    pub idle_sessions: usize,
    pub active_sessions: usize,
    pub inflight_entries: usize,
    pub global_held: usize,
}

/// 单个请求的事件出口；终止事件恰好一次
struct Responder {
    request_id: String,
    tx: mpsc::UnboundedSender<GatewayMessage>,
    finished: bool,
}

impl Responder {
    fn new(request_id: &str, tx: mpsc::UnboundedSender<GatewayMessage>) -> Self {
        Self {
            request_id: request_id.to_string(),
            tx,
            finished: false,
        }
    }

    fn progress(&self, message: String) {
        let _ = self.tx.send(GatewayMessage::Progress {
            request_id: self.request_id.clone(),
            message,
        });
    }

    fn finish(mut self, outcome: Result<(CallResult, bool), DispatchError>) {
        self.finished = true;
        let message = match outcome {
            Ok((result, coalesced)) => {
                for notice in &result.notices {
                    let _ = self.tx.send(GatewayMessage::Notice {
                        request_id: self.request_id.clone(),
                        notice: notice.clone(),
                    });
                }
                GatewayMessage::CallToolRes {
                    request_id: self.request_id.clone(),
                    result: result.value,
                    provider: result.provider,
                    model: result.model,
                    continuation_id: result.continuation_id,
                    coalesced,
                    notices: result.notices,
                }
            }
            Err(e) => GatewayMessage::error(Some(&self.request_id), &e),
        };
        if self.tx.send(message).is_err() {
            tracing::debug!(request_id = %self.request_id, "Connection gone before terminal event");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self
                .tx
                .send(GatewayMessage::error(Some(&self.request_id), &DispatchError::Cancelled));
        }
    }
}
