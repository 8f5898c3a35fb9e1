//! Runtime 构建器：统一的调度运行时初始化逻辑
//!
//! 守护进程与集成测试共用同一条装配路径：账本、熔断器组、路由器、续接存储、会话管理器。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::continuation::{ContinuationBackend, ContinuationStore, MemoryBackend};
use crate::core::ledger::Ledger;
use crate::gateway::runtime::{DispatchRuntime, RuntimeConfig};
use crate::gateway::session::{Authenticator, SessionManager, StaticTokenAuthenticator};
use crate::observability::{AuditSink, TracingAuditSink};
use crate::provider::{BreakerBank, CapabilityRegistry, ProviderRouter};
use crate::tools::ToolRegistry;

/// Runtime 构建器
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    registry: CapabilityRegistry,
    tools: ToolRegistry,
    audit: Option<Arc<dyn AuditSink>>,
    backend: Option<Arc<dyn ContinuationBackend>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    root: Option<CancellationToken>,
}

impl RuntimeBuilder {
    pub fn new(registry: CapabilityRegistry, tools: ToolRegistry) -> Self {
        Self {
            config: RuntimeConfig::default(),
            registry,
            tools,
            audit: None,
            backend: None,
            authenticator: None,
            root: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// 默认写入 tracing 日志
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 默认使用内存后端
    pub fn with_continuation_backend(mut self, backend: Arc<dyn ContinuationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// 以静态令牌表认证
    pub fn with_tokens(self, tokens: impl IntoIterator<Item = String>) -> Self {
        self.with_authenticator(Arc::new(StaticTokenAuthenticator::new(tokens)))
    }

    /// 关闭令牌：取消时所有执行一起取消
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.root = Some(token);
        self
    }

    pub fn build(self) -> Arc<DispatchRuntime> {
        let config = self.config;
        let root = self.root.unwrap_or_default();

        let mut ledger_config = config.ledger.clone();
        for provider in self.registry.providers() {
            if let Some(capacity) = provider.pool_capacity {
                ledger_config
                    .provider_overrides
                    .entry(provider.id.clone())
                    .or_insert(capacity);
            }
        }
        let ledger = Arc::new(Ledger::new(ledger_config));

        let breakers = Arc::new(BreakerBank::new(config.breaker.clone()));
        let router = Arc::new(
            ProviderRouter::new(Arc::new(self.registry), breakers)
                .with_fallback_order(config.fallback_order.clone()),
        );

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let continuations = Arc::new(ContinuationStore::new(backend, config.continuation.clone()));

        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(StaticTokenAuthenticator::new(Vec::new())));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&ledger),
            authenticator,
            root.clone(),
            config.teardown_timeout,
        ));

        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(TracingAuditSink));

        tracing::info!(
            providers = router.registry().providers().len(),
            models = router.registry().model_count(),
            tools = self.tools.len(),
            "Dispatch runtime assembled"
        );

        Arc::new(DispatchRuntime::new(
            config,
            ledger,
            router,
            continuations,
            Arc::new(self.tools),
            sessions,
            audit,
            root,
        ))
    }
}
