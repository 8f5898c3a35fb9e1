//! 优雅关闭
//!
//! 关闭令牌是整棵取消树的根：Hub 的接入循环、每个会话、每次执行都挂在它下面。
//! 收到 Ctrl+C / SIGTERM 后：
//! 1. 取消根令牌，Hub 停止接入，各连接自行拆除会话
//! 2. `ShutdownCoordinator` 依次运行清理钩子（如 `SessionDrain`），每个钩子单独限时

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    root: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 守护进程内部无法继续（如监听端口失效）
    Fatal(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            root: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 根取消令牌
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 只有第一次调用生效
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.root.is_cancelled() {
            return;
        }
        tracing::info!(?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.root.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM；关闭后监听任务随之退出
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.root.cancelled() => {}
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => manager.shutdown(ShutdownReason::Interrupt),
                    Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl+C"),
                },
                _ = terminate_signal() => manager.shutdown(ShutdownReason::Terminate),
            }
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// 关闭时执行的清理钩子
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 一轮清理的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    pub timed_out: Vec<&'static str>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// 关闭协调器：按注册顺序执行清理钩子，每个钩子单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    hooks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            hooks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, hook: T) {
        self.hooks.push(Arc::new(hook));
    }

    /// 运行所有钩子；某个钩子失败或超时不影响后续钩子
    pub async fn run_cleanup(&self) -> CleanupReport {
        tracing::info!(hooks = self.hooks.len(), timeout = ?self.timeout, "Running shutdown hooks");
        let mut report = CleanupReport::default();

        for hook in &self.hooks {
            let name = hook.name();
            match tokio::time::timeout(self.timeout, hook.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(hook = name, "Shutdown hook completed");
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!(hook = name, error = %e, "Shutdown hook failed");
                    report.failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(hook = name, timeout = ?self.timeout, "Shutdown hook timed out");
                    report.timed_out.push(name);
                }
            }
        }

        tracing::info!(clean = report.is_clean(), "Shutdown hooks finished");
        report
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}
