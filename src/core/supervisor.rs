//! 超时 / 取消监管
//!
//! 分层期限：Provider 单次调用 ≤ 工具执行边界 < 守护看门狗（约 1.5×）< 客户端期限（约 2×），
//! 内层总是先于外层到期。任一层到期都先对执行任务发出协作式取消，再给出 Timeout 错误。
//! 取消令牌以 root 为根：关闭守护进程时整棵树一起取消。

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::error::DispatchError;

/// 期限层级（由内到外）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineLayer {
    ProviderCall,
    ToolExecution,
    Watchdog,
    Client,
}

impl fmt::Display for DeadlineLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlineLayer::ProviderCall => write!(f, "provider_call"),
            DeadlineLayer::ToolExecution => write!(f, "tool_execution"),
            DeadlineLayer::Watchdog => write!(f, "watchdog"),
            DeadlineLayer::Client => write!(f, "client"),
        }
    }
}

/// 四层期限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineLayers {
    pub provider_call: Duration,
    pub tool_execution: Duration,
    pub watchdog: Duration,
    pub client: Duration,
}

impl DeadlineLayers {
    /// 以工具执行期限为基准推导其余各层
    pub fn from_tool_timeout(tool_execution: Duration) -> Self {
        Self {
            provider_call: tool_execution,
            tool_execution,
            watchdog: tool_execution.mul_f64(1.5),
            client: tool_execution * 2,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.provider_call.is_zero() {
            return Err("provider_call deadline must be positive".to_string());
        }
        if self.provider_call > self.tool_execution {
            return Err(format!(
                "provider_call ({:?}) must not exceed tool_execution ({:?})",
                self.provider_call, self.tool_execution
            ));
        }
        if self.watchdog <= self.tool_execution {
            return Err(format!(
                "watchdog ({:?}) must exceed tool_execution ({:?})",
                self.watchdog, self.tool_execution
            ));
        }
        if self.client <= self.watchdog {
            return Err(format!(
                "client ({:?}) must exceed watchdog ({:?})",
                self.client, self.watchdog
            ));
        }
        Ok(())
    }

    pub fn get(&self, layer: DeadlineLayer) -> Duration {
        match layer {
            DeadlineLayer::ProviderCall => self.provider_call,
            DeadlineLayer::ToolExecution => self.tool_execution,
            DeadlineLayer::Watchdog => self.watchdog,
            DeadlineLayer::Client => self.client,
        }
    }
}

impl Default for DeadlineLayers {
    fn default() -> Self {
        Self::from_tool_timeout(Duration::from_secs(60))
    }
}

/// 监管器：持有分层期限与根取消令牌
#[derive(Debug)]
pub struct Supervisor {
    layers: DeadlineLayers,
    root: CancellationToken,
}

impl Supervisor {
    pub fn new(layers: DeadlineLayers, root: CancellationToken) -> Self {
        Self { layers, root }
    }

    pub fn layers(&self) -> &DeadlineLayers {
        &self.layers
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 为一次执行派生子令牌
    pub fn execution_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// 在 `layer` 的期限内运行 `fut`
    ///
    /// `token` 被取消时立即返回 Cancelled；期限到达时取消 `token` 并返回 Timeout。
    /// 两种情况下 `fut` 都在下一个挂起点被丢弃，其持有的 guard 随之释放。
    pub async fn run_layer<F, T>(
        &self,
        layer: DeadlineLayer,
        token: &CancellationToken,
        fut: F,
    ) -> Result<T, DispatchError>
    where
        F: Future<Output = Result<T, DispatchError>>,
    {
        run_with_deadline(layer, self.layers.get(layer), token, fut).await
    }

    /// 触发全局取消（关闭时使用）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

/// 与 `Supervisor::run_layer` 相同，但期限由调用方给出（例如剩余的工具执行时间）
pub async fn run_with_deadline<F, T>(
    layer: DeadlineLayer,
    limit: Duration,
    token: &CancellationToken,
    fut: F,
) -> Result<T, DispatchError>
where
    F: Future<Output = Result<T, DispatchError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DispatchError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => {
                token.cancel();
                Err(DispatchError::Timeout { layer })
            }
        },
    }
}
