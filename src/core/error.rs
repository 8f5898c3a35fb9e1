//! 调度错误分类与能力降级通知
//!
//! 每个 DispatchError 变体对应一个稳定的 kind 字符串（随 error 消息发给客户端）。
//! 认证 / 协议错误会关闭连接；其余错误只作用于单个请求及其合并等待者。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ledger::PoolKind;
use crate::core::supervisor::DeadlineLayer;

/// 调度过程中的全部错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Capacity exceeded on {pool} pool")]
    CapacityExceeded { pool: PoolKind },

    #[error("No provider available: {0}")]
    ProviderUnavailable(String),

    #[error("Deadline exceeded at {layer} layer")]
    Timeout { layer: DeadlineLayer },

    #[error("Continuation {continuation_id} is bound to provider '{bound}', not '{requested}'")]
    ScopeViolation {
        continuation_id: String,
        bound: String,
        requested: String,
    },

    #[error("Continuation thread expired: {0}")]
    ExpiredThread(String),

    #[error("Unknown continuation: {0}")]
    UnknownContinuation(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Duplicate request id: {0}")]
    DuplicateRequest(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl DispatchError {
    /// 稳定的错误类型标识（协议字段 `kind`）
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Authentication(_) => "authentication_error",
            DispatchError::Protocol(_) => "protocol_error",
            DispatchError::CapacityExceeded { .. } => "capacity_exceeded",
            DispatchError::ProviderUnavailable(_) => "provider_unavailable",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::ScopeViolation { .. } => "scope_violation",
            DispatchError::ExpiredThread(_) => "expired_thread",
            DispatchError::UnknownContinuation(_) => "unknown_continuation",
            DispatchError::Execution(_) => "execution_error",
            DispatchError::UnknownTool(_) => "unknown_tool",
            DispatchError::DuplicateRequest(_) => "duplicate_request",
            DispatchError::Cancelled => "cancelled",
        }
    }

    /// 是否需要终止整个连接（会话随之拆除）
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::Authentication(_) | DispatchError::Protocol(_)
        )
    }
}

/// 工具处理器返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Provider 侧瞬时故障：计入熔断器并触发 fallback
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// 工具自身失败：不重试，转为 execution_error
    #[error("{0}")]
    Failed(String),
}

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// 所选模型不支持某个请求的可选能力，调用在无该能力的情况下继续
    CapabilityDegraded,
    /// 显式请求的模型不可用（熔断 / 缺少必需能力），已改路由到其他模型
    ModelRerouted,
}

/// 非致命通知：随结果一并返回，使降级成功可与完整成功区分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityNotice {
    pub kind: NoticeKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub message: String,
}

impl CapabilityNotice {
    pub fn degraded(model: &str, capability: &str) -> Self {
        Self {
            kind: NoticeKind::CapabilityDegraded,
            model: model.to_string(),
            capability: Some(capability.to_string()),
            message: format!(
                "model '{}' does not support '{}'; continuing without it",
                model, capability
            ),
        }
    }

    pub fn rerouted(requested: &str, reason: &str) -> Self {
        Self {
            kind: NoticeKind::ModelRerouted,
            model: requested.to_string(),
            capability: None,
            message: format!("requested model '{}' {}; routed elsewhere", requested, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(
            DispatchError::CapacityExceeded { pool: PoolKind::Global }.kind(),
            "capacity_exceeded"
        );
        assert_eq!(
            DispatchError::Timeout { layer: DeadlineLayer::ProviderCall }.kind(),
            "timeout"
        );
        assert_eq!(DispatchError::ExpiredThread("t".into()).kind(), "expired_thread");
        assert_eq!(DispatchError::Execution("boom".into()).kind(), "execution_error");
    }

    #[test]
    fn test_only_auth_and_protocol_are_fatal() {
        assert!(DispatchError::Authentication("bad".into()).is_connection_fatal());
        assert!(DispatchError::Protocol("garbled".into()).is_connection_fatal());
        assert!(!DispatchError::Cancelled.is_connection_fatal());
        assert!(!DispatchError::ProviderUnavailable("x".into()).is_connection_fatal());
    }

    #[test]
    fn test_notice_serializes_kind() {
        let notice = CapabilityNotice::degraded("flash", "search");
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["kind"], "capability_degraded");
        assert_eq!(json["capability"], "search");
    }
}
