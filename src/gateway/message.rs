//! 网关消息协议定义
//!
//! 以 `op` 字段区分操作的 JSON 信封：
//! `hello → hello_ack | error`；
//! `call_tool → call_tool_ack → progress* / notice* → call_tool_res | error`（每个 request_id 恰好一个终止事件）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{CapabilityNotice, DispatchError};

/// 工具调用请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub request_id: String,
    /// 工具名
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    /// 可选：显式指定模型
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_id: Option<String>,
    /// 可选能力（不满足时降级，不报错）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl ToolCallRequest {
    pub fn new(request_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            request_id: request_id.into(),
            name: name.into(),
            arguments,
            model: None,
            continuation_id: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_continuation(mut self, continuation_id: impl Into<String>) -> Self {
        self.continuation_id = Some(continuation_id.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

/// 网关消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// 握手（连接上的第一帧）
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    HelloAck {
        session_id: String,
    },
    CallTool(ToolCallRequest),
    CallToolAck {
        request_id: String,
    },
    Progress {
        request_id: String,
        message: String,
    },
    /// 非致命通知（能力降级 / 改路由）
    Notice {
        request_id: String,
        notice: CapabilityNotice,
    },
    CallToolRes {
        request_id: String,
        result: Value,
        provider: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continuation_id: Option<String>,
        /// 结果是否来自其他请求发起的执行（或缓存）
        #[serde(default)]
        coalesced: bool,
        #[serde(default)]
        notices: Vec<CapabilityNotice>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        kind: String,
        message: String,
    },
    /// 客户端取消自己的某个请求
    Cancel {
        request_id: String,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Close,
}

impl GatewayMessage {
    pub fn error(request_id: Option<&str>, err: &DispatchError) -> Self {
        GatewayMessage::Error {
            request_id: request_id.map(str::to_string),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn pong(timestamp: u64) -> Self {
        GatewayMessage::Pong { timestamp }
    }

    /// 解析文本帧；格式错误视为协议错误
    pub fn parse(text: &str) -> Result<Self, DispatchError> {
        serde_json::from_str(text).map_err(|e| DispatchError::Protocol(format!("malformed envelope: {}", e)))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to serialize gateway message");
            String::from(r#"{"op":"error","kind":"protocol_error","message":"serialization failure"}"#)
        })
    }

    /// 该消息是否为某个请求的终止事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GatewayMessage::CallToolRes { .. } | GatewayMessage::Error { request_id: Some(_), .. }
        )
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            GatewayMessage::CallTool(req) => Some(&req.request_id),
            GatewayMessage::CallToolAck { request_id }
            | GatewayMessage::Progress { request_id, .. }
            | GatewayMessage::Notice { request_id, .. }
            | GatewayMessage::CallToolRes { request_id, .. }
            | GatewayMessage::Cancel { request_id } => Some(request_id),
            GatewayMessage::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_call_tool() {
        let msg = GatewayMessage::parse(
            r#"{"op":"call_tool","request_id":"r1","name":"echo","arguments":{"x":1},"model":"alpha-pro","capabilities":["search"]}"#,
        )
        .unwrap();
        match msg {
            GatewayMessage::CallTool(req) => {
                assert_eq!(req.request_id, "r1");
                assert_eq!(req.model.as_deref(), Some("alpha-pro"));
                assert_eq!(req.capabilities, vec!["search"]);
                assert_eq!(req.arguments, json!({"x": 1}));
            }
            other => panic!("Expected call_tool, got {:?}", other),
        }
    }

    #[test]
    fn test_hello_without_token_parses() {
        let msg = GatewayMessage::parse(r#"{"op":"hello"}"#).unwrap();
        assert_eq!(
            msg,
            GatewayMessage::Hello {
                session_id: None,
                token: None
            }
        );
    }

    #[test]
    fn test_close_and_unknown_ops() {
        assert_eq!(GatewayMessage::parse(r#"{"op":"close"}"#).unwrap(), GatewayMessage::Close);
        let err = GatewayMessage::parse(r#"{"op":"launch_rockets"}"#).unwrap_err();
        assert_eq!(err.kind(), "protocol_error");
        assert!(GatewayMessage::parse("not json").is_err());
    }

    #[test]
    fn test_error_envelope() {
        let msg = GatewayMessage::error(Some("r9"), &DispatchError::Cancelled);
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["op"], "error");
        assert_eq!(value["request_id"], "r9");
        assert_eq!(value["kind"], "cancelled");
        assert!(msg.is_terminal());
        assert!(!GatewayMessage::error(None, &DispatchError::Protocol("x".into())).is_terminal());
    }

    #[test]
    fn test_result_serializes_notices() {
        let msg = GatewayMessage::CallToolRes {
            request_id: "r1".into(),
            result: json!({"ok": true}),
            provider: "beta".into(),
            model: "beta-vision".into(),
            continuation_id: None,
            coalesced: true,
            notices: vec![CapabilityNotice::degraded("beta-vision", "search")],
        };
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["op"], "call_tool_res");
        assert_eq!(value["coalesced"], true);
        assert_eq!(value["notices"][0]["kind"], "capability_degraded");
        assert!(value.get("continuation_id").is_none());
    }
}
