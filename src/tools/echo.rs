//! Echo 工具：回显参数与路由信息（冒烟测试用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::error::ToolError;
use crate::tools::{ToolHandler, ToolInvocation};

pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo arguments back with routing details. Args: any object"
    }

    async fn execute(&self, invocation: ToolInvocation) -> Result<Value, ToolError> {
        invocation
            .progress
            .emit(format!("echo via {}/{}", invocation.provider_id, invocation.model));
        Ok(json!({
            "echo": invocation.arguments,
            "provider": invocation.provider_id,
            "model": invocation.model,
            "disabled_capabilities": invocation.disabled_capabilities,
            "step": invocation.history.len() + 1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_includes_route() {
        let invocation = ToolInvocation::new("echo", json!({"text": "hello"})).with_route("alpha", "alpha-pro");
        let out = EchoTool.execute(invocation).await.unwrap();
        assert_eq!(out["echo"]["text"], "hello");
        assert_eq!(out["provider"], "alpha");
        assert_eq!(out["step"], 1);
    }
}
