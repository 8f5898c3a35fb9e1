//! Sleep 工具：等待指定毫秒数，期间响应取消（用于验证分层期限）

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::error::ToolError;
use crate::tools::{ToolHandler, ToolInvocation};

const DEFAULT_MILLIS: u64 = 100;

pub struct SleepTool;

#[async_trait]
impl ToolHandler for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep for a number of milliseconds. Args: {\"millis\": 100}"
    }

    async fn execute(&self, invocation: ToolInvocation) -> Result<Value, ToolError> {
        let millis = invocation
            .arguments
            .get("millis")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MILLIS);

        tokio::select! {
            _ = invocation.cancel.cancelled() => {
                tracing::debug!(request_id = %invocation.request_id, "sleep cancelled");
                Err(ToolError::Failed("cancelled".to_string()))
            }
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                Ok(json!({ "slept_ms": millis, "provider": invocation.provider_id }))
            }
        }
    }
}
