//! 工具描述表
//!
//! 名称 → 能力要求 + 合并策略 + 执行器。执行器只有 `ToolHandler` 一个接口，
//! 路由与合并策略全部由描述表中的数据决定。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::continuation::ContinuationStep;
use crate::core::error::ToolError;
use crate::core::inflight::ProgressSink;
use crate::provider::CapabilityRequirements;

/// 一次工具执行的输入
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub request_id: String,
    pub tool_name: String,
    pub arguments: Value,
    /// 路由选中的 Provider / 模型
    pub provider_id: String,
    pub model: String,
    /// 因模型不支持而被降级关闭的可选能力
    pub disabled_capabilities: Vec<String>,
    /// 续接线程中此前的步骤
    pub history: Vec<ContinuationStep>,
    pub progress: ProgressSink,
    /// 协作式取消；处理器应在挂起点检查
    pub cancel: CancellationToken,
}

impl ToolInvocation {
    /// 独立构造（测试或脱离调度器直接调用）
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            arguments,
            provider_id: String::new(),
            model: String::new(),
            disabled_capabilities: Vec::new(),
            history: Vec::new(),
            progress: ProgressSink::detached(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_route(mut self, provider_id: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self.model = model.into();
        self
    }
}

/// 工具执行器接口
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// `Transient` 表示 Provider 侧瞬时故障（触发 fallback），`Failed` 为工具自身失败
    async fn execute(&self, invocation: ToolInvocation) -> Result<Value, ToolError>;
}

/// 工具描述
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub requirements: CapabilityRequirements,
    /// 相同调用是否合并（非幂等工具应关闭）
    pub coalesce: bool,
    /// 指纹是否包含会话 ID（结果依赖会话时开启）
    pub session_scoped: bool,
    /// 成功后是否开启续接线程
    pub continuable: bool,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(handler: impl ToolHandler + 'static) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    pub fn from_arc(handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: handler.name().to_string(),
            description: handler.description().to_string(),
            requirements: CapabilityRequirements::default(),
            coalesce: true,
            session_scoped: false,
            continuable: false,
            handler,
        }
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.requirements = self.requirements.require(capability);
        self
    }

    pub fn prefer(mut self, capability: impl Into<String>) -> Self {
        self.requirements = self.requirements.prefer(capability);
        self
    }

    pub fn with_min_context(mut self, min_context: u32) -> Self {
        self.requirements = self.requirements.with_min_context(min_context);
        self
    }

    pub fn no_coalesce(mut self) -> Self {
        self.coalesce = false;
        self
    }

    pub fn session_scoped(mut self) -> Self {
        self.session_scoped = true;
        self
    }

    pub fn continuable(mut self) -> Self {
        self.continuable = true;
        self
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("requirements", &self.requirements)
            .field("coalesce", &self.coalesce)
            .field("session_scoped", &self.session_scoped)
            .field("continuable", &self.continuable)
            .finish()
    }
}

/// 工具注册表：按名称存储描述
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置工具：echo、sleep
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ToolDescriptor::new(super::EchoTool).prefer("search").continuable());
        registry.register(ToolDescriptor::new(super::SleepTool));
        registry
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        if self.tools.contains_key(&descriptor.name) {
            tracing::warn!(tool = %descriptor.name, "Tool re-registered; replacing previous descriptor");
        }
        self.tools
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    /// 以默认描述注册
    pub fn register_handler(&mut self, handler: impl ToolHandler + 'static) {
        self.register(ToolDescriptor::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .tools
            .values()
            .map(|d| (d.name.clone(), d.description.clone()))
            .collect();
        list.sort();
        list
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
