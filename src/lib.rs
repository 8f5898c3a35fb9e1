//! Hive - 并发工具调用调度守护进程
//!
//! 模块划分：
//! - **config**: 守护进程配置加载（TOML + 环境变量）与校验
//! - **continuation**: 续接线程（绑定单一 Provider 的多步工作流）与存储后端
//! - **core**: 错误分类、并发账本、在途表、分层期限监管、调用指纹、关闭协调、构建器
//! - **gateway**: WebSocket 网关、会话管理、消息协议与调度运行时
//! - **observability**: 日志初始化与审计
//! - **provider**: 能力注册表、熔断器组、Provider 路由
//! - **tools**: 工具描述表与内置工具（echo、sleep）

pub mod config;
pub mod continuation;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod provider;
pub mod tools;

pub use crate::core::builder::RuntimeBuilder;
pub use crate::core::error::{DispatchError, ToolError};
pub use gateway::{DispatchRuntime, Hub};
