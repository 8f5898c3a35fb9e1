//! 可观测性：日志初始化与审计

pub mod audit;

pub use audit::{args_preview, spawn_file_writer, AuditEvent, AuditSink, ChannelAuditSink, TracingAuditSink};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "hive=info";

/// 安装全局日志订阅器；RUST_LOG 优先于默认级别
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
