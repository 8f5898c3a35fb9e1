//! Hive Daemon
//!
//! 运行方式：
//! ```bash
//! cargo run -- [config.toml]
//! HIVE__AUTH__TOKENS=dev-token cargo run
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::continuation::ContinuationBackend;
use hive::core::shutdown::{ShutdownCoordinator, ShutdownManager};
use hive::gateway::{Hub, SessionDrain};
use hive::observability::{self, AuditSink, ChannelAuditSink, TracingAuditSink};
use hive::tools::ToolRegistry;
use hive::RuntimeBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    cfg.validate().context("Invalid config")?;
    if cfg.auth.tokens.is_empty() {
        tracing::warn!("auth.tokens is empty; every handshake will be rejected");
    }

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut builder = RuntimeBuilder::new(cfg.capability_registry(), ToolRegistry::with_builtin())
        .with_config(cfg.runtime_config())
        .with_tokens(cfg.auth.tokens.clone())
        .with_audit(audit_sink(&cfg))
        .with_shutdown_token(shutdown.token());
    if let Some(backend) = continuation_backend(&cfg).await? {
        builder = builder.with_continuation_backend(backend);
    }
    let runtime = builder.build();

    let hub = Hub::new(cfg.hub_config(), Arc::clone(&runtime), shutdown.token());
    let addr = hub.start().await.context("Failed to start gateway")?;
    tracing::info!("Hive daemon ready on ws://{}", addr);
    tracing::info!("Press Ctrl+C to stop");

    shutdown.wait_for_shutdown().await;

    tracing::info!("Shutting down hub...");
    hub.stop().await;

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown))
        .with_timeout(cfg.runtime_config().teardown_timeout);
    coordinator.register(SessionDrain::new(runtime));
    let report = coordinator.run_cleanup().await;
    if !report.is_clean() {
        tracing::warn!(?report, "Shutdown finished with unclean hooks");
    }

    Ok(())
}

fn audit_sink(cfg: &AppConfig) -> Arc<dyn AuditSink> {
    match (cfg.audit.sink.as_str(), &cfg.audit.path) {
        ("file", Some(path)) => {
            let (sink, rx) = ChannelAuditSink::new(cfg.audit.queue_capacity);
            observability::spawn_file_writer(rx, path.clone());
            tracing::info!(path = %path.display(), "Audit events written to file");
            Arc::new(sink)
        }
        _ => Arc::new(TracingAuditSink),
    }
}

#[cfg(feature = "async-sqlite")]
async fn continuation_backend(cfg: &AppConfig) -> anyhow::Result<Option<Arc<dyn ContinuationBackend>>> {
    match &cfg.continuation.sqlite_path {
        Some(path) => {
            let backend = hive::continuation::SqliteBackend::new(path)
                .await
                .with_context(|| format!("Failed to open continuation store at {}", path.display()))?;
            tracing::info!(path = %path.display(), "Continuation threads persisted to SQLite");
            Ok(Some(Arc::new(backend)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn continuation_backend(cfg: &AppConfig) -> anyhow::Result<Option<Arc<dyn ContinuationBackend>>> {
    if cfg.continuation.sqlite_path.is_some() {
        tracing::warn!("continuation.sqlite_path set but built without async-sqlite; using memory backend");
    }
    Ok(None)
}
