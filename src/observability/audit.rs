//! 审计事件（fire-and-forget）
//!
//! 审计写入失败或积压只记日志，永远不阻塞、不影响工具调用本身。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 一次执行的审计记录
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: &'static str,
    pub request_id: String,
    pub session_id: String,
    pub tool: String,
    pub call_key: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub ok: bool,
    /// "ok" 或错误 kind
    pub outcome: String,
    pub attempts: u32,
    /// 共享本次执行结果的请求数
    pub delivered: usize,
    pub duration_ms: u64,
    pub args_preview: String,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// 以 JSON 形式写入 tracing 日志
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(audit) => tracing::info!(audit = %audit, "tool"),
            Err(e) => tracing::warn!(request_id = %event.request_id, error = %e, "Failed to serialize audit event"),
        }
    }
}

/// 投递到有界通道；满了就丢弃并计数
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            };
            tracing::warn!(reason, dropped, "Audit event dropped");
        }
    }
}

/// 把通道中的审计事件追加写入 JSON Lines 文件；写失败只记日志
pub fn spawn_file_writer(mut rx: mpsc::Receiver<AuditEvent>, path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to open audit file; audit events discarded");
                while rx.recv().await.is_some() {}
                return;
            }
        };

        while let Some(event) = rx.recv().await {
            let mut line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(request_id = %event.request_id, error = %e, "Failed to serialize audit event");
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                tracing::warn!(request_id = %event.request_id, tool = %event.tool, call_key = %event.call_key, error = %e, "Audit write failed");
            }
        }
        let _ = file.flush().await;
    })
}

pub fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
