//! Hub：WebSocket 接入与后台维护
//!
//! 每条连接：升级为 WebSocket → 首帧必须是 hello（限时）→ 认证 → 会话；
//! 之后在同一个 select 循环里处理入站帧、心跳检查与关闭信号。
//! 连接以任何方式结束（close 操作、Close 帧、传输错误、空闲超时、协议错误）都会拆除会话。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::message::GatewayMessage;
use super::runtime::DispatchRuntime;
use super::session::SessionId;
use crate::core::error::DispatchError;
use crate::core::shutdown::ShutdownCleanup;

const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// WebSocket 监听地址（端口 0 表示随机端口）
    pub bind_addr: String,
    /// 最大并发连接数
    pub max_connections: usize,
    /// 心跳检查间隔
    pub heartbeat_interval: Duration,
    /// 无入站帧且无在途请求超过该时长则断开
    pub idle_timeout: Duration,
    /// 等待 hello 的时限
    pub handshake_timeout: Duration,
    /// 后台维护间隔
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9470".to_string(),
            max_connections: 256,
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Hub
pub struct Hub {
    config: Arc<HubConfig>,
    runtime: Arc<DispatchRuntime>,
    connections: Arc<Semaphore>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// `shutdown` 取消后停止接入并断开所有连接
    pub fn new(config: HubConfig, runtime: Arc<DispatchRuntime>, shutdown: CancellationToken) -> Self {
        let connections = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config: Arc::new(config),
            runtime,
            connections,
            shutdown,
            accept_task: Mutex::new(None),
        }
    }

    pub fn runtime(&self) -> &Arc<DispatchRuntime> {
        &self.runtime
    }

    /// 当前连接数
    pub fn connection_count(&self) -> usize {
        self.config.max_connections - self.connections.available_permits()
    }

    /// 启动网关，返回实际监听地址
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Gateway listening on ws://{}", addr);

        let config = Arc::clone(&self.config);
        let runtime = Arc::clone(&self.runtime);
        let connections = Arc::clone(&self.connections);
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut sweep_timer = tokio::time::interval_at(
                tokio::time::Instant::now() + config.sweep_interval,
                config.sweep_interval,
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sweep_timer.tick() => {
                        runtime.maintenance(config.idle_timeout).await;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let permit = Arc::clone(&connections).try_acquire_owned().ok();
                                let conn = Connection {
                                    config: Arc::clone(&config),
                                    runtime: Arc::clone(&runtime),
                                    shutdown: shutdown.clone(),
                                    peer,
                                };
                                tokio::spawn(async move {
                                    if let Err(e) = conn.serve(stream, permit).await {
                                        tracing::warn!("Connection error from {}: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::info!("Gateway stopped accepting connections");
        });
        *self.accept_task.lock() = Some(task);

        Ok(addr)
    }

    /// 停止接入；已有连接收到关闭信号后各自拆除会话（剩余的由 SessionDrain 兜底）
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Accept loop task failed");
            }
        }
    }
}

struct Connection {
    config: Arc<HubConfig>,
    runtime: Arc<DispatchRuntime>,
    shutdown: CancellationToken,
    peer: SocketAddr,
}

impl Connection {
    async fn serve(
        self,
        stream: TcpStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<GatewayMessage>();

        // 写出任务：所有发送端都释放后补发 Close 帧
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_tx.send(WsMessage::Text(msg.to_json())).await.is_err() {
                    return;
                }
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
            let _ = ws_tx.close().await;
        });

        let Some(_permit) = permit else {
            tracing::warn!(peer = %self.peer, max = self.config.max_connections, "Connection refused: limit reached");
            let err = DispatchError::Protocol("connection limit reached".to_string());
            let _ = tx.send(GatewayMessage::error(None, &err));
            return finish_writer(tx, writer).await;
        };

        let session_id = match self.handshake(&mut ws_rx).await {
            Ok(session_id) => session_id,
            Err(e) => {
                tracing::warn!(peer = %self.peer, kind = e.kind(), "Handshake rejected: {}", e);
                let _ = tx.send(GatewayMessage::error(None, &e));
                return finish_writer(tx, writer).await;
            }
        };
        let _ = tx.send(GatewayMessage::HelloAck {
            session_id: session_id.clone(),
        });
        tracing::info!(peer = %self.peer, session_id = %session_id, "Session established");

        let reason = self.run_session(&session_id, &mut ws_rx, &tx).await;
        tracing::info!(peer = %self.peer, session_id = %session_id, reason, "Connection closing");

        self.runtime.sessions().teardown(&session_id).await;
        finish_writer(tx, writer).await
    }

    /// 等待首帧 hello 并完成认证
    async fn handshake(
        &self,
        ws_rx: &mut SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<SessionId, DispatchError> {
        let first = tokio::time::timeout(self.config.handshake_timeout, async {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => return Some(text),
                    Ok(WsMessage::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        })
        .await
        .map_err(|_| DispatchError::Protocol("handshake timed out".to_string()))?
        .ok_or_else(|| DispatchError::Protocol("connection closed before hello".to_string()))?;

        match GatewayMessage::parse(&first)? {
            GatewayMessage::Hello { session_id, token } => {
                self.runtime
                    .sessions()
                    .handshake(token.as_deref(), session_id.as_deref())
                    .await
            }
            _ => Err(DispatchError::Protocol("first frame must be hello".to_string())),
        }
    }

    /// 会话主循环；返回断开原因
    async fn run_session(
        &self,
        session_id: &str,
        ws_rx: &mut SplitStream<WebSocketStream<TcpStream>>,
        tx: &mpsc::UnboundedSender<GatewayMessage>,
    ) -> &'static str {
        let sessions = self.runtime.sessions();
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return "shutdown",
                _ = heartbeat.tick() => {
                    if !sessions.is_live(session_id).await {
                        return "session_gone";
                    }
                    let idle = sessions.idle_for(session_id).await.unwrap_or_default();
                    if idle >= self.config.idle_timeout && sessions.inflight_count(session_id).await == 0 {
                        return "idle_timeout";
                    }
                }
                frame = ws_rx.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            tracing::warn!(session_id = %session_id, error = %e, "WebSocket receive error");
                            return "transport_error";
                        }
                        None => return "eof",
                    };
                    sessions.touch(session_id).await;

                    let text = match frame {
                        WsMessage::Text(text) => text,
                        WsMessage::Close(_) => return "close_frame",
                        WsMessage::Binary(_) => {
                            let err = DispatchError::Protocol("binary frames are not supported".to_string());
                            let _ = tx.send(GatewayMessage::error(None, &err));
                            return "protocol_error";
                        }
                        _ => continue,
                    };

                    match GatewayMessage::parse(&text) {
                        Ok(GatewayMessage::CallTool(request)) => {
                            self.runtime.submit(session_id, request, tx.clone()).await;
                        }
                        Ok(GatewayMessage::Cancel { request_id }) => {
                            self.runtime.cancel(session_id, &request_id).await;
                        }
                        Ok(GatewayMessage::Ping { timestamp }) => {
                            let _ = tx.send(GatewayMessage::pong(timestamp));
                        }
                        Ok(GatewayMessage::Close) => return "close_op",
                        Ok(other) => {
                            tracing::warn!(session_id = %session_id, message = ?other, "Unexpected op");
                            let err = DispatchError::Protocol("unexpected op for a client frame".to_string());
                            let _ = tx.send(GatewayMessage::error(other.request_id(), &err));
                            return "protocol_error";
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %session_id, error = %e, "Malformed frame");
                            let _ = tx.send(GatewayMessage::error(None, &e));
                            return "protocol_error";
                        }
                    }
                }
            }
        }
    }
}

/// 释放本地发送端并等待写出任务把剩余消息与 Close 帧发完
async fn finish_writer(
    tx: mpsc::UnboundedSender<GatewayMessage>,
    writer: JoinHandle<()>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    drop(tx);
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        tracing::debug!("Writer did not finish in time");
    }
    Ok(())
}

/// 关闭时拆除所有会话
pub struct SessionDrain {
    runtime: Arc<DispatchRuntime>,
}

impl SessionDrain {
    pub fn new(runtime: Arc<DispatchRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SessionDrain {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let drained = self.runtime.sessions().teardown_all().await;
        tracing::info!(sessions = drained, "Sessions drained");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "session_drain"
    }
}
