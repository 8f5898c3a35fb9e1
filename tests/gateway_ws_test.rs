//! WebSocket 网关端到端测试

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use hive::gateway::{DispatchRuntime, GatewayMessage, Hub, HubConfig};
    use hive::provider::{CapabilityRegistry, ModelSpec, ProviderSpec};
    use hive::tools::ToolRegistry;
    use hive::RuntimeBuilder;
    use serde_json::{json, Value};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use tokio_util::sync::CancellationToken;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const TOKEN: &str = "ws-token";

    async fn start_hub(config: HubConfig) -> (Hub, Arc<DispatchRuntime>, SocketAddr) {
        let registry = CapabilityRegistry::new(vec![
            ProviderSpec::new("alpha").with_model(ModelSpec::new("alpha-pro").with_capability("search")),
        ]);
        let runtime = RuntimeBuilder::new(registry, ToolRegistry::with_builtin())
            .with_tokens(vec![TOKEN.to_string()])
            .build();
        let hub = Hub::new(
            HubConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                ..config
            },
            Arc::clone(&runtime),
            CancellationToken::new(),
        );
        let addr = hub.start().await.unwrap();
        (hub, runtime, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        client
    }

    async fn send(client: &mut Client, value: Value) {
        client.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    /// 下一条文本帧；连接关闭时返回 None
    async fn recv(client: &mut Client) -> Option<GatewayMessage> {
        let next = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(frame) = client.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => return GatewayMessage::parse(&text).ok(),
                    Ok(WsMessage::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        });
        next.await.expect("timed out waiting for a frame")
    }

    async fn wait_for_sessions(runtime: &Arc<DispatchRuntime>, expected: usize) {
        for _ in 0..100 {
            if runtime.sessions().active_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runtime.sessions().active_count().await, expected);
    }

    /// 会话从表中摘除后，拆除还要等请求任务退出并归还槽位
    async fn wait_for_release(runtime: &Arc<DispatchRuntime>, session_id: Option<&str>) {
        for _ in 0..100 {
            let released = runtime.ledger().global_stats().held == 0
                && runtime.inflight().running_count() == 0
                && session_id.map_or(true, |sid| runtime.ledger().session_stats(sid).is_none());
            if released {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("resources not released: {:?}", runtime.ledger().snapshot());
    }

    #[tokio::test]
    async fn test_invalid_token_closes_without_state() {
        let (hub, runtime, addr) = start_hub(HubConfig::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"op": "hello", "token": "wrong"})).await;
        match recv(&mut client).await {
            Some(GatewayMessage::Error { kind, request_id, .. }) => {
                assert_eq!(kind, "authentication_error");
                assert!(request_id.is_none());
            }
            other => panic!("Expected authentication error, got {:?}", other),
        }
        assert!(recv(&mut client).await.is_none());

        assert_eq!(runtime.sessions().active_count().await, 0);
        let snapshot = runtime.ledger().snapshot();
        assert!(snapshot.sessions.is_empty());
        assert_eq!(snapshot.global.held, 0);
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_first_frame_must_be_hello() {
        let (hub, runtime, addr) = start_hub(HubConfig::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"op": "ping", "timestamp": 1})).await;
        match recv(&mut client).await {
            Some(GatewayMessage::Error { kind, .. }) => assert_eq!(kind, "protocol_error"),
            other => panic!("Expected protocol error, got {:?}", other),
        }
        assert!(recv(&mut client).await.is_none());
        assert_eq!(runtime.sessions().active_count().await, 0);
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_call_tool_round_trip() {
        let (hub, runtime, addr) = start_hub(HubConfig::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"op": "hello", "token": TOKEN})).await;
        let session_id = match recv(&mut client).await {
            Some(GatewayMessage::HelloAck { session_id }) => session_id,
            other => panic!("Expected hello_ack, got {:?}", other),
        };
        assert!(runtime.sessions().is_live(&session_id).await);

        send(
            &mut client,
            json!({"op": "call_tool", "request_id": "r1", "name": "echo", "arguments": {"text": "ws"}}),
        )
        .await;
        assert_eq!(
            recv(&mut client).await,
            Some(GatewayMessage::CallToolAck {
                request_id: "r1".into()
            })
        );
        let result = loop {
            match recv(&mut client).await {
                Some(GatewayMessage::Progress { .. }) => continue,
                Some(msg) => break msg,
                None => panic!("connection closed before result"),
            }
        };
        match result {
            GatewayMessage::CallToolRes {
                request_id,
                result,
                provider,
                continuation_id,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(result["echo"]["text"], "ws");
                assert_eq!(provider, "alpha");
                assert!(continuation_id.is_some());
            }
            other => panic!("Expected call_tool_res, got {:?}", other),
        }

        send(&mut client, json!({"op": "ping", "timestamp": 42})).await;
        assert_eq!(recv(&mut client).await, Some(GatewayMessage::Pong { timestamp: 42 }));

        send(&mut client, json!({"op": "close"})).await;
        assert!(recv(&mut client).await.is_none());
        wait_for_sessions(&runtime, 0).await;
        wait_for_release(&runtime, Some(&session_id)).await;
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_tears_down_session() {
        let (hub, runtime, addr) = start_hub(HubConfig::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"op": "hello", "token": TOKEN})).await;
        assert!(matches!(recv(&mut client).await, Some(GatewayMessage::HelloAck { .. })));
        wait_for_sessions(&runtime, 1).await;

        client.send(WsMessage::Text("{not json".to_string())).await.unwrap();
        match recv(&mut client).await {
            Some(GatewayMessage::Error { kind, .. }) => assert_eq!(kind, "protocol_error"),
            other => panic!("Expected protocol error, got {:?}", other),
        }
        assert!(recv(&mut client).await.is_none());
        wait_for_sessions(&runtime, 0).await;
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_cancels_inflight_call() {
        let (hub, runtime, addr) = start_hub(HubConfig::default()).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"op": "hello", "token": TOKEN})).await;
        assert!(matches!(recv(&mut client).await, Some(GatewayMessage::HelloAck { .. })));
        send(
            &mut client,
            json!({"op": "call_tool", "request_id": "slow", "name": "sleep", "arguments": {"millis": 10000}}),
        )
        .await;
        assert!(matches!(recv(&mut client).await, Some(GatewayMessage::CallToolAck { .. })));
        drop(client);

        wait_for_sessions(&runtime, 0).await;
        wait_for_release(&runtime, None).await;
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_connection_limit_refuses_excess() {
        let (hub, _runtime, addr) = start_hub(HubConfig {
            max_connections: 1,
            ..HubConfig::default()
        })
        .await;
        let mut first = connect(addr).await;
        send(&mut first, json!({"op": "hello", "token": TOKEN})).await;
        assert!(matches!(recv(&mut first).await, Some(GatewayMessage::HelloAck { .. })));

        let mut second = connect(addr).await;
        match recv(&mut second).await {
            Some(GatewayMessage::Error { kind, .. }) => assert_eq!(kind, "protocol_error"),
            other => panic!("Expected refusal, got {:?}", other),
        }
        assert_eq!(hub.connection_count(), 1);
        hub.stop().await;
    }
}
