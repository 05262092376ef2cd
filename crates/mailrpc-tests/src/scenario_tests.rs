//! End-to-end call scenarios over loopback TCP: replies, handler failures,
//! timeouts, out-of-order completion and connection lifecycle.

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use mailrpc_transport::{
        ClientConfig, ClientConnection, ConnectionEvent, ConnectionState, RpcMessage, ServerConfig,
        TraceContext, TransportConfig, TransportError, Value, WireFormat,
    };
    use tempfile::NamedTempFile;

    use crate::harness::{descriptor, init_tracing, start_chat_server};

    fn chat(method: &str, args: Vec<Value>) -> RpcMessage {
        RpcMessage::new("area", "chat", method, args)
    }

    fn echo(args: Vec<Value>) -> RpcMessage {
        RpcMessage::new("connector", "entry", "echo", args)
    }

    async fn connected(addr: std::net::SocketAddr, config: ClientConfig) -> ClientConnection {
        let client = ClientConnection::new(descriptor(addr), config);
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_call_returns_reply() {
        init_tracing();
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.service_index().is_some());

        let reply = client
            .call(chat("send", vec![Value::from("hello")]), None)
            .await
            .unwrap();
        assert_eq!(reply.args, vec![Value::Null, Value::from("ok")]);
        assert_eq!(client.pending_count(), 0);

        let values = client.invoke(chat("send", vec![])).await.unwrap();
        assert_eq!(values, vec![Value::from("ok")]);

        let snapshot = client.metrics().snapshot();
        assert_eq!(snapshot.calls_sent, 2);
        assert_eq!(snapshot.replies_received, 2);
        client.close();
        server.close();
    }

    #[tokio::test]
    async fn test_handler_error_reaches_caller() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;

        let err = client.invoke(chat("kick", vec![])).await.unwrap_err();
        match err {
            TransportError::Handler(e) => {
                assert_eq!(e.message, "not allowed");
                assert_eq!(e.stack, "at area.chat.kick");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        server.close();
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error_reply() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;

        let err = client.invoke(chat("crash", vec![])).await.unwrap_err();
        assert!(matches!(err, TransportError::Handler(ref e) if e.message == "handler panicked"));

        // the connection keeps serving after a panic
        let values = client.invoke(chat("send", vec![])).await.unwrap();
        assert_eq!(values, vec![Value::from("ok")]);
        server.close();
    }

    #[tokio::test]
    async fn test_dropped_continuation_replies_with_error() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;

        let err = client.invoke(chat("drop", vec![])).await.unwrap_err();
        assert!(
            matches!(err, TransportError::Handler(ref e) if e.message == "handler finished without replying")
        );
        server.close();
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_ignored() {
        let (server, addr, handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let config = ClientConfig {
            request_timeout_ms: 50,
            ..ClientConfig::default()
        };
        let client = connected(addr, config).await;

        let err = client.call(chat("stall", vec![]), None).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.metrics().snapshot().timeouts_total, 1);

        assert_eq!(handler.release_stalled(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.state(), ConnectionState::Connected);

        let values = client.invoke(chat("send", vec![])).await.unwrap();
        assert_eq!(values, vec![Value::from("ok")]);
        server.close();
    }

    #[tokio::test]
    async fn test_replies_complete_out_of_order() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;

        let slow = client.send(echo(vec![Value::from(150)]), None).unwrap();
        let fast = client.send(echo(vec![Value::from(0)]), None).unwrap();
        assert_eq!(client.pending_count(), 2);

        let (slow_id, fast_id) = (slow.id(), fast.id());
        assert_ne!(slow_id, fast_id);

        let fast_reply = fast.await.unwrap();
        assert_eq!(fast_reply.id, fast_id);
        assert_eq!(client.pending_count(), 1);
        assert_eq!(fast_reply.args, vec![Value::Null, Value::from(0)]);

        let slow_reply = slow.await.unwrap();
        assert_eq!(slow_reply.id, slow_id);
        assert_eq!(slow_reply.args, vec![Value::Null, Value::from(150)]);
        assert_eq!(client.pending_count(), 0);
        server.close();
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (server, addr, handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;
        let mut events = client.subscribe();

        let handles: Vec<_> = (0..3)
            .map(|_| client.send(chat("stall", vec![]), None).unwrap())
            .collect();
        while handler.stalled_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(client.close(), 3);
        for handle in handles {
            assert!(handle.await.unwrap_err().is_disconnect());
        }
        assert_eq!(client.pending_count(), 0);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Closed {
                server_id: "chat-server-1".to_string()
            }
        );
        handler.release_stalled();
        server.close();
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = ClientConnection::new(descriptor(addr), ClientConfig::default());

        assert!(matches!(
            client.send(chat("send", vec![]), None),
            Err(TransportError::NotConnected)
        ));
        client.connect().await.unwrap();
        assert!(matches!(client.connect().await, Err(TransportError::AlreadyConnected)));

        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.connect().await, Err(TransportError::AlreadyClosed)));
        assert!(matches!(
            client.send(chat("send", vec![]), None),
            Err(TransportError::AlreadyClosed)
        ));
        server.close();
    }

    #[tokio::test]
    async fn test_server_close_reports_peer_closed() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;
        let mut events = client.subscribe();

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connection_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        server.close();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ConnectionEvent::PeerClosed {
                server_id: "chat-server-1".to_string()
            }
        );
        // the client stays open until closed explicitly
        assert_eq!(client.state(), ConnectionState::Connected);
        client.close();
    }

    #[tokio::test]
    async fn test_json_format_propagates_trace() {
        let json_server = ServerConfig {
            format: WireFormat::Json,
            ..ServerConfig::default()
        };
        let (server, addr, _handler) = start_chat_server(json_server).await.unwrap();
        let config = ClientConfig {
            format: WireFormat::Json,
            tracing: true,
            node_id: Some("client-node".to_string()),
            ..ClientConfig::default()
        };
        let client = connected(addr, config).await;
        assert!(client.service_index().is_none());

        let ctx = TraceContext::new(Some("client-node".to_string()), Some("chat-server-1".to_string()));
        let trace_id = ctx.trace_id();
        let reply = client
            .call(RpcMessage::new("connector", "entry", "trace", vec![]), Some(ctx))
            .await
            .unwrap();
        assert_eq!(reply.args, vec![Value::Null, Value::from(trace_id.to_string())]);
        let returned = reply.trace.expect("reply carries the call trace");
        assert_eq!(returned.trace_id(), trace_id);

        // an implicit trace is created when tracing is enabled
        let reply = client
            .call(RpcMessage::new("connector", "entry", "trace", vec![]), None)
            .await
            .unwrap();
        assert!(!reply.args[1].is_null());
        server.close();
    }

    #[tokio::test]
    async fn test_binary_format_carries_no_trace() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;

        let values = client
            .invoke(RpcMessage::new("connector", "entry", "trace", vec![]))
            .await
            .unwrap();
        assert_eq!(values, vec![Value::Null]);
        server.close();
    }

    #[tokio::test]
    async fn test_client_from_config_file() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[client]
request_timeout_ms = 2000
max_pending = 4
"#
        )
        .unwrap();
        let config = TransportConfig::from_file(file.path()).unwrap();
        config.validate().unwrap();

        let client = connected(addr, config.client).await;
        let values = client.invoke(chat("send", vec![])).await.unwrap();
        assert_eq!(values, vec![Value::from("ok")]);
        server.close();
    }

    #[tokio::test]
    async fn test_max_pending_rejects_extra_calls() {
        let (server, addr, handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let config = ClientConfig {
            max_pending: 2,
            ..ClientConfig::default()
        };
        let client = connected(addr, config).await;

        let _a = client.send(chat("stall", vec![]), None).unwrap();
        let _b = client.send(chat("stall", vec![]), None).unwrap();
        let err = client.send(chat("stall", vec![]), None).unwrap_err();
        assert!(matches!(err, TransportError::TooManyPending(2)));

        client.close();
        handler.release_stalled();
        server.close();
    }

    #[tokio::test]
    async fn test_unknown_method_rejected_before_sending() {
        let (server, addr, _handler) = start_chat_server(ServerConfig::default()).await.unwrap();
        let client = connected(addr, ClientConfig::default()).await;

        let err = client
            .send(RpcMessage::new("area", "chat", "nope", vec![]), None)
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert_eq!(client.pending_count(), 0);
        server.close();
    }
}
