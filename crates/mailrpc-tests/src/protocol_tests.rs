//! Frame-level protocol tests: a raw peer drives one side by hand and checks
//! the exact frames the other side produces.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use mailrpc_transport::value::{TAG_LIST, TAG_NULL};
    use mailrpc_transport::{
        encode_frame, BinaryCodec, ClientConfig, ClientConnection, ConnectionEvent, EnvelopeCodec,
        Frame, FrameKind, ListenerEvent, MethodPath, ServerConfig, ServiceIndex, TransportError,
        Value, WireFormat, WireWriter, DEFAULT_MAX_FRAME_LENGTH, MAX_NESTING_DEPTH,
    };
    use tokio::net::TcpListener;

    use crate::harness::{chat_index, descriptor, init_tracing, start_server, ChatHandler, RawPeer};

    const WAIT: Duration = Duration::from_secs(2);

    fn send_only_index() -> ServiceIndex {
        ServiceIndex::from_methods(&[MethodPath::new("area", "chat", "send")]).unwrap()
    }

    /// `[u32 id][u16 0][u16 0][u16 0][list ["hi"]]`
    fn raw_send_call(id: u32) -> Frame {
        let mut out = WireWriter::new();
        out.write_u32(id);
        out.write_u16(0);
        out.write_u16(0);
        out.write_u16(0);
        out.write_value(&Value::List(vec![Value::from("hi")]));
        Frame::new(FrameKind::Message, out.into_bytes())
    }

    /// A `(0,0,0)` call whose only argument is `levels` lists nested in each other.
    fn nested_call(levels: usize) -> Frame {
        let mut out = WireWriter::with_capacity(10 + levels * 6 + 2);
        out.write_u32(1);
        out.write_u16(0);
        out.write_u16(0);
        out.write_u16(0);
        for _ in 0..levels {
            out.write_u16(TAG_LIST);
            out.write_u32(1);
        }
        out.write_u16(TAG_NULL);
        Frame::new(FrameKind::Message, out.into_bytes())
    }

    /// Connects a raw peer and completes the Connect/Handshake exchange.
    async fn handshaken_peer(addr: SocketAddr) -> RawPeer {
        let mut peer = RawPeer::connect(addr).await.unwrap();
        peer.send(&Frame::control(FrameKind::Connect)).await.unwrap();
        assert_eq!(peer.recv(WAIT).await.unwrap().kind, FrameKind::Handshake);
        peer
    }

    async fn assert_send_answered(peer: &mut RawPeer, id: u32) {
        peer.send(&raw_send_call(id)).await.unwrap();
        let reply = peer.recv(WAIT).await.unwrap();
        let reply = BinaryCodec::default().decode_reply(&reply.body).unwrap();
        assert_eq!(reply.id, id);
        assert_eq!(reply.resp, vec![Value::Null, Value::from("ok")]);
    }

    #[tokio::test]
    async fn test_handshake_then_indexed_call() {
        init_tracing();
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut peer = RawPeer::connect(addr).await.unwrap();

        peer.send(&Frame::control(FrameKind::Connect)).await.unwrap();
        let handshake = peer.recv(WAIT).await.unwrap();
        assert_eq!(handshake.kind, FrameKind::Handshake);
        let json: serde_json::Value = serde_json::from_slice(&handshake.body).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"area": 0}, {"chat": 0}, {"send": 0},
                {"0": "area"}, {"0": "chat"}, {"0": "send"}
            ])
        );
        let index = ServiceIndex::from_handshake(&handshake.body).unwrap();
        assert_eq!(index, send_only_index());

        peer.send(&raw_send_call(42)).await.unwrap();
        let reply = peer.recv(WAIT).await.unwrap();
        assert_eq!(reply.kind, FrameKind::Message);

        let mut expected = WireWriter::new();
        expected.write_u32(42);
        expected.write_value(&Value::List(vec![Value::Null, Value::from("ok")]));
        assert_eq!(reply.body.as_ref(), expected.as_slice());

        let decoded = BinaryCodec::default().decode_reply(&reply.body).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.resp, vec![Value::Null, Value::from("ok")]);
        server.close();
    }

    #[tokio::test]
    async fn test_call_before_connect_closes_connection() {
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut events = server.subscribe();
        let mut peer = RawPeer::connect(addr).await.unwrap();

        peer.send(&raw_send_call(1)).await.unwrap();
        assert!(peer.closed_within(WAIT).await);

        let mut saw_error = false;
        while let Ok(Ok(event)) = tokio::time::timeout(WAIT, events.recv()).await {
            match event {
                ListenerEvent::Error { id: Some(_), message } => {
                    assert!(message.contains("handshake"));
                    saw_error = true;
                }
                ListenerEvent::Disconnected { .. } => break,
                _ => {}
            }
        }
        assert!(saw_error);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.metrics().snapshot().protocol_errors, 1);
        server.close();
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let config = ServerConfig {
            max_frame_length: 1024,
            ..ServerConfig::default()
        };
        let (server, addr) = start_server(config, send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut peer = RawPeer::connect(addr).await.unwrap();

        let mut header = 4096u32.to_le_bytes().to_vec();
        header.push(FrameKind::Message as u8);
        peer.send_raw(&header).await.unwrap();
        assert!(peer.closed_within(WAIT).await);
        server.close();
    }

    #[tokio::test]
    async fn test_unknown_frame_kind_closes_connection() {
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut peer = RawPeer::connect(addr).await.unwrap();
        peer.send_raw(&[1, 0, 0, 0, 0x7f]).await.unwrap();
        assert!(peer.closed_within(WAIT).await);
        server.close();
    }

    #[tokio::test]
    async fn test_deeply_nested_call_closes_only_that_connection() {
        init_tracing();
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut events = server.subscribe();
        let mut bystander = handshaken_peer(addr).await;
        let mut attacker = handshaken_peer(addr).await;

        let frame = nested_call(500_000);
        assert_eq!(frame.body.len(), 3_000_012);
        attacker.send(&frame).await.unwrap();
        assert!(attacker.closed_within(WAIT).await);

        let mut message = None;
        while let Ok(Ok(event)) = tokio::time::timeout(WAIT, events.recv()).await {
            if let ListenerEvent::Error { id: Some(_), message: m } = event {
                message = Some(m);
                break;
            }
        }
        let message = message.unwrap();
        assert!(message.contains(&MAX_NESTING_DEPTH.to_string()), "{message}");

        assert_send_answered(&mut bystander, 2).await;
        let mut newcomer = handshaken_peer(addr).await;
        assert_send_answered(&mut newcomer, 3).await;
        assert_eq!(server.metrics().snapshot().protocol_errors, 1);
        server.close();
    }

    #[tokio::test]
    async fn test_nesting_at_limit_is_accepted() {
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut peer = handshaken_peer(addr).await;

        // the argument list itself is the outermost level
        peer.send(&nested_call(MAX_NESTING_DEPTH)).await.unwrap();
        let reply = peer.recv(WAIT).await.unwrap();
        let reply = BinaryCodec::default().decode_reply(&reply.body).unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(reply.resp, vec![Value::Null, Value::from("ok")]);
        server.close();
    }

    #[tokio::test]
    async fn test_protocol_error_leaves_other_connection_working() {
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut healthy = handshaken_peer(addr).await;
        let mut broken = handshaken_peer(addr).await;
        assert_send_answered(&mut healthy, 10).await;

        broken.send_raw(&[1, 0, 0, 0, 0x7f]).await.unwrap();
        assert!(broken.closed_within(WAIT).await);

        assert_send_answered(&mut healthy, 11).await;
        assert_eq!(server.connection_count(), 1);
        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.protocol_errors, 1);
        assert_eq!(snapshot.active_connections, 1);
        server.close();
    }

    #[tokio::test]
    async fn test_frames_ahead_of_bad_frame_are_served() {
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut peer = RawPeer::connect(addr).await.unwrap();

        let mut wire = encode_frame(&Frame::control(FrameKind::Ping), DEFAULT_MAX_FRAME_LENGTH)
            .unwrap()
            .to_vec();
        wire.extend_from_slice(&[1, 0, 0, 0, 0x7f]);
        peer.send_raw(&wire).await.unwrap();

        assert_eq!(peer.recv(WAIT).await, Some(Frame::control(FrameKind::Pong)));
        assert!(peer.closed_within(WAIT).await);
        assert_eq!(server.metrics().snapshot().protocol_errors, 1);
        server.close();
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut peer = RawPeer::connect(addr).await.unwrap();

        peer.send(&Frame::control(FrameKind::Ping)).await.unwrap();
        let pong = peer.recv(WAIT).await.unwrap();
        assert_eq!(pong, Frame::control(FrameKind::Pong));
        server.close();
    }

    #[tokio::test]
    async fn test_inbound_batch_dispatches_each_call() {
        let (server, addr) = start_server(ServerConfig::default(), send_only_index(), ChatHandler::new())
            .await
            .unwrap();
        let mut peer = RawPeer::connect(addr).await.unwrap();
        peer.send(&Frame::control(FrameKind::Connect)).await.unwrap();
        assert_eq!(peer.recv(WAIT).await.unwrap().kind, FrameKind::Handshake);

        let codec = BinaryCodec::default();
        let items = vec![raw_send_call(5).body, raw_send_call(6).body];
        peer.send(&Frame::new(FrameKind::Batch, codec.encode_batch(&items)))
            .await
            .unwrap();

        let first = codec.decode_reply(&peer.recv(WAIT).await.unwrap().body).unwrap();
        let second = codec.decode_reply(&peer.recv(WAIT).await.unwrap().body).unwrap();
        assert_eq!((first.id, second.id), (5, 6));
        server.close();
    }

    #[tokio::test]
    async fn test_json_server_skips_handshake() {
        let config = ServerConfig {
            format: WireFormat::Json,
            ..ServerConfig::default()
        };
        let (server, addr) = start_server(config, chat_index(), ChatHandler::new()).await.unwrap();
        let mut peer = RawPeer::connect(addr).await.unwrap();

        let call = br#"{"id":3,"msg":{"namespace":"area","service":"chat","method":"send","args":[]}}"#;
        peer.send(&Frame::new(FrameKind::Message, call.to_vec())).await.unwrap();
        let reply = peer.recv(WAIT).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(json, serde_json::json!({"id": 3, "resp": [null, "ok"]}));
        server.close();
    }

    #[tokio::test]
    async fn test_client_rejects_ping_from_server() {
        let fake = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = fake.local_addr().unwrap();
        let client = ClientConnection::new(descriptor(addr), ClientConfig::default());
        let mut events = client.subscribe();

        let server_side = async {
            let (stream, _) = fake.accept().await.unwrap();
            let mut peer = RawPeer::from_stream(stream);
            assert_eq!(peer.recv(WAIT).await.unwrap().kind, FrameKind::Connect);
            let handshake = chat_index().to_handshake().unwrap();
            peer.send(&Frame::new(FrameKind::Handshake, handshake)).await.unwrap();
            peer
        };
        let (connected, mut peer) = tokio::join!(client.connect(), server_side);
        connected.unwrap();
        assert_eq!(client.service_index().as_deref(), Some(&chat_index()));

        peer.send(&Frame::control(FrameKind::Ping)).await.unwrap();
        let first = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(first, ConnectionEvent::Error { .. }));
        let second = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(second, ConnectionEvent::Closed { .. }));
        assert!(peer.closed_within(WAIT).await);
        assert_eq!(client.metrics().snapshot().protocol_errors, 1);
    }

    #[tokio::test]
    async fn test_connect_times_out_without_handshake() {
        let fake = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = fake.local_addr().unwrap();
        let config = ClientConfig {
            connect_timeout_ms: 100,
            ..ClientConfig::default()
        };
        let client = ClientConnection::new(descriptor(addr), config);

        let silent = async {
            let (stream, _) = fake.accept().await.unwrap();
            let mut peer = RawPeer::from_stream(stream);
            let connect = peer.recv(WAIT).await;
            (peer, connect)
        };
        let (result, (_peer, connect)) = tokio::join!(client.connect(), silent);
        assert_eq!(connect.map(|f| f.kind), Some(FrameKind::Connect));
        assert!(matches!(result, Err(TransportError::ConnectTimeout { .. })));
    }
}
