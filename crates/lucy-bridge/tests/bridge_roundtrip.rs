//! End-to-end against a minimal rosbridge server on localhost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lucy_bridge::{BridgeConfig, BridgeContext, BridgeError, ConnectionStatus, JointControlState};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Accepts one client. Streams a camera frame on subscribe, answers the two
/// services, and forwards every `publish` it receives.
async fn fake_rosbridge() -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (published_tx, published_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        let (mut tx, mut rx) = ws.split();
        while let Some(Ok(Message::Text(text))) = rx.next().await {
            let op: Value = serde_json::from_str(text.as_str()).unwrap();
            let reply = match op["op"].as_str() {
                Some("publish") => {
                    let _ = published_tx.send(op.clone());
                    None
                }
                Some("subscribe") if op["topic"] == "/camera/mobius/jpg" => Some(json!({
                    "op": "publish",
                    "topic": "/camera/mobius/jpg",
                    "msg": {
                        "header": { "stamp": { "sec": 1, "nanosec": 0 } },
                        "format": "jpeg",
                        "data": "/9j/4A==",
                    }
                })),
                Some("call_service") if op["service"] == "/camera/mobius/enable" => Some(json!({
                    "op": "service_response",
                    "id": op["id"],
                    "service": op["service"],
                    "values": { "success": true, "message": "" },
                    "result": true,
                })),
                Some("call_service") if op["service"] == "/get_client_count" => Some(json!({
                    "op": "service_response",
                    "id": op["id"],
                    "service": op["service"],
                    "values": { "value": 1 },
                    "result": true,
                })),
                _ => None,
            };
            if let Some(reply) = reply {
                tx.send(Message::Text(reply.to_string().into())).await.unwrap();
            }
        }
    });

    (url, published_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_publish_stream_call_disconnect() {
    let (url, mut published) = fake_rosbridge().await;
    let ctx = BridgeContext::with_websocket(BridgeConfig::default());

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let _status = {
        let statuses = Arc::clone(&statuses);
        ctx.manager()
            .on_status_change(move |s| statuses.lock().unwrap().push(s))
    };
    let (frame_tx, mut frames) = mpsc::unbounded_channel();
    ctx.camera().subscribe_to_camera(move |frame| {
        let _ = frame_tx.send(frame.clone());
    });

    ctx.manager().connect(&url).await.unwrap();
    assert_eq!(ctx.manager().status(), ConnectionStatus::Connected);

    let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.data, vec![0xff, 0xd8, 0xff, 0xe0]);
    assert_eq!(frame.metrics.frame_delay_ms, 0.0);

    let mut joint = JointControlState::revolute("j1", "Right Arm", 0.0, 2.617994);
    joint.set_value(1.5708);
    ctx.joint_states().publish_joint_states(&[joint.clone()]);
    let op = tokio::time::timeout(Duration::from_secs(5), published.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op["topic"], "/joint_states");
    assert!((op["msg"]["position"][0].as_f64().unwrap() - 90.0).abs() < 0.01);

    assert_eq!(ctx.enable_camera().enable_camera(true).await, Ok(true));
    assert_eq!(ctx.client_count().fetch().await, Ok(Some(1)));

    ctx.manager().disconnect();
    assert_eq!(ctx.manager().status(), ConnectionStatus::Disconnected);
    ctx.joint_states().publish_joint_states(&[joint]);
    assert_eq!(
        ctx.client_count().fetch().await,
        Err(BridgeError::NotConnected)
    );

    assert_eq!(
        *statuses.lock().unwrap(),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected
        ]
    );
}

#[tokio::test]
async fn unreachable_bridge_fails_and_returns_to_disconnected() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let ctx = BridgeContext::with_websocket(BridgeConfig::default());
    let err = ctx.manager().connect(&url).await.unwrap_err();

    assert!(matches!(err, BridgeError::ConnectFailed(_)));
    assert_eq!(ctx.manager().status(), ConnectionStatus::Disconnected);
}
