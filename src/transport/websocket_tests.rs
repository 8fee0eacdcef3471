use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::Utf8Bytes;
use tungstenite::error::ProtocolError;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::broker::{Connection, ConnectionState, Registry, Topic};
use crate::client::{BackoffPolicy, Publisher, ReconnectingClient};
use crate::config::ServerSettings;
use crate::transport::message::{Envelope, decode};
use crate::transport::websocket::{Closure, RelayServer, ServerState, admit};
use crate::utils::RelayError;

type TestSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) async fn start_relay(echo_to_sender: bool) -> (Arc<RelayServer>, JoinHandle<()>) {
    let settings = ServerSettings {
        host: "127.0.0.1".to_string(),
        port: 0,
        echo_to_sender,
        shutdown_grace_ms: 500,
    };
    let server = Arc::new(
        RelayServer::bind(settings, Arc::new(Registry::new()))
            .await
            .expect("bind relay"),
    );
    let handle = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });
    (server, handle)
}

pub(crate) fn topic_url(server: &RelayServer, path: &str) -> String {
    format!("ws://{}{}", server.local_addr(), path)
}

/// Poll until `topic` has exactly `count` connections registered.
pub(crate) async fn wait_for_subscribers(server: &RelayServer, topic: &str, count: usize) {
    let topic = Topic::from_path(topic);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.registry().subscriber_count(&topic) != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "topic {topic} never reached {count} subscribers (has {})",
            server.registry().subscriber_count(&topic)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn subscribe(server: &RelayServer, path: &str) -> TestSocket {
    let (ws, _) = connect_async(topic_url(server, path))
        .await
        .expect("WebSocket handshake failed");
    ws
}

async fn next_envelope(ws: &mut TestSocket) -> Envelope {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Did not receive message in time")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        WsMessage::Text(text) => decode(text.as_bytes()).expect("valid envelope"),
        other => panic!("Expected a text message, got {other:?}"),
    }
}

fn channel_connection(
    topic: &str,
) -> (Arc<Connection>, futures::channel::mpsc::UnboundedReceiver<WsMessage>) {
    let (tx, rx) = futures::channel::mpsc::unbounded::<WsMessage>();
    let sink = tx.sink_map_err(|e| {
        tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
    });
    (Arc::new(Connection::new(Topic::from_path(topic), sink)), rx)
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(code),
        reason: Utf8Bytes::from_static(reason),
    }
}

async fn assert_silent(ws: &mut TestSocket) {
    let res = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(res.is_err(), "Expected no message, got {res:?}");
}

#[tokio::test]
async fn test_publish_reaches_only_same_topic() {
    let (server, _handle) = start_relay(false).await;

    let mut a = subscribe(&server, "/1.0/").await;
    let mut b = subscribe(&server, "/1.0/").await;
    let mut c = subscribe(&server, "/2.0/").await;

    let mut publisher = ReconnectingClient::new(
        url::Url::parse(&topic_url(&server, "/1.0/")).unwrap(),
        BackoffPolicy::default(),
    );
    publisher.connect().await.expect("publisher connect");

    wait_for_subscribers(&server, "1.0", 3).await;
    wait_for_subscribers(&server, "2.0", 1).await;

    let envelope = Envelope::new("new_arduino_data", json!({ "id": 42 }));
    publisher.send(&envelope).await.expect("send");

    assert_eq!(next_envelope(&mut a).await, envelope);
    assert_eq!(next_envelope(&mut b).await, envelope);
    assert_silent(&mut c).await;

    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_sender_is_excluded_unless_echo_enabled() {
    let (server, _handle) = start_relay(false).await;
    let mut sender = subscribe(&server, "/1.0/").await;
    let mut other = subscribe(&server, "/1.0/").await;
    wait_for_subscribers(&server, "1.0", 2).await;

    let text = r#"{"type":"new_arduino_data","data":{"id":1}}"#;
    sender.send(WsMessage::text(text)).await.unwrap();
    assert_eq!(next_envelope(&mut other).await.data(), &json!({ "id": 1 }));
    assert_silent(&mut sender).await;

    let (echo_server, _echo_handle) = start_relay(true).await;
    let mut sender = subscribe(&echo_server, "/1.0/").await;
    wait_for_subscribers(&echo_server, "1.0", 1).await;
    sender.send(WsMessage::text(text)).await.unwrap();
    assert_eq!(next_envelope(&mut sender).await.data(), &json!({ "id": 1 }));
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (server, _handle) = start_relay(false).await;
    let mut a = subscribe(&server, "/1.0/").await;
    let mut b = subscribe(&server, "/1.0/").await;
    wait_for_subscribers(&server, "1.0", 2).await;

    a.send(WsMessage::text("this is not json")).await.unwrap();
    a.send(WsMessage::text(r#"{"type":"existing_arduino_data","data":{"id":3}}"#))
        .await
        .unwrap();

    let received = next_envelope(&mut b).await;
    assert_eq!(received.event_type(), "existing_arduino_data");
    assert_eq!(server.registry().subscriber_count(&Topic::from_path("1.0")), 2);
}

#[tokio::test]
async fn test_disconnect_removes_connection_and_topic() {
    let (server, _handle) = start_relay(false).await;
    let mut a = subscribe(&server, "/1.0/").await;
    let b = subscribe(&server, "/2.0/").await;
    wait_for_subscribers(&server, "1.0", 1).await;
    wait_for_subscribers(&server, "2.0", 1).await;

    a.close(None).await.unwrap();
    // abnormal: drop without a closing handshake
    drop(b);

    wait_for_subscribers(&server, "1.0", 0).await;
    wait_for_subscribers(&server, "2.0", 0).await;
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_connections_with_normal_code() {
    let (server, handle) = start_relay(false).await;
    let mut a = subscribe(&server, "/1.0/").await;
    let mut b = subscribe(&server, "/2.0/").await;
    wait_for_subscribers(&server, "1.0", 1).await;
    wait_for_subscribers(&server, "2.0", 1).await;

    server.shutdown().await;

    for ws in [&mut a, &mut b] {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no close frame in time");
        match msg {
            Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("Expected close frame, got {other:?}"),
        }
    }
    assert!(server.registry().is_empty());
    assert_eq!(server.state(), ServerState::Stopped);

    // second call is a no-op
    server.shutdown().await;

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("accept loop did not stop")
        .unwrap();
    assert!(connect_async(topic_url(&server, "/1.0/")).await.is_err());
}

#[tokio::test]
async fn test_publisher_delivers_in_background() {
    let (server, _handle) = start_relay(false).await;
    let mut subscriber = subscribe(&server, "/1.0/").await;
    wait_for_subscribers(&server, "1.0", 1).await;

    let base = format!("ws://{}", server.local_addr());
    let publisher = Publisher::new(&base, BackoffPolicy::default()).unwrap();
    assert_eq!(
        publisher.endpoint(&Topic::from_path("1.0")).unwrap().as_str(),
        format!("{base}/1.0/")
    );

    publisher
        .publish("1.0", "new_arduino_data", json!({ "id": 42 }))
        .await
        .unwrap();

    let received = next_envelope(&mut subscriber).await;
    assert_eq!(
        received,
        Envelope::new("new_arduino_data", json!({ "id": 42 }))
    );
}

#[tokio::test]
async fn test_publisher_failure_is_contained() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let publisher = Publisher::new(&format!("ws://{addr}"), BackoffPolicy::default()).unwrap();
    // the task logs the failure and completes normally
    publisher
        .publish("1.0", "new_arduino_data", json!({ "id": 1 }))
        .await
        .unwrap();
}

#[test]
fn test_closure_classification() {
    assert_eq!(Closure::from_frame(None), Closure::Normal);
    assert_eq!(Closure::from_frame(Some(&close_frame(1000, "bye"))), Closure::Normal);
    assert_eq!(Closure::from_frame(Some(&close_frame(1006, ""))), Closure::Abnormal);
    let app = Closure::from_frame(Some(&close_frame(4001, "sensor fault")));
    assert_eq!(
        app,
        Closure::Application {
            code: 4001,
            reason: "sensor fault".to_string()
        }
    );
    assert_eq!(app.code(), 4001);

    assert_eq!(
        Closure::from_error(&tungstenite::Error::ConnectionClosed),
        Closure::Normal
    );
    assert_eq!(
        Closure::from_error(&tungstenite::Error::Protocol(
            ProtocolError::ResetWithoutClosingHandshake
        )),
        Closure::Abnormal
    );
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
    assert_eq!(
        Closure::from_error(&tungstenite::Error::Io(io)),
        Closure::Abnormal
    );
    let protocol =
        Closure::from_error(&tungstenite::Error::Protocol(ProtocolError::NonZeroReservedBits));
    assert!(matches!(protocol, Closure::Protocol(_)));
    assert_eq!(protocol.code(), 1002);
}

#[test]
fn test_closure_errors() {
    assert!(Closure::Normal.to_error().is_none());
    assert!(Closure::Shutdown.to_error().is_none());
    assert!(matches!(
        Closure::Abnormal.to_error(),
        Some(RelayError::ConnectionClosed { code: 1006, .. })
    ));

    let err = Closure::Application {
        code: 4001,
        reason: "sensor fault".to_string(),
    }
    .to_error()
    .unwrap();
    assert_eq!(err.as_label(), "connection_closed");
    assert_eq!(err.to_string(), "connection closed with code 4001: sensor fault");
}

#[tokio::test]
async fn test_peer_close_is_acknowledged() {
    let (server, _handle) = start_relay(false).await;
    let mut ws = subscribe(&server, "/1.0/").await;
    wait_for_subscribers(&server, "1.0", 1).await;

    ws.close(Some(close_frame(1000, "bye"))).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("no close reply in time");
    match reply {
        Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("Expected close reply, got {other:?}"),
    }
    wait_for_subscribers(&server, "1.0", 0).await;
}

#[tokio::test]
async fn test_application_close_code_removes_connection() {
    let (server, _handle) = start_relay(false).await;
    let mut a = subscribe(&server, "/1.0/").await;
    let _b = subscribe(&server, "/1.0/").await;
    wait_for_subscribers(&server, "1.0", 2).await;

    a.close(Some(close_frame(4001, "sensor fault"))).await.unwrap();

    wait_for_subscribers(&server, "1.0", 1).await;
    assert_eq!(server.registry().connection_count(), 1);
}

#[tokio::test]
async fn test_admit_refuses_while_draining() {
    let registry = Registry::new();
    let (connection, mut rx) = channel_connection("1.0");

    let (state, state_rx) = watch::channel(ServerState::Running);
    assert!(admit(&registry, &connection, &state_rx).await);
    assert!(registry.contains(&connection.topic, &connection.id));

    let (late, mut late_rx) = channel_connection("1.0");

    state.send_replace(ServerState::Draining);
    assert!(!admit(&registry, &late, &state_rx).await);
    assert!(!registry.contains(&late.topic, &late.id));
    assert_eq!(late.state(), ConnectionState::Closed);
    assert!(matches!(
        late_rx.try_recv(),
        Ok(WsMessage::Close(Some(frame))) if frame.code == CloseCode::Normal
    ));

    // the admitted connection is untouched
    assert!(rx.try_recv().is_err());
    assert!(connection.is_open());
}
