//! Peer session over real TCP: handshake, ordered relay, payload frames,
//! and the goodbye/transport close paths.

use bcp_bridge::config::ConnectionConfig;
use bcp_bridge::router::RouterMsg;
use bcp_bridge::session::{CloseReason, PeerSession, SessionHandle};
use bcp_protocol::Value;
use bcp_test_utils::MockPeer;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn conn_config(port: u16) -> ConnectionConfig {
    ConnectionConfig {
        name: "test_peer".to_owned(),
        host: "127.0.0.1".to_owned(),
        port,
        required: true,
        connect_timeout: Duration::from_secs(5),
    }
}

struct Harness {
    handle: SessionHandle,
    rx: mpsc::UnboundedReceiver<RouterMsg>,
    active: Arc<AtomicUsize>,
}

fn spawn_session(config: ConnectionConfig) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicUsize::new(0));
    let handle = PeerSession::spawn(config, tx, Arc::clone(&active));
    Harness { handle, rx, active }
}

impl Harness {
    async fn recv_msg(&mut self) -> RouterMsg {
        timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("no router message within timeout")
            .expect("router channel closed")
    }

    async fn expect_connected(&mut self) {
        match self.recv_msg().await {
            RouterMsg::SessionConnected { session } => assert_eq!(session, "test_peer"),
            _ => panic!("expected SessionConnected"),
        }
    }

    async fn expect_closed(&mut self, expected: CloseReason) {
        match self.recv_msg().await {
            RouterMsg::SessionClosed { reason, .. } => assert_eq!(reason, expected),
            _ => panic!("expected SessionClosed"),
        }
    }
}

#[tokio::test]
async fn session_opens_with_hello_and_reports_connected() {
    let peer = MockPeer::bind().await;
    let mut harness = spawn_session(conn_config(peer.port()));

    let mut conn = peer.accept().await;
    let (cmd, params) = conn.recv_command().await;
    assert_eq!(cmd, "hello");
    assert_eq!(
        params.get("version").and_then(Value::as_str),
        Some(bcp_protocol::BCP_VERSION)
    );
    assert!(params.contains_key("controller_name"));
    assert!(params.contains_key("controller_version"));

    harness.expect_connected().await;
    assert_eq!(harness.active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn outbound_lines_arrive_in_submission_order() {
    let peer = MockPeer::bind().await;
    let harness = spawn_session(conn_config(peer.port()));

    let mut conn = peer.accept().await;
    conn.recv_until("hello").await;

    harness.handle.send("player_score?value=int:100".to_owned());
    harness.handle.send("mode_start?name=base".to_owned());
    harness.handle.send("reset".to_owned());

    assert_eq!(conn.recv_frame().await.line, "player_score?value=int:100");
    assert_eq!(conn.recv_frame().await.line, "mode_start?name=base");
    assert_eq!(conn.recv_frame().await.line, "reset");
}

#[tokio::test]
async fn inbound_commands_surface_in_wire_order() {
    let peer = MockPeer::bind().await;
    let mut harness = spawn_session(conn_config(peer.port()));

    let mut conn = peer.accept().await;
    conn.recv_until("hello").await;
    harness.expect_connected().await;

    conn.send_line("trigger?name=first").await;
    conn.send_line("switch?name=s&state=int:1").await;

    match harness.recv_msg().await {
        RouterMsg::Inbound { command, params, .. } => {
            assert_eq!(command, "trigger");
            assert_eq!(params.get("name").and_then(Value::as_str), Some("first"));
        }
        _ => panic!("expected Inbound"),
    }
    match harness.recv_msg().await {
        RouterMsg::Inbound { command, params, .. } => {
            assert_eq!(command, "switch");
            assert_eq!(params.get("state"), Some(&Value::Int(1)));
        }
        _ => panic!("expected Inbound"),
    }
}

#[tokio::test]
async fn binary_payload_reaches_the_router() {
    let peer = MockPeer::bind().await;
    let mut harness = spawn_session(conn_config(peer.port()));

    let mut conn = peer.accept().await;
    conn.recv_until("hello").await;
    harness.expect_connected().await;

    conn.send_bytes(b"dmd_frame?&bytes=4\nABCD").await;

    match harness.recv_msg().await {
        RouterMsg::Inbound {
            command, payload, ..
        } => {
            assert_eq!(command, "dmd_frame");
            assert_eq!(payload.as_deref(), Some(&b"ABCD"[..]));
        }
        _ => panic!("expected Inbound"),
    }
}

#[tokio::test]
async fn peer_goodbye_closes_without_echoing_goodbye() {
    let peer = MockPeer::bind().await;
    let mut harness = spawn_session(conn_config(peer.port()));

    let mut conn = peer.accept().await;
    conn.recv_until("hello").await;
    harness.expect_connected().await;

    conn.send_line("goodbye").await;
    harness.expect_closed(CloseReason::Goodbye).await;

    // No goodbye echo: the very next thing on the socket is EOF.
    assert!(conn.recv_eof().await);
    assert_eq!(harness.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stop_says_goodbye_then_closes() {
    let peer = MockPeer::bind().await;
    let mut harness = spawn_session(conn_config(peer.port()));

    let mut conn = peer.accept().await;
    conn.recv_until("hello").await;
    harness.expect_connected().await;

    harness.handle.stop();
    assert_eq!(conn.recv_frame().await.line, "goodbye");
    assert!(conn.recv_eof().await);
    harness.expect_closed(CloseReason::Shutdown).await;
    assert_eq!(harness.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn peer_disconnect_reports_transport_close() {
    let peer = MockPeer::bind().await;
    let mut harness = spawn_session(conn_config(peer.port()));

    let mut conn = peer.accept().await;
    conn.recv_until("hello").await;
    harness.expect_connected().await;

    drop(conn);
    drop(peer);
    harness.expect_closed(CloseReason::Transport).await;
    assert_eq!(harness.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connect_retries_until_the_peer_appears() {
    // Reserve a port, then release it so the first attempts fail.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let mut harness = spawn_session(conn_config(port));
    tokio::time::sleep(Duration::from_millis(400)).await;

    let peer = MockPeer::bind_on(port).await;
    let mut conn = peer.accept().await;
    conn.recv_until("hello").await;
    harness.expect_connected().await;
}

#[tokio::test]
async fn connect_deadline_exhaustion_is_a_transport_close() {
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let mut config = conn_config(port);
    config.connect_timeout = Duration::from_millis(300);
    let mut harness = spawn_session(config);

    harness.expect_closed(CloseReason::Transport).await;
    assert_eq!(harness.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_lines_are_dropped_and_the_session_continues() {
    let peer = MockPeer::bind().await;
    let mut harness = spawn_session(conn_config(peer.port()));

    let mut conn = peer.accept().await;
    conn.recv_until("hello").await;
    harness.expect_connected().await;

    // Bad percent escape, then a peer hello (handled locally), then a
    // valid command; only the last one reaches the router.
    conn.send_line("trigger?name=%zz").await;
    conn.send_line("hello?version=1.0").await;
    conn.send_line("trigger?name=survivor").await;

    match harness.recv_msg().await {
        RouterMsg::Inbound { command, params, .. } => {
            assert_eq!(command, "trigger");
            assert_eq!(
                params.get("name").and_then(Value::as_str),
                Some("survivor")
            );
        }
        _ => panic!("expected Inbound"),
    }
}
