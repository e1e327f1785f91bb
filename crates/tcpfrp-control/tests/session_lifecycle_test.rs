//! Control session tests: login, protocol violations, heartbeats, teardown

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tcpfrp_control::{ChannelEventSink, CloseReason, HeartbeatMode, LifecycleEvent, SessionState};
use tcpfrp_proto::{ErrorCode, Heartbeat, Login, Message, SessionToken, PROTOCOL_VERSION};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_login_and_ping() {
    let (manager, addr) = start_server(test_config().with_server_name("edge-1")).await;
    let (mut client, session) = TestClient::login(addr).await;

    assert!(!session.as_str().is_empty());
    assert_eq!(manager.session_count(), 1);
    assert_eq!(manager.session_state(&session), Some(SessionState::Active));

    client
        .send(Message::Heartbeat(Heartbeat::Ping { timestamp: 42 }))
        .await;
    assert_eq!(
        client.recv().await,
        Message::Heartbeat(Heartbeat::Pong {
            timestamp: 42,
            server_name: "edge-1".to_string(),
        })
    );

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let (manager, addr) = start_server(test_config()).await;
    let mut client = TestClient::connect(addr).await;

    client.send(login_frame("wrong")).await;
    client.expect_error(ErrorCode::AuthenticationFailed).await;
    client.expect_closed().await;
    assert_eq!(manager.session_count(), 0);

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_protocol_version_mismatch_rejected() {
    let (manager, addr) = start_server(test_config()).await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(Message::Login(Login {
            version: PROTOCOL_VERSION + 1,
            credentials: SECRET.to_string(),
            session_token: None,
        }))
        .await;
    client.expect_error(ErrorCode::UnsupportedVersion).await;
    client.expect_closed().await;

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_frames_before_login_are_rejected() {
    let (manager, addr) = start_server(test_config()).await;
    let mut client = TestClient::connect(addr).await;

    // Two rejected frames leave the connection open for a login
    client.send(register_frame("web", 0)).await;
    client.expect_error(ErrorCode::ProtocolViolation).await;
    client
        .send(Message::Heartbeat(Heartbeat::Ping { timestamp: 1 }))
        .await;
    client.expect_error(ErrorCode::ProtocolViolation).await;

    client.send(login_frame(SECRET)).await;
    assert!(matches!(client.recv().await, Message::LoginResponse(r) if r.ok));

    // Nothing was bound by the rejected registration
    assert!(manager.registry().is_empty());
    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_third_violation_before_login_closes_connection() {
    let (manager, addr) = start_server(test_config()).await;
    let mut client = TestClient::connect(addr).await;

    for _ in 0..3 {
        client.send(register_frame("web", 0)).await;
        client.expect_error(ErrorCode::ProtocolViolation).await;
    }
    client.expect_closed().await;
    assert!(manager.registry().is_empty());

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_repeated_violations_close_active_session() {
    let (manager, addr) = start_server(test_config()).await;
    let (mut client, session) = TestClient::login(addr).await;

    for _ in 0..3 {
        client.send(login_frame(SECRET)).await;
        client.expect_error(ErrorCode::ProtocolViolation).await;
    }
    client.expect_closed().await;
    assert!(eventually(|| manager.session_state(&session).is_none()).await);

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_malformed_frame_closes_session() {
    let (manager, addr) = start_server(test_config()).await;
    let (mut client, _) = TestClient::login(addr).await;
    let port = client.register("web", 0).await.remote_port;

    // Declared length far beyond the frame size limit
    client.send_raw(&[0xff, 0xff, 0xff, 0xff, 0x03]).await;
    client.expect_error(ErrorCode::MalformedFrame).await;
    client.expect_closed().await;

    assert!(wait_until_refused(port).await);
    assert!(eventually(|| manager.session_count() == 0).await);
    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_unknown_frame_type_closes_session() {
    let (manager, addr) = start_server(test_config()).await;
    let (mut client, _) = TestClient::login(addr).await;

    client.send_raw(&[0x00, 0x00, 0x00, 0x02, 0xee, 0x00]).await;
    client.expect_error(ErrorCode::MalformedFrame).await;
    client.expect_closed().await;

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_silent_connection_closed_after_handshake_timeout() {
    let config = test_config().with_handshake_timeout(Duration::from_millis(200));
    let (manager, addr) = start_server(config).await;
    let mut client = TestClient::connect(addr).await;

    client.expect_closed().await;
    assert_eq!(manager.session_count(), 0);
    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_session_token_resumed_when_free() {
    let (manager, addr) = start_server(test_config()).await;

    let mut first = TestClient::connect(addr).await;
    first
        .send(Message::Login(Login {
            version: PROTOCOL_VERSION,
            credentials: SECRET.to_string(),
            session_token: Some(SessionToken::from("resume-me")),
        }))
        .await;
    let token = match first.recv().await {
        Message::LoginResponse(response) => response.session_token,
        other => panic!("Expected LoginResponse, got {:?}", other),
    };
    assert_eq!(token, SessionToken::from("resume-me"));

    // A live session keeps its token; a second claim gets a fresh one
    let mut second = TestClient::connect(addr).await;
    second
        .send(Message::Login(Login {
            version: PROTOCOL_VERSION,
            credentials: SECRET.to_string(),
            session_token: Some(SessionToken::from("resume-me")),
        }))
        .await;
    match second.recv().await {
        Message::LoginResponse(response) => {
            assert_ne!(response.session_token, SessionToken::from("resume-me"))
        }
        other => panic!("Expected LoginResponse, got {:?}", other),
    }

    assert_eq!(manager.session_count(), 2);
    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_heartbeat_timeout_tears_session_down() {
    let config = test_config().with_heartbeat_timeout(Duration::from_millis(300));
    let (manager, addr) = start_server(config).await;
    let (mut client, session) = TestClient::login(addr).await;
    let port = client.register("web", 0).await.remote_port;

    client.expect_error(ErrorCode::Timeout).await;
    client.expect_closed().await;

    assert!(wait_until_refused(port).await);
    assert!(eventually(|| manager.session_state(&session).is_none()).await);
    assert!(manager.registry().is_empty());
    assert!(!manager.heartbeat_monitor().is_tracked(&session));

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_client_pings_keep_session_alive() {
    let config = test_config().with_heartbeat_timeout(Duration::from_millis(400));
    let (manager, addr) = start_server(config).await;
    let (mut client, session) = TestClient::login(addr).await;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.assert_alive().await;
    }
    assert_eq!(manager.session_state(&session), Some(SessionState::Active));

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_server_pings_answered_with_pongs() {
    let config = test_config()
        .with_heartbeat_timeout(Duration::from_millis(500))
        .with_heartbeat_mode(HeartbeatMode::ServerPings {
            interval: Duration::from_millis(100),
        });
    let (manager, addr) = start_server(config).await;
    let (mut client, session) = TestClient::login(addr).await;

    for _ in 0..10 {
        match client.recv().await {
            Message::Heartbeat(Heartbeat::Ping { timestamp }) => {
                client
                    .send(Message::Heartbeat(Heartbeat::Pong {
                        timestamp,
                        server_name: String::new(),
                    }))
                    .await;
            }
            other => panic!("Expected Ping, got {:?}", other),
        }
    }
    assert_eq!(manager.session_state(&session), Some(SessionState::Active));

    // Stop answering: the session expires
    client.expect_error(ErrorCode::Timeout).await;
    client.expect_closed().await;
    assert!(eventually(|| manager.session_count() == 0).await);

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_client_disconnect_releases_everything() {
    let (sink, mut events) = ChannelEventSink::new();
    let config = test_config().with_event_sink(Arc::new(sink));
    let (manager, addr) = start_server(config).await;

    let (mut client, session) = TestClient::login(addr).await;
    let port = client.register("web", 0).await.remote_port;
    drop(client);

    assert!(wait_until_refused(port).await);
    assert!(eventually(|| manager.session_count() == 0).await);
    assert!(manager.registry().is_empty());

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(STEP_TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();
        let closed = matches!(event, LifecycleEvent::SessionClosed { .. });
        seen.push(event);
        if closed {
            break;
        }
    }

    assert!(matches!(
        &seen[0],
        LifecycleEvent::SessionCreated { session: s, resumed: false, .. } if *s == session
    ));
    assert!(seen.iter().any(|event| matches!(
        event,
        LifecycleEvent::ProxyBound { name, port: p, .. } if name == "web" && *p == port
    )));
    assert!(seen.iter().any(|event| matches!(
        event,
        LifecycleEvent::ProxyUnbound { name, .. } if name == "web"
    )));
    assert!(matches!(
        seen.last(),
        Some(LifecycleEvent::SessionClosed {
            reason: CloseReason::ClientDisconnected,
            ..
        })
    ));

    // The name is free for a new session
    let (mut other, _) = TestClient::login(addr).await;
    assert!(other.register("web", port).await.ok);

    manager.shutdown(false).await;
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (manager, addr) = start_server(test_config()).await;
    let (mut healthy, _) = TestClient::login(addr).await;
    let (mut broken, _) = TestClient::login(addr).await;
    let port = healthy.register("web", 0).await.remote_port;

    broken.send_raw(&[0xff, 0xff, 0xff, 0xff, 0x03]).await;
    broken.expect_error(ErrorCode::MalformedFrame).await;
    broken.expect_closed().await;

    healthy.assert_alive().await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());
    assert!(eventually(|| manager.session_count() == 1).await);

    manager.shutdown(false).await;
}
