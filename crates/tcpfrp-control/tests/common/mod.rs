//! Shared helpers for the control-plane integration tests
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tcpfrp_auth::StaticTokenAuthenticator;
use tcpfrp_control::{ServerConfig, SessionManager};
use tcpfrp_proto::{
    ErrorCode, ErrorFrame, FrameCodec, Heartbeat, Login, Message, NewWorkConnection, ProxyProtocol,
    ProxyRegister, ProxyRegisterResponse, SessionToken, WorkConnectionRequest, WorkToken,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

pub const SECRET: &str = "test-secret";
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn test_config() -> ServerConfig {
    ServerConfig::new(Arc::new(StaticTokenAuthenticator::new([SECRET])))
        .with_bind_address("127.0.0.1".parse().unwrap())
        .with_handshake_timeout(Duration::from_secs(2))
}

pub async fn start_server(config: ServerConfig) -> (SessionManager, SocketAddr) {
    init_tracing();
    let manager = SessionManager::new(config).unwrap();
    let addr = manager.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (manager, addr)
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn login_frame(credentials: &str) -> Message {
    Message::Login(Login {
        version: PROTOCOL_VERSION,
        credentials: credentials.to_string(),
        session_token: None,
    })
}

pub fn register_frame(name: &str, port: u16) -> Message {
    Message::ProxyRegister(ProxyRegister {
        name: name.to_string(),
        remote_port: port,
        protocol: ProxyProtocol::Tcp,
    })
}

/// Framed client speaking the control protocol
pub struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
        }
    }

    /// Connect and log in with the shared test secret
    pub async fn login(addr: SocketAddr) -> (Self, SessionToken) {
        let mut client = Self::connect(addr).await;
        client.send(login_frame(SECRET)).await;
        match client.recv().await {
            Message::LoginResponse(response) => {
                assert!(response.ok);
                (client, response.session_token)
            }
            other => panic!("Expected LoginResponse, got {:?}", other),
        }
    }

    pub async fn send(&mut self, msg: Message) {
        self.framed.send(msg).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        match timeout(STEP_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => panic!("Decode error: {}", e),
            Ok(None) => panic!("Connection closed while waiting for a frame"),
            Err(_) => panic!("No frame within {:?}", STEP_TIMEOUT),
        }
    }

    /// Skip server pings until a frame of another kind arrives
    pub async fn recv_skipping_pings(&mut self) -> Message {
        loop {
            match self.recv().await {
                Message::Heartbeat(Heartbeat::Ping { .. }) => continue,
                other => return other,
            }
        }
    }

    pub async fn expect_error(&mut self, code: ErrorCode) -> ErrorFrame {
        match self.recv_skipping_pings().await {
            Message::Error(frame) => {
                assert_eq!(frame.code, code, "unexpected error frame: {:?}", frame);
                frame
            }
            other => panic!("Expected Error({:?}), got {:?}", code, other),
        }
    }

    /// The server closed the connection, optionally after more frames
    pub async fn expect_closed(&mut self) {
        loop {
            match timeout(STEP_TIMEOUT, self.framed.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return,
                Ok(Some(Ok(Message::Heartbeat(_)))) => continue,
                Ok(Some(Ok(msg))) => panic!("Expected close, got {:?}", msg),
                Err(_) => panic!("Connection still open after {:?}", STEP_TIMEOUT),
            }
        }
    }

    pub async fn register(&mut self, name: &str, port: u16) -> ProxyRegisterResponse {
        self.send(register_frame(name, port)).await;
        match self.recv_skipping_pings().await {
            Message::ProxyRegisterResponse(response) => response,
            other => panic!("Expected ProxyRegisterResponse, got {:?}", other),
        }
    }

    pub async fn expect_work_request(&mut self) -> WorkConnectionRequest {
        match self.recv_skipping_pings().await {
            Message::WorkConnectionRequest(request) => request,
            other => panic!("Expected WorkConnectionRequest, got {:?}", other),
        }
    }

    /// Round-trip a ping to prove the session is still serving frames
    pub async fn assert_alive(&mut self) {
        self.send(Message::Heartbeat(Heartbeat::Ping { timestamp: 7 }))
            .await;
        match self.recv_skipping_pings().await {
            Message::Heartbeat(Heartbeat::Pong { timestamp, .. }) => assert_eq!(timestamp, 7),
            other => panic!("Expected Pong, got {:?}", other),
        }
    }
}

/// Open a work connection for `token` and return the raw stream
pub async fn open_work_connection(addr: SocketAddr, token: WorkToken) -> TcpStream {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());
    framed
        .send(Message::NewWorkConnection(NewWorkConnection { token }))
        .await
        .unwrap();
    framed.into_inner()
}

pub async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(STEP_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// True once the peer has closed (EOF or reset)
pub async fn is_closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match timeout(STEP_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) => false,
        Err(_) => false,
    }
}

/// Poll until nothing accepts connections on `port`
pub async fn wait_until_refused(port: u16) -> bool {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Wait for `name` to leave the registry, then check its port is closed
///
/// Never connects while the proxy may still be live, so no work request is
/// triggered on the owning session.
pub async fn assert_unbound(manager: &SessionManager, name: &str, port: u16) {
    assert!(eventually(|| manager.registry().lookup(name).is_err()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

/// Poll a condition every 20ms for up to five seconds
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
