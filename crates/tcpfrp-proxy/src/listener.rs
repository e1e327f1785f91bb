//! Proxy listener implementation
//!
//! Binds a public port and runs an accept loop on a background task until the
//! returned [`ListenerHandle`] is shut down or dropped.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Backlog for public listeners
const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProxyListenerError {
    #[error("Failed to bind to {address}: {source}")]
    BindError {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Receives every connection accepted on a proxy listener
///
/// Each call runs on its own task, so a slow handler never stalls the accept loop.
#[async_trait]
pub trait PublicConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr);
}

/// A bound, not yet accepting, public listener
pub struct ProxyListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyListener {
    /// Bind `addr`. Port 0 lets the OS pick a free port.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ProxyListenerError> {
        let bind_error = |source| ProxyListenerError::BindError {
            address: addr,
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;

        // Lets a proxy be re-registered while old connections sit in TIME_WAIT
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept loop on a background task
    pub fn spawn(self, name: String, handler: Arc<dyn PublicConnectionHandler>) -> ListenerHandle {
        let local_addr = self.local_addr;
        let task = tokio::spawn(Self::accept_loop(self.listener, name, handler));

        ListenerHandle {
            task: Some(task),
            local_addr,
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        name: String,
        handler: Arc<dyn PublicConnectionHandler>,
    ) {
        info!(
            "Proxy listener for {} accepting on {}",
            name,
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New public connection from {} for proxy {}", peer_addr, name);

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                    }

                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept public connection for proxy {}: {}", name, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Owns a running accept loop. Dropping it stops accepting.
pub struct ListenerHandle {
    task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait until the listening socket is closed
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // The listener is dropped together with the aborted task
            let _ = task.await;
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
