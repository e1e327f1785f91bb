//! Proxy registry
//!
//! Maps proxy names to their bound public listeners. Names and ports are unique
//! across all sessions. Bind and unbind for one name are serialized by a
//! per-name lock, so distinct names never wait on each other.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tcpfrp_proto::{ProxyProtocol, SessionToken};
use tcpfrp_proxy::{ListenerHandle, ProxyListener, ProxyListenerError, PublicConnectionHandler};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Proxy name '{name}' is already in use")]
    NameInUse { name: String },

    #[error("Port {port} is already in use by proxy '{holder}'")]
    PortInUse { port: u16, holder: String },

    #[error("Port {port} is outside the allowed range {start}-{end}")]
    PortNotAllowed { port: u16, start: u16, end: u16 },

    #[error("No free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Failed to bind port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: ProxyListenerError,
    },

    #[error("Proxy '{0}' not found")]
    NotFound(String),

    #[error("Registry is shutting down")]
    ShuttingDown,
}

/// A registered proxy and its public listener address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBinding {
    pub name: String,
    /// Port the client asked for (0 means any)
    pub requested_port: u16,
    pub local_addr: SocketAddr,
    pub protocol: ProxyProtocol,
    /// Token of the owning session; a lookup key, not a handle
    pub owner: SessionToken,
    pub bound_at: DateTime<Utc>,
}

impl ProxyBinding {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

/// Result of a successful bind
#[derive(Debug, Clone)]
pub enum Bound {
    /// A new listener was opened
    Created(Arc<ProxyBinding>),
    /// The same session already held this binding
    Existing(Arc<ProxyBinding>),
}

impl Bound {
    pub fn binding(&self) -> &Arc<ProxyBinding> {
        match self {
            Bound::Created(binding) | Bound::Existing(binding) => binding,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Bound::Created(_))
    }
}

struct RegistryEntry {
    binding: Arc<ProxyBinding>,
    listener: ListenerHandle,
}

pub struct ProxyRegistry {
    bind_address: IpAddr,
    allowed_ports: Option<RangeInclusive<u16>>,
    bindings: DashMap<String, RegistryEntry>,
    /// Port -> proxy name, including reservations for binds in progress
    ports: DashMap<u16, String>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
    closed: AtomicBool,
}

impl ProxyRegistry {
    pub fn new(bind_address: IpAddr, allowed_ports: Option<RangeInclusive<u16>>) -> Self {
        Self {
            bind_address,
            allowed_ports,
            bindings: DashMap::new(),
            ports: DashMap::new(),
            name_locks: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Register `name` on `port` for `owner` and start accepting on it
    ///
    /// Port 0 picks the first free port of the allowed range, or lets the OS
    /// choose when no range is configured. Binding a name the same owner
    /// already holds on the same port returns the existing binding.
    pub async fn bind(
        &self,
        name: &str,
        port: u16,
        protocol: ProxyProtocol,
        owner: &SessionToken,
        handler: Arc<dyn PublicConnectionHandler>,
    ) -> Result<Bound, RegistryError> {
        self.with_name_lock(name, self.bind_locked(name, port, protocol, owner, handler))
            .await
    }

    async fn bind_locked(
        &self,
        name: &str,
        port: u16,
        protocol: ProxyProtocol,
        owner: &SessionToken,
        handler: Arc<dyn PublicConnectionHandler>,
    ) -> Result<Bound, RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::ShuttingDown);
        }

        if let Some(entry) = self.bindings.get(name) {
            let existing = &entry.binding;
            let same_port =
                port == 0 || port == existing.port() || port == existing.requested_port;
            if existing.owner == *owner && same_port && existing.protocol == protocol {
                debug!(proxy = %name, "Proxy already bound by this session");
                return Ok(Bound::Existing(existing.clone()));
            }
            return Err(RegistryError::NameInUse {
                name: name.to_string(),
            });
        }

        let listener = self.open_listener(name, port).await?;
        let local_addr = listener.local_addr();

        if self.is_closed() {
            self.ports.remove(&local_addr.port());
            return Err(RegistryError::ShuttingDown);
        }

        let binding = Arc::new(ProxyBinding {
            name: name.to_string(),
            requested_port: port,
            local_addr,
            protocol,
            owner: owner.clone(),
            bound_at: Utc::now(),
        });

        let listener = listener.spawn(name.to_string(), handler);
        self.bindings.insert(
            name.to_string(),
            RegistryEntry {
                binding: binding.clone(),
                listener,
            },
        );

        info!(proxy = %name, session = %owner, "Proxy listening on {}", local_addr);
        Ok(Bound::Created(binding))
    }

    /// Reserve a port and bind a listener on it
    async fn open_listener(&self, name: &str, port: u16) -> Result<ProxyListener, RegistryError> {
        match (port, &self.allowed_ports) {
            (0, Some(range)) => {
                for candidate in range.clone() {
                    if self.reserve_port(candidate, name).is_err() {
                        continue;
                    }
                    match ProxyListener::bind(SocketAddr::new(self.bind_address, candidate)).await
                    {
                        Ok(listener) => return Ok(listener),
                        Err(e) => {
                            debug!("Port {} unavailable for {}: {}", candidate, name, e);
                            self.ports.remove(&candidate);
                        }
                    }
                }
                Err(RegistryError::NoFreePort {
                    start: *range.start(),
                    end: *range.end(),
                })
            }
            (0, None) => {
                let listener = ProxyListener::bind(SocketAddr::new(self.bind_address, 0))
                    .await
                    .map_err(|source| RegistryError::BindFailed { port: 0, source })?;
                // Dropping the listener closes the OS-assigned port again
                self.reserve_port(listener.local_addr().port(), name)?;
                Ok(listener)
            }
            (port, range) => {
                if let Some(range) = range {
                    if !range.contains(&port) {
                        return Err(RegistryError::PortNotAllowed {
                            port,
                            start: *range.start(),
                            end: *range.end(),
                        });
                    }
                }

                self.reserve_port(port, name)?;
                match ProxyListener::bind(SocketAddr::new(self.bind_address, port)).await {
                    Ok(listener) => Ok(listener),
                    Err(source) => {
                        self.ports.remove(&port);
                        Err(RegistryError::BindFailed { port, source })
                    }
                }
            }
        }
    }

    fn reserve_port(&self, port: u16, name: &str) -> Result<(), RegistryError> {
        match self.ports.entry(port) {
            Entry::Occupied(holder) => Err(RegistryError::PortInUse {
                port,
                holder: holder.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(name.to_string());
                Ok(())
            }
        }
    }

    /// Close the listener for `name`. No-op when the name is not bound.
    pub async fn unbind(&self, name: &str) -> Option<Arc<ProxyBinding>> {
        self.with_name_lock(name, async {
            let (_, entry) = self.bindings.remove(name)?;
            Some(self.release(entry).await)
        })
        .await
    }

    /// Close the listener for `name` only if `owner` holds it
    pub async fn unbind_owned(
        &self,
        name: &str,
        owner: &SessionToken,
    ) -> Result<Arc<ProxyBinding>, RegistryError> {
        self.with_name_lock(name, async {
            let (_, entry) = self
                .bindings
                .remove_if(name, |_, entry| entry.binding.owner == *owner)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            Ok::<_, RegistryError>(self.release(entry).await)
        })
        .await
    }

    async fn release(&self, entry: RegistryEntry) -> Arc<ProxyBinding> {
        let RegistryEntry { binding, listener } = entry;
        // The port stays reserved until the socket is really closed
        listener.shutdown().await;
        self.ports.remove(&binding.port());
        info!(proxy = %binding.name, "Proxy listener on {} closed", binding.local_addr);
        binding
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ProxyBinding>, RegistryError> {
        self.bindings
            .get(name)
            .map(|entry| entry.binding.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse new binds and close every listener. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        let mut closed = 0;
        for name in self.names() {
            if self.unbind(&name).await.is_some() {
                closed += 1;
            }
        }
        closed
    }

    async fn with_name_lock<F: Future>(&self, name: &str, operation: F) -> F::Output {
        let lock = self.name_locks.entry(name.to_string()).or_default().clone();

        let output = {
            let _guard = lock.lock().await;
            operation.await
        };

        drop(lock);
        self.name_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct Greeter;

    #[async_trait]
    impl PublicConnectionHandler for Greeter {
        async fn handle(&self, mut stream: TcpStream, _peer_addr: SocketAddr) {
            let _ = stream.write_all(b"hi").await;
        }
    }

    fn registry() -> ProxyRegistry {
        ProxyRegistry::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None)
    }

    fn token(value: &str) -> SessionToken {
        SessionToken::from(value)
    }

    async fn bind(
        registry: &ProxyRegistry,
        name: &str,
        port: u16,
        owner: &str,
    ) -> Result<Bound, RegistryError> {
        registry
            .bind(name, port, ProxyProtocol::Tcp, &token(owner), Arc::new(Greeter))
            .await
    }

    /// A port that was free a moment ago
    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_bind_lookup_unbind() {
        let registry = registry();

        let bound = bind(&registry, "web", 0, "s1").await.unwrap();
        assert!(bound.is_new());
        let port = bound.binding().port();
        assert_ne!(port, 0);

        let found = registry.lookup("web").unwrap();
        assert_eq!(found.owner, token("s1"));
        assert_eq!(found.port(), port);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

        let removed = registry.unbind("web").await.unwrap();
        assert_eq!(removed.name, "web");
        assert!(matches!(
            registry.lookup("web"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        // Idempotent
        assert!(registry.unbind("web").await.is_none());
    }

    #[tokio::test]
    async fn test_name_conflict_across_sessions() {
        let registry = registry();
        let first = bind(&registry, "web", 0, "s1").await.unwrap();

        let err = bind(&registry, "web", 0, "s2").await.unwrap_err();
        assert!(matches!(err, RegistryError::NameInUse { .. }));

        // The first binding is untouched
        assert_eq!(registry.lookup("web").unwrap(), *first.binding());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_port_conflict_across_sessions() {
        let registry = registry();
        let port = bind(&registry, "web", 0, "s1")
            .await
            .unwrap()
            .binding()
            .port();

        let err = bind(&registry, "api", port, "s2").await.unwrap_err();
        match err {
            RegistryError::PortInUse { port: p, holder } => {
                assert_eq!(p, port);
                assert_eq!(holder, "web");
            }
            other => panic!("Expected PortInUse, got {:?}", other),
        }
        assert!(registry.lookup("api").is_err());
    }

    #[tokio::test]
    async fn test_same_session_rebind_is_idempotent() {
        let registry = registry();
        let port = free_port().await;

        let first = bind(&registry, "web", port, "s1").await.unwrap();
        assert!(first.is_new());

        let second = bind(&registry, "web", port, "s1").await.unwrap();
        assert!(!second.is_new());
        assert_eq!(second.binding(), first.binding());
        assert_eq!(registry.len(), 1);

        // Same name on another port is a conflict, even for the owner
        let other_port = free_port().await;
        assert!(matches!(
            bind(&registry, "web", other_port, "s1").await,
            Err(RegistryError::NameInUse { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_does_not_register() {
        let registry = registry();
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let err = bind(&registry, "web", port, "s1").await.unwrap_err();
        assert!(matches!(err, RegistryError::BindFailed { .. }));
        assert!(registry.is_empty());

        // The reservation was released
        drop(blocker);
        assert!(bind(&registry, "web", port, "s1").await.is_ok());
    }

    #[tokio::test]
    async fn test_allowed_port_range() {
        let start = free_port().await;
        let registry = ProxyRegistry::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Some(start..=start));

        let outside = if start == u16::MAX { start - 1 } else { start + 1 };
        assert!(matches!(
            bind(&registry, "web", outside, "s1").await,
            Err(RegistryError::PortNotAllowed { .. })
        ));

        let bound = bind(&registry, "web", 0, "s1").await.unwrap();
        assert_eq!(bound.binding().port(), start);

        assert!(matches!(
            bind(&registry, "api", 0, "s1").await,
            Err(RegistryError::NoFreePort { .. })
        ));
    }

    #[tokio::test]
    async fn test_unbind_owned() {
        let registry = registry();
        bind(&registry, "web", 0, "s1").await.unwrap();

        assert!(matches!(
            registry.unbind_owned("web", &token("s2")).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.lookup("web").is_ok());

        assert!(registry.unbind_owned("web", &token("s1")).await.is_ok());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_refuses_new_binds() {
        let registry = registry();
        bind(&registry, "a", 0, "s1").await.unwrap();
        bind(&registry, "b", 0, "s2").await.unwrap();

        assert_eq!(registry.close_all().await, 2);
        assert!(registry.is_empty());
        assert!(matches!(
            bind(&registry, "c", 0, "s1").await,
            Err(RegistryError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_binds_same_name_single_winner() {
        let registry = Arc::new(registry());

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                bind(&registry, "contested", 0, &format!("s{}", i)).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.name_locks.is_empty());
    }
}
