//! TCP listener and connection handling.
//!
//! Every accepted connection is routed to the registry's least-loaded
//! backend and joined to it at Layer 4. Payload bytes are never inspected.
//!
//! Policy:
//! - No backend: close the client at once, nothing is dialled
//! - Dial failure or timeout: close the client, no retry
//! - Transient accept errors are logged and the loop keeps going
//! - Any other accept error stops the listener and is returned

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::BackendRegistry;
use super::stream::join_streams;
use crate::error::ProxyError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default API server port dialled on every backend.
pub const DEFAULT_BACKEND_PORT: u16 = 6443;

/// Pause after an accept error caused by resource exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Port dialled on the selected backend.
    pub backend_port: u16,
    /// Connect timeout for backend dials.
    pub connect_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            backend_port: DEFAULT_BACKEND_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections closed because the registry was empty.
    pub rejected_no_backend: AtomicU64,
    /// Backend dials attempted.
    pub dial_attempts: AtomicU64,
    /// Backend dials that failed or timed out.
    pub dial_failures: AtomicU64,
    /// Connections aborted because a side could not half-close.
    pub aborted: AtomicU64,
    /// Transient accept errors skipped.
    pub accept_errors: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// The front-door TCP listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    registry: Arc<BackendRegistry>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listener.
    pub async fn bind(
        config: ListenerConfig,
        registry: Arc<BackendRegistry>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            backend_port = config.backend_port,
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "Listener bound"
        );

        Ok(Self {
            config,
            listener,
            registry,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until a non-transient error occurs.
    ///
    /// Handlers run on their own tasks; the loop never waits on them.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(
                                    reason = e.reason_code(),
                                    error = %e,
                                    "Connection closed with error"
                                );
                            }
                            listener
                                .stats
                                .connections_active
                                .fetch_sub(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) if is_transient_accept_error(&e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Transient accept error");
                    if is_resource_exhaustion(&e) {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Accept failed; stopping listener");
                    return Err(ProxyError::Accept(e));
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ProxyError> {
        let Some(backend) = self.registry.select_backend() else {
            self.stats
                .rejected_no_backend
                .fetch_add(1, Ordering::Relaxed);
            info!(peer_addr = %peer_addr, "No available backend, closing connection");
            return Ok(());
        };

        let target = backend.target(self.config.backend_port);
        self.stats.dial_attempts.fetch_add(1, Ordering::Relaxed);
        let upstream = match dial(&target, self.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                warn!(backend_id = %backend.id, error = %e, "Backend dial failed");
                return Err(e);
            }
        };

        // Released when this handler returns, whatever the path.
        let _lease = self.registry.lease(&backend.id);
        debug!(
            backend_id = %backend.id,
            origin = backend.origin.as_str(),
            target = %target,
            "Connected to backend"
        );

        let stats = match join_streams(client, upstream).await {
            Ok(stats) => stats,
            Err(e) => {
                if matches!(e, ProxyError::HalfCloseUnsupported) {
                    self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        self.stats
            .bytes_to_backend
            .fetch_add(stats.client_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(stats.backend_to_client, Ordering::Relaxed);

        debug!(
            backend_id = %backend.id,
            bytes_to_backend = stats.client_to_backend,
            bytes_from_backend = stats.backend_to_client,
            "Connection closed"
        );

        Ok(())
    }
}

/// Dial a backend with a bounded connect timeout.
async fn dial(target: &str, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Dial {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::DialTimeout {
            target: target.to_string(),
            timeout: connect_timeout,
        }),
    }
}

/// Accept errors that concern one connection or a passing resource shortage.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_resource_exhaustion(e)
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::BackendOrigin;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("0.0.0.0:443".parse().unwrap());
        assert_eq!(config.backend_port, 6443);
        assert_eq!(config.connect_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_accept_error_classification() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
        assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(
            libc::ENFILE
        )));
        assert!(!is_resource_exhaustion(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ListenerConfig::new(taken.local_addr().unwrap());

        let result = Listener::bind(config, Arc::new(BackendRegistry::new())).await;
        let Err(err) = result else {
            panic!("binding an occupied port must fail");
        };
        assert_eq!(err.reason_code(), "bind_failed");
    }

    #[tokio::test]
    async fn test_dial_timeout_and_refusal() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let err = dial(&dead_addr, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.reason_code(), "dial_failed");

        let err = dial(&dead_addr, Duration::ZERO).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::DialTimeout { .. } | ProxyError::Dial { .. }
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let registry = Arc::new(BackendRegistry::new());
        registry.add_backend("bootstrap-0", "127.0.0.1", BackendOrigin::Bootstrap);

        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.backend_port = dead_port;
        config.connect_timeout = Duration::from_millis(500);
        let listener = Arc::new(Listener::bind(config, Arc::clone(&registry)).await.unwrap());
        let addr = listener.local_addr().unwrap();
        let run = tokio::spawn(Arc::clone(&listener).run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(listener.stats().dial_attempts.load(Ordering::Relaxed), 1);
        assert_eq!(listener.stats().dial_failures.load(Ordering::Relaxed), 1);
        assert_eq!(registry.get("bootstrap-0").unwrap().connections, 0);

        run.abort();
    }
}
