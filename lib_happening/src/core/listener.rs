//! # Listener Service
//!
//! Owns one bound TCP listener and turns "someone connected" into a handler
//! task registered against the owning service's [`Lifecycle`].
//!
//! ## Accept loop
//! 1. Check the cancellation signal.
//! 2. Race `accept()` (bounded by `accept_timeout`) against cancellation.
//! 3. Timeout: go back to 1.
//! 4. Any other accept error: log it and end the loop. The listener is dropped
//!    with the task, which closes the socket.
//! 5. Success: hand the connection to the service's [`ConnectionHandler`] in a
//!    freshly spawned, tracked task.
//!
//! The listener is owned by the accept-loop task alone and never shared.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::lifecycle::Lifecycle;

/// Default bound on a single `accept()` wait, and so on shutdown latency.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Startup failures of a listening service. These are the only errors that
/// abort a whole service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The bind endpoint could not be resolved.
    #[error("{service}: couldn't resolve {endpoint}: {source}")]
    Resolve {
        /// Service name.
        service: String,
        /// Endpoint as configured.
        endpoint: String,
        /// Resolver failure.
        #[source]
        source: io::Error,
    },
    /// The endpoint resolved to nothing.
    #[error("{service}: {endpoint} did not resolve to any address")]
    NoAddress {
        /// Service name.
        service: String,
        /// Endpoint as configured.
        endpoint: String,
    },
    /// Binding the listening socket failed.
    #[error("{service}: couldn't bind {addr}: {source}")]
    Bind {
        /// Service name.
        service: String,
        /// Resolved address.
        addr: SocketAddr,
        /// Socket failure.
        #[source]
        source: io::Error,
    },
}

/// An accepted connection on its way to a handler.
#[derive(Debug)]
pub struct Connection {
    /// Process-wide unique id.
    pub id: u64,
    /// The accepted socket.
    pub stream: TcpStream,
    /// Remote address.
    pub peer: SocketAddr,
}

/// What a service does with each accepted connection.
///
/// `handle` runs in its own task, registered against the service lifecycle;
/// it must return once `token` is cancelled.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serves one connection until it ends or the service stops.
    fn handle(
        self: Arc<Self>,
        conn: Connection,
        token: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// A bound listener waiting to be started.
pub struct ListenerService {
    lifecycle: Lifecycle,
    listener: TcpListener,
    local_addr: SocketAddr,
    accept_timeout: Duration,
}

impl ListenerService {
    /// Resolves `endpoint` (`host:port`) and binds it.
    pub async fn bind(
        lifecycle: Lifecycle,
        endpoint: &str,
        accept_timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let service = lifecycle.name().to_string();
        let addr = lookup_host(endpoint)
            .await
            .map_err(|source| ServiceError::Resolve {
                service: service.clone(),
                endpoint: endpoint.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| ServiceError::NoAddress {
                service: service.clone(),
                endpoint: endpoint.to_string(),
            })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServiceError::Bind {
                service: service.clone(),
                addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServiceError::Bind {
            service: service.clone(),
            addr,
            source,
        })?;

        info!("{}: listening on {}", service, local_addr);
        Ok(Self {
            lifecycle,
            listener,
            local_addr,
            accept_timeout,
        })
    }

    /// The address actually bound (useful after binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop as a tracked task.
    pub fn start<H: ConnectionHandler>(self, handler: Arc<H>) {
        let lifecycle = self.lifecycle.clone();
        lifecycle.spawn(self.accept_loop(handler));
    }

    async fn accept_loop<H: ConnectionHandler>(self, handler: Arc<H>) {
        let token = self.lifecycle.token();
        let name = self.lifecycle.name().to_string();

        while !token.is_cancelled() {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = time::timeout(self.accept_timeout, self.listener.accept()) => accepted,
            };

            let (stream, peer) = match accepted {
                Err(_elapsed) => continue,
                Ok(Err(e)) => {
                    error!("{}: accept failed, closing listener: {}", name, e);
                    break;
                }
                Ok(Ok(accepted)) => accepted,
            };

            let conn = Connection {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                stream,
                peer,
            };
            debug!("{}: connection {} accepted from {}", name, conn.id, peer);

            let handler = Arc::clone(&handler);
            let token = token.clone();
            self.lifecycle.spawn(async move { handler.handle(conn, token).await });
        }

        info!("{}: accept loop on {} stopped", name, self.local_addr);
    }
}

/// A listening service assembled by explicit composition: its own
/// [`Lifecycle`], the handler serving its connections, and the bound address.
pub struct NetworkService<H> {
    lifecycle: Lifecycle,
    handler: Arc<H>,
    local_addr: SocketAddr,
}

impl<H: ConnectionHandler> NetworkService<H> {
    /// Binds `endpoint` and starts accepting connections for `handler`.
    pub async fn start(
        name: &str,
        endpoint: &str,
        accept_timeout: Duration,
        handler: Arc<H>,
    ) -> Result<Self, ServiceError> {
        let lifecycle = Lifecycle::new(name);
        let listener = ListenerService::bind(lifecycle.clone(), endpoint, accept_timeout).await?;
        let local_addr = listener.local_addr();
        listener.start(Arc::clone(&handler));

        Ok(Self {
            lifecycle,
            handler,
            local_addr,
        })
    }

    /// The service lifecycle; extra tasks spawned through it are stopped with the service.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// The connection handler.
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the accept loop and every handler task, returning once all have exited.
    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ConnectionHandler for Counting {
        fn handle(
            self: Arc<Self>,
            _conn: Connection,
            token: CancellationToken,
        ) -> impl Future<Output = ()> + Send {
            async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn hands_off_connections_and_stops_them_all() {
        let handler = Arc::new(Counting::default());
        let service = NetworkService::start(
            "Counting",
            "127.0.0.1:0",
            Duration::from_millis(50),
            Arc::clone(&handler),
        )
        .await
        .expect("bind loopback");

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(service.local_addr()).await.unwrap();
            client.write_all(b"hi").await.unwrap();
            clients.push(client);
        }

        for _ in 0..100 {
            if handler.started.load(Ordering::SeqCst) == 3 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.started.load(Ordering::SeqCst), 3);
        assert_eq!(service.lifecycle().active_tasks(), 4);

        time::timeout(Duration::from_secs(1), service.stop())
            .await
            .expect("stop within one poll interval");
        assert_eq!(handler.finished.load(Ordering::SeqCst), 3);
        assert_eq!(service.lifecycle().active_tasks(), 0);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = taken.local_addr().unwrap().to_string();

        let result = NetworkService::start(
            "Clash",
            &endpoint,
            ACCEPT_TIMEOUT,
            Arc::new(Counting::default()),
        )
        .await;

        assert!(matches!(result, Err(ServiceError::Bind { .. })));
    }

    #[tokio::test]
    async fn listener_is_closed_after_stop() {
        let service = NetworkService::start(
            "Closing",
            "127.0.0.1:0",
            Duration::from_millis(50),
            Arc::new(Counting::default()),
        )
        .await
        .unwrap();
        let addr = service.local_addr();
        service.stop().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }
}
