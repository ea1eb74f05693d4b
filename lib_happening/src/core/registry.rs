//! # Client Registry
//!
//! Connection handler of the clients service. A client connects, sends its
//! id as the first line, and is then reachable through [`ClientRegistry`]
//! until it disconnects.
//!
//! - Registration is last-writer-wins: a second connection announcing the
//!   same id replaces the first, and the superseded connection is closed.
//! - The entry is evicted when its connection ends, but only if it still
//!   points at that connection.
//! - An empty id, or no id before `registration_timeout`, closes the
//!   connection without registering anything.
//! - A push is bounded by `PUSH_TIMEOUT` and aborted as soon as the client is
//!   closed, so closing or replacing a client never waits on a stalled peer.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{Connection, ConnectionHandler};

/// Default deadline for the id line.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for one push to a client.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

const ID_BUFFER_SIZE: usize = 1024;

/// Write side of a registered client connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    connection_id: u64,
    peer: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    closed: CancellationToken,
    push_timeout: Duration,
}

impl ClientHandle {
    fn new(
        connection_id: u64,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        closed: CancellationToken,
        push_timeout: Duration,
    ) -> Self {
        Self {
            connection_id,
            peer,
            writer: Arc::new(Mutex::new(writer)),
            closed,
            push_timeout,
        }
    }

    /// Id of the underlying connection.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `true` once the connection was closed or superseded.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Writes `payload` to the client.
    ///
    /// Fails with `NotConnected` once the client is closed, including while the
    /// write is in flight, and with `TimedOut` after `PUSH_TIMEOUT`. A timed out
    /// push may have left a partial payload behind, so it also closes the client.
    pub async fn push(&self, payload: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(not_connected());
        }
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(payload).await?;
            writer.flush().await
        };

        let written = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(not_connected()),
            written = time::timeout(self.push_timeout, write) => written,
        };
        match written {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!(
                    "push to client {} timed out after {:?}",
                    self.peer, self.push_timeout
                );
                self.close().await;
                Err(io::Error::new(io::ErrorKind::TimedOut, "push to client timed out"))
            }
        }
    }

    /// Marks the client closed and shuts the write side down if no push holds
    /// it. An in-flight push aborts on the signal and the serving task then
    /// finishes the shutdown, so this never waits on the peer.
    pub async fn close(&self) {
        self.closed.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown of client {} failed: {}", self.peer, e);
            }
        }
    }

    /// Final shutdown by the serving task, waiting at most one push deadline
    /// for the writer.
    async fn release(&self) {
        self.closed.cancel();
        match time::timeout(self.push_timeout, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("shutdown of client {} failed: {}", self.peer, e);
                }
            }
            Err(_elapsed) => debug!("writer of client {} still busy, left to drop", self.peer),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "client connection is closed")
}

/// Id-to-connection map shared by the clients service and its users.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `id` to `handle`. A previous holder of the id is closed and returned.
    pub async fn register(&self, id: String, handle: ClientHandle) -> Option<ClientHandle> {
        let previous = self.clients.write().await.insert(id, handle);
        if let Some(old) = &previous {
            old.close().await;
        }
        previous
    }

    /// The connection currently registered under `id`.
    pub async fn lookup(&self, id: &str) -> Option<ClientHandle> {
        self.clients.read().await.get(id).cloned()
    }

    /// Removes `id` whatever connection holds it, closing that connection.
    pub async fn evict(&self, id: &str) -> Option<ClientHandle> {
        let removed = self.clients.write().await.remove(id);
        if let Some(handle) = &removed {
            handle.close().await;
        }
        removed
    }

    /// Removes `id` only while it still belongs to `connection_id`.
    pub async fn evict_connection(&self, id: &str, connection_id: u64) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(id) {
            Some(handle) if handle.connection_id == connection_id => {
                clients.remove(id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Registered ids, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Extracts the client id from the first read: the first line, trimmed.
pub fn parse_client_id(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.split(['\r', '\n']).next().unwrap_or_default();
    let id = line.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Handler shared by every connection of the clients service.
pub struct ClientStore {
    name: String,
    registry: Arc<ClientRegistry>,
    registration_timeout: Duration,
}

impl ClientStore {
    pub fn new(name: impl Into<String>, registration_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            registry: Arc::new(ClientRegistry::new()),
            registration_timeout,
        }
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    async fn read_id(&self, reader: &mut OwnedReadHalf, token: &CancellationToken) -> Option<String> {
        let mut buf = vec![0u8; ID_BUFFER_SIZE];
        let read = tokio::select! {
            _ = token.cancelled() => return None,
            read = time::timeout(self.registration_timeout, reader.read(&mut buf)) => read,
        };

        match read {
            Ok(Ok(0)) => None,
            Ok(Ok(n)) => parse_client_id(&buf[..n]),
            Ok(Err(e)) => {
                warn!("{}: couldn't read client id: {}", self.name, e);
                None
            }
            Err(_elapsed) => {
                warn!(
                    "{}: no client id within {:?}",
                    self.name, self.registration_timeout
                );
                None
            }
        }
    }

    async fn serve(&self, conn: Connection, token: CancellationToken) {
        let Connection { id: conn_id, stream, peer } = conn;
        let (mut reader, mut writer) = stream.into_split();

        let Some(client_id) = self.read_id(&mut reader, &token).await else {
            warn!("{}: {} sent no usable id, closing", self.name, peer);
            if let Err(e) = writer.shutdown().await {
                debug!("{}: shutdown of {} failed: {}", self.name, peer, e);
            }
            return;
        };

        let closed = token.child_token();
        let handle = ClientHandle::new(conn_id, peer, writer, closed.clone(), PUSH_TIMEOUT);
        if let Some(old) = self.registry.register(client_id.clone(), handle.clone()).await {
            info!(
                "{}: client {} moved from {} to {}",
                self.name,
                client_id,
                old.peer(),
                peer
            );
        } else {
            info!("{}: client {} registered from {}", self.name, client_id, peer);
        }

        // Nothing is expected after the id; reads only detect the hang-up.
        let mut buf = [0u8; 256];
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("{}: read from {} failed: {}", self.name, peer, e);
                        break;
                    }
                },
            }
        }

        if self.registry.evict_connection(&client_id, conn_id).await {
            info!("{}: client {} disconnected", self.name, client_id);
        }
        handle.release().await;
    }
}

impl ConnectionHandler for ClientStore {
    fn handle(
        self: Arc<Self>,
        conn: Connection,
        token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move { self.serve(conn, token).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn handle_pair(connection_id: u64) -> (ClientHandle, TcpStream) {
        handle_pair_with_deadline(connection_id, PUSH_TIMEOUT).await
    }

    async fn handle_pair_with_deadline(connection_id: u64, push_timeout: Duration) -> (ClientHandle, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (_reader, writer) = server.into_split();
        let handle = ClientHandle::new(connection_id, peer, writer, CancellationToken::new(), push_timeout);
        (handle, client)
    }

    /// More than loopback socket buffers absorb, so a push to a peer that
    /// never reads stays in flight.
    fn stalling_payload() -> Vec<u8> {
        vec![b'x'; 32 * 1024 * 1024]
    }

    #[test]
    fn client_id_is_the_trimmed_first_line() {
        assert_eq!(parse_client_id(b"X\r\n"), Some("X".to_string()));
        assert_eq!(parse_client_id(b"  alpha \nignored"), Some("alpha".to_string()));
        assert_eq!(parse_client_id(b"beta\0\0\0"), Some("beta".to_string()));
        assert_eq!(parse_client_id(b"\r\n"), None);
        assert_eq!(parse_client_id(b"   "), None);
    }

    #[tokio::test]
    async fn last_registration_wins_and_closes_the_old_one() {
        let registry = ClientRegistry::new();
        let (first, _c1) = handle_pair(1).await;
        let (second, _c2) = handle_pair(2).await;

        assert!(registry.register("X".into(), first.clone()).await.is_none());
        let replaced = registry.register("X".into(), second).await;

        assert_eq!(replaced.map(|h| h.connection_id()), Some(1));
        assert!(first.is_closed());
        assert_eq!(registry.lookup("X").await.map(|h| h.connection_id()), Some(2));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stale_connection_does_not_evict_its_successor() {
        let registry = ClientRegistry::new();
        let (first, _c1) = handle_pair(1).await;
        let (second, _c2) = handle_pair(2).await;
        registry.register("X".into(), first).await;
        registry.register("X".into(), second).await;

        assert!(!registry.evict_connection("X", 1).await);
        assert!(registry.lookup("X").await.is_some());
        assert!(registry.evict_connection("X", 2).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn push_reaches_the_client() {
        let (handle, mut client) = handle_pair(7).await;
        handle.push(b"ping\r\n").await.unwrap();

        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\r\n");
    }

    #[tokio::test]
    async fn push_after_close_is_refused() {
        let (handle, _client) = handle_pair(8).await;
        handle.close().await;

        let err = handle.push(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn ids_are_sorted() {
        let registry = ClientRegistry::new();
        let mut clients = Vec::new();
        for (n, id) in ["b", "a", "c"].into_iter().enumerate() {
            let (handle, client) = handle_pair(n as u64).await;
            clients.push(client);
            registry.register(id.to_string(), handle).await;
        }
        assert_eq!(registry.ids().await, vec!["a", "b", "c"]);
        let evicted = registry.evict("b").await.expect("b was registered");
        assert!(evicted.is_closed());
        assert_eq!(registry.ids().await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn overwrite_does_not_wait_for_a_stalled_push() {
        let registry = ClientRegistry::new();
        let (first, _silent) = handle_pair(1).await;
        let (second, _c2) = handle_pair(2).await;
        registry.register("X".into(), first.clone()).await;

        let pushing = first.clone();
        let push = tokio::spawn(async move { pushing.push(&stalling_payload()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!push.is_finished());

        let replaced = time::timeout(Duration::from_secs(2), registry.register("X".into(), second))
            .await
            .expect("register is not blocked by the push");
        assert_eq!(replaced.map(|h| h.connection_id()), Some(1));

        let err = time::timeout(Duration::from_secs(2), push)
            .await
            .expect("push aborted")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn push_to_a_peer_that_never_reads_times_out() {
        let (handle, _silent) = handle_pair_with_deadline(3, Duration::from_millis(200)).await;

        let err = time::timeout(Duration::from_secs(2), handle.push(&stalling_payload()))
            .await
            .expect("push is deadline bounded")
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(handle.is_closed());
    }
}
