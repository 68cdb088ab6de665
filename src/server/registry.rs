//! Client registry and dispatcher
//!
//! Tracks every client whose handshake succeeded, assigns ids, fires the
//! lifecycle callbacks and performs unicast/broadcast sends.
//!
//! All access to the client map goes through one mutex. Callbacks run after
//! the lock is released, and broadcast writes to clients from a snapshot taken
//! under the lock so a slow client never blocks registration of others.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{encode_text, FrameError};

/// Errors returned by send operations
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Client {0} is no longer connected")]
    ClientGone(u64),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for send operations
pub type SendResult<T> = Result<T, SendError>;

/// Callbacks invoked by the server for client lifecycle events
///
/// Implementations must not block; hand long-running work (including sends)
/// to a task.
pub trait ServerEvents: Send + Sync + 'static {
    /// A client completed the handshake. Fires once, before any message.
    fn client_connected(&self, client: &Client);

    /// A registered client went away. Fires exactly once per client.
    fn client_left(&self, client: &Client);

    /// A text message arrived from `client`.
    fn message_received(&self, client: &Client, message: String);
}

type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a client socket
///
/// Frames are written whole under a per-client lock, so concurrent unicast,
/// broadcast and control replies never interleave on the wire. Waiting for
/// the lock and writing together are bounded by the write timeout; a peer
/// that stops reading yields `TimedOut` instead of stalling the caller.
#[derive(Clone)]
pub struct ClientHandle {
    sink: Arc<Mutex<BoxedSink>>,
    write_timeout: Duration,
}

impl ClientHandle {
    /// Wrap the write half of a connection
    pub fn new<W>(writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
            write_timeout,
        }
    }

    /// Write one encoded frame and flush it
    pub async fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        self.bounded(async {
            let mut sink = self.sink.lock().await;
            sink.write_all(frame).await?;
            sink.flush().await
        })
        .await
    }

    /// Shut down the write side of the socket
    pub async fn close(&self) -> std::io::Result<()> {
        self.bounded(async { self.sink.lock().await.shutdown().await })
            .await
    }

    async fn bounded<F>(&self, op: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = std::io::Result<()>>,
    {
        match tokio::time::timeout(self.write_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("write did not complete within {:?}", self.write_timeout),
            )),
        }
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle").finish_non_exhaustive()
    }
}

/// Immutable view of a registered client plus a handle for sending to it
#[derive(Debug, Clone)]
pub struct Client {
    id: u64,
    addr: SocketAddr,
    handle: ClientHandle,
}

impl Client {
    /// Id assigned at registration, starting at 1
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address of the client
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn handle(&self) -> &ClientHandle {
        &self.handle
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {} ({})", self.id, self.addr)
    }
}

#[derive(Default)]
struct Clients {
    next_id: u64,
    entries: HashMap<u64, Client>,
}

/// Registry of connected clients
pub struct Registry {
    clients: Mutex<Clients>,
    events: Arc<dyn ServerEvents>,
}

impl Registry {
    /// Create an empty registry that reports to `events`
    pub fn new(events: Arc<dyn ServerEvents>) -> Self {
        Self {
            clients: Mutex::new(Clients::default()),
            events,
        }
    }

    /// Register a client that completed its handshake
    ///
    /// Assigns the next id and fires `client_connected`.
    pub async fn register(&self, addr: SocketAddr, handle: ClientHandle) -> Client {
        let client = {
            let mut clients = self.clients.lock().await;
            clients.next_id += 1;
            let client = Client {
                id: clients.next_id,
                addr,
                handle,
            };
            clients.entries.insert(client.id, client.clone());
            client
        };

        info!("New client connected: {}", client);
        self.events.client_connected(&client);
        client
    }

    /// Remove a client and fire `client_left`
    ///
    /// Returns false, firing nothing, if the client was already removed.
    pub async fn deregister(&self, id: u64) -> bool {
        let removed = self.clients.lock().await.entries.remove(&id);

        match removed {
            Some(client) => {
                info!("Client left: {}", client);
                self.events.client_left(&client);
                true
            }
            None => false,
        }
    }

    /// Hand an inbound text message to the embedding application
    ///
    /// Messages from a client that was already deregistered are dropped and
    /// `false` is returned.
    pub async fn message_received(&self, client: &Client, message: String) -> bool {
        if !self.contains(client.id).await {
            debug!("Dropping message from deregistered {}", client);
            return false;
        }

        debug!("Message from {}: {} bytes", client, message.len());
        self.events.message_received(client, message);
        true
    }

    /// Check whether a client is still registered
    pub async fn contains(&self, id: u64) -> bool {
        self.clients.lock().await.entries.contains_key(&id)
    }

    /// True if at least one client is registered
    pub async fn has_clients(&self) -> bool {
        !self.clients.lock().await.entries.is_empty()
    }

    /// Number of registered clients
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.entries.len()
    }

    /// Snapshot of the registered clients
    pub async fn clients(&self) -> Vec<Client> {
        self.clients.lock().await.entries.values().cloned().collect()
    }

    /// Send a text message to one client
    ///
    /// Fails with [`SendError::ClientGone`] if the client was deregistered
    /// and with [`FrameError::Encoding`] if `message` is not UTF-8. Neither
    /// affects the connection.
    pub async fn send_message(
        &self,
        client: &Client,
        message: impl AsRef<[u8]>,
    ) -> SendResult<()> {
        let frame = encode_text(message.as_ref())?;

        if !self.contains(client.id).await {
            return Err(SendError::ClientGone(client.id));
        }

        client.handle.write_frame(&frame).await?;
        Ok(())
    }

    /// Send a text message to every registered client
    ///
    /// Per-client failures are logged and the failing client is deregistered;
    /// the remaining clients still receive the message. Returns the number of
    /// clients the message was delivered to.
    pub async fn send_message_to_all(&self, message: impl AsRef<[u8]>) -> SendResult<usize> {
        let frame = encode_text(message.as_ref())?;
        let targets = self.clients().await;

        let mut delivered = 0;
        for client in targets {
            match client.handle.write_frame(&frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", client, e);
                    self.deregister(client.id).await;
                }
            }
        }

        debug!("Broadcast delivered to {} clients", delivered);
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{Event, Recorder};
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    async fn connect(registry: &Registry, port: u16) -> (Client, DuplexStream) {
        let (peer, local) = tokio::io::duplex(1024);
        let client = registry
            .register(addr(port), ClientHandle::new(local, WRITE_TIMEOUT))
            .await;
        (client, peer)
    }

    async fn read_bytes(peer: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        peer.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_register_assigns_sequential_ids() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(recorder.clone());
        assert!(!registry.has_clients().await);

        let (first, _p1) = connect(&registry, 5001).await;
        let (second, _p2) = connect(&registry, 5002).await;

        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(second.addr(), addr(5002));
        assert!(registry.has_clients().await);
        assert_eq!(registry.client_count().await, 2);
        assert_eq!(
            recorder.events(),
            vec![Event::Connected(1), Event::Connected(2)]
        );
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(recorder.clone());
        let (client, _peer) = connect(&registry, 5001).await;

        assert!(registry.deregister(client.id()).await);
        assert!(!registry.deregister(client.id()).await);

        assert!(!registry.has_clients().await);
        assert_eq!(
            recorder.events(),
            vec![Event::Connected(1), Event::Left(1)]
        );
    }

    #[tokio::test]
    async fn test_unicast_wire_bytes() {
        let registry = Registry::new(Arc::new(Recorder::default()));
        let (client, mut peer) = connect(&registry, 5001).await;

        registry.send_message(&client, "Hi").await.unwrap();
        assert_eq!(read_bytes(&mut peer, 4).await, vec![0x81, 0x02, b'H', b'i']);
    }

    #[tokio::test]
    async fn test_unicast_to_gone_client() {
        let registry = Registry::new(Arc::new(Recorder::default()));
        let (client, _peer) = connect(&registry, 5001).await;
        registry.deregister(client.id()).await;

        let err = registry.send_message(&client, "Hi").await.unwrap_err();
        assert!(matches!(err, SendError::ClientGone(1)));
    }

    #[tokio::test]
    async fn test_unicast_invalid_utf8_keeps_client() {
        let registry = Registry::new(Arc::new(Recorder::default()));
        let (client, _peer) = connect(&registry, 5001).await;

        let err = registry
            .send_message(&client, [0xffu8, 0xfe])
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Frame(FrameError::Encoding(_))));
        assert!(registry.contains(client.id()).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let registry = Registry::new(Arc::new(Recorder::default()));
        let (_c1, mut p1) = connect(&registry, 5001).await;
        let (_c2, mut p2) = connect(&registry, 5002).await;

        let delivered = registry.send_message_to_all("Hi").await.unwrap();
        assert_eq!(delivered, 2);
        for peer in [&mut p1, &mut p2] {
            assert_eq!(read_bytes(peer, 4).await, vec![0x81, 0x02, b'H', b'i']);
        }
    }

    #[tokio::test]
    async fn test_broadcast_with_concurrent_disconnect() {
        let recorder = Arc::new(Recorder::default());
        let registry = Arc::new(Registry::new(recorder.clone()));
        let (_c1, mut p1) = connect(&registry, 5001).await;
        let (c2, p2) = connect(&registry, 5002).await;
        let (_c3, mut p3) = connect(&registry, 5003).await;

        // The peer socket is gone; writes to it fail with BrokenPipe.
        drop(p2);

        let leaving = {
            let registry = Arc::clone(&registry);
            let id = c2.id();
            tokio::spawn(async move { registry.deregister(id).await })
        };
        let delivered = registry.send_message_to_all("tick").await.unwrap();
        leaving.await.unwrap();

        assert_eq!(delivered, 2);
        assert!(!registry.contains(c2.id()).await);
        assert_eq!(registry.client_count().await, 2);
        for peer in [&mut p1, &mut p3] {
            assert_eq!(read_bytes(peer, 6).await, b"\x81\x04tick".to_vec());
        }
        let left: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|event| matches!(event, Event::Left(_)))
            .collect();
        assert_eq!(left, vec![Event::Left(2)]);
    }

    #[tokio::test]
    async fn test_broadcast_drops_failing_client() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(recorder.clone());
        let (_c1, mut p1) = connect(&registry, 5001).await;
        let (c2, p2) = connect(&registry, 5002).await;
        drop(p2);

        let delivered = registry.send_message_to_all("Hi").await.unwrap();
        assert_eq!(delivered, 1);
        assert!(!registry.contains(c2.id()).await);
        assert_eq!(read_bytes(&mut p1, 4).await, vec![0x81, 0x02, b'H', b'i']);
        assert!(recorder.events().contains(&Event::Left(2)));
    }

    #[tokio::test]
    async fn test_message_received_dispatch() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(recorder.clone());
        let (client, _peer) = connect(&registry, 5001).await;

        assert!(registry.message_received(&client, "hello".to_string()).await);
        assert_eq!(
            recorder.events(),
            vec![Event::Connected(1), Event::Message(1, "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_no_message_after_client_left() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(recorder.clone());
        let (client, _peer) = connect(&registry, 5001).await;
        registry.deregister(client.id()).await;

        assert!(!registry.message_received(&client, "late".to_string()).await);
        assert_eq!(
            recorder.events(),
            vec![Event::Connected(1), Event::Left(1)]
        );
    }

    #[tokio::test]
    async fn test_broadcast_drops_client_that_stops_reading() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(recorder.clone());
        let (_c1, mut p1) = connect(&registry, 5001).await;

        // Peer never reads and its buffer is smaller than one frame.
        let (_stalled_peer, local) = tokio::io::duplex(8);
        let stalled = registry
            .register(
                addr(5002),
                ClientHandle::new(local, Duration::from_millis(100)),
            )
            .await;

        let message = "x".repeat(64);
        let delivered = tokio::time::timeout(
            Duration::from_secs(2),
            registry.send_message_to_all(&message),
        )
        .await
        .expect("broadcast stalled on a peer that stopped reading")
        .unwrap();

        assert_eq!(delivered, 1);
        assert!(!registry.contains(stalled.id()).await);
        assert_eq!(read_bytes(&mut p1, 66).await[2..], *message.as_bytes());
        assert!(recorder.events().contains(&Event::Left(2)));
    }
}
