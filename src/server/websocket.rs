//! WebSocket server implementation
//!
//! Provides a WebSocket server that listens on a configurable address, spawns
//! a task per accepted connection and exposes unicast/broadcast sends to the
//! embedding application.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::connection::{shutdown_requested, Connection};
use super::registry::{Client, Registry, SendResult, ServerEvents};
use crate::config::ServerConfig;

/// WebSocket server for handling client connections
pub struct WebSocketServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    shutdown_tx: watch::Sender<bool>,
}

impl WebSocketServer {
    /// Create a new WebSocket server reporting to `events`
    pub fn new(config: ServerConfig, events: Arc<dyn ServerEvents>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(Registry::new(events)),
            shutdown_tx,
        }
    }

    /// The server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The client registry
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Trigger server shutdown
    ///
    /// Stops accepting, then closes every connection; each registered client
    /// fires `client_left`.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Send a text message to one client
    pub async fn send_message(
        &self,
        client: &Client,
        message: impl AsRef<[u8]>,
    ) -> SendResult<()> {
        self.registry.send_message(client, message).await
    }

    /// Send a text message to every connected client
    pub async fn send_message_to_all(&self, message: impl AsRef<[u8]>) -> SendResult<usize> {
        self.registry.send_message_to_all(message).await
    }

    /// True if at least one client is connected
    pub async fn has_clients(&self) -> bool {
        self.registry.has_clients().await
    }

    /// Bind the configured listening socket
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.config.socket_addr();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Run the WebSocket server
    ///
    /// Binds the configured address and serves until [`shutdown`] is called.
    ///
    /// [`shutdown`]: WebSocketServer::shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    ///
    /// Returns once every connection task has finished.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!("WebSocket server listening on ws://{}", local_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted TCP connection from {}", peer_addr);
                            let connection = Connection::new(
                                peer_addr,
                                Arc::clone(&self.registry),
                                &self.config,
                                self.shutdown_tx.subscribe(),
                            );
                            connections.spawn(connection.run(stream));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connections
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        error!("Connection task failed: {}", e);
                    }
                }
                // Handle shutdown signal
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        drop(listener);

        if !connections.is_empty() {
            info!("Waiting for {} connections to close...", connections.len());
        }
        while let Some(result) = connections.join_next().await {
            if let Err(e) = result {
                error!("Connection task failed: {}", e);
            }
        }

        Ok(())
    }
}
