//! Per-connection handler
//!
//! Drives one accepted socket through `Accepted → Handshaking → Active →
//! Closed`. Frames are read and dispatched strictly in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::registry::{Client, ClientHandle, Registry};
use crate::config::ServerConfig;
use crate::protocol::{
    close_code, encode_close, encode_frame, handshake, read_frame, Frame, FrameError, Opcode,
};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Active,
    Closed,
}

/// Why the frame loop stopped
#[derive(Debug)]
enum CloseReason {
    /// Peer sent a close frame
    Requested,
    /// Peer went away without a close frame
    Disconnected,
    /// Server is shutting down
    Shutdown,
    /// Decode failure or write error
    Error,
    /// Client was removed from the registry by a failed send
    Deregistered,
}

/// Handles a single client connection
pub struct Connection {
    addr: SocketAddr,
    state: ConnectionState,
    registry: Arc<Registry>,
    max_payload_size: usize,
    max_handshake_size: usize,
    write_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Connection {
    /// Create a handler for a freshly accepted socket
    pub fn new(
        addr: SocketAddr,
        registry: Arc<Registry>,
        config: &ServerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            addr,
            state: ConnectionState::Accepted,
            registry,
            max_payload_size: config.max_payload_size,
            max_handshake_size: config.max_handshake_size,
            write_timeout: config.write_timeout(),
            shutdown_rx,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection to completion
    ///
    /// Returns the final state, which is always [`ConnectionState::Closed`].
    pub async fn run<S>(mut self, mut stream: S) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.state = ConnectionState::Handshaking;
        debug!("Handshaking with {}", self.addr);

        let result = tokio::select! {
            result = handshake::negotiate(&mut stream, self.max_handshake_size) => result,
            _ = shutdown_requested(&mut self.shutdown_rx) => {
                debug!("Shutdown during handshake with {}", self.addr);
                self.state = ConnectionState::Closed;
                return self.state;
            }
        };

        if let Err(e) = result {
            warn!("Handshake with {} failed: {}", self.addr, e);
            self.state = ConnectionState::Closed;
            return self.state;
        }

        let (mut reader, writer) = tokio::io::split(stream);
        let client = self
            .registry
            .register(self.addr, ClientHandle::new(writer, self.write_timeout))
            .await;
        self.state = ConnectionState::Active;

        let reason = self.read_loop(&client, &mut reader).await;
        debug!("Frame loop for {} stopped: {:?}", client, reason);

        let _ = client.handle().close().await;
        self.registry.deregister(client.id()).await;
        self.state = ConnectionState::Closed;
        self.state
    }

    async fn read_loop<R>(&mut self, client: &Client, reader: &mut R) -> CloseReason
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let result = tokio::select! {
                result = read_frame(reader, self.max_payload_size) => result,
                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    info!("Shutdown signal received, closing {}", client);
                    send_close(client, close_code::GOING_AWAY).await;
                    return CloseReason::Shutdown;
                }
            };

            match result {
                Ok(frame) => {
                    // Replies can stall on a peer that stops reading, so the
                    // shutdown signal is watched while dispatching too.
                    let outcome = tokio::select! {
                        outcome = dispatch(&self.registry, client, frame) => outcome,
                        _ = shutdown_requested(&mut self.shutdown_rx) => {
                            info!("Shutdown signal received, closing {}", client);
                            send_close(client, close_code::GOING_AWAY).await;
                            return CloseReason::Shutdown;
                        }
                    };
                    if let Some(reason) = outcome {
                        return reason;
                    }
                }
                Err(e) if e.is_connection_closed() => {
                    info!("{} closed the connection", client);
                    return CloseReason::Disconnected;
                }
                Err(e @ (FrameError::Protocol(_) | FrameError::UnsupportedFrame(_))) => {
                    warn!("Dropping {}: {}", client, e);
                    send_close(client, e.close_code()).await;
                    return CloseReason::Error;
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", client, e);
                    return CloseReason::Error;
                }
            }
        }
    }
}

/// Handle one decoded frame; `Some` ends the loop
async fn dispatch(registry: &Registry, client: &Client, frame: Frame) -> Option<CloseReason> {
    match frame.opcode {
        Opcode::Text => match frame.into_text() {
            Ok(text) => {
                if registry.message_received(client, text).await {
                    None
                } else {
                    Some(CloseReason::Deregistered)
                }
            }
            Err(e) => {
                warn!("Dropping {}: {}", client, e);
                send_close(client, close_code::INVALID_PAYLOAD).await;
                Some(CloseReason::Error)
            }
        },
        Opcode::Ping => {
            debug!("Ping from {} ({} bytes)", client, frame.payload.len());
            let pong = match encode_frame(Opcode::Pong, &frame.payload) {
                Ok(pong) => pong,
                Err(e) => {
                    warn!("Cannot answer ping from {}: {}", client, e);
                    return Some(CloseReason::Error);
                }
            };
            match client.handle().write_frame(&pong).await {
                Ok(()) => None,
                Err(e) => {
                    warn!("Pong to {} failed: {}", client, e);
                    Some(CloseReason::Error)
                }
            }
        }
        Opcode::Pong => None,
        Opcode::Close => {
            info!("{} asked to close the connection", client);
            // Echo the status code back, or send an empty close frame.
            let status = frame.payload.get(..2).unwrap_or_default();
            if let Ok(reply) = encode_frame(Opcode::Close, status) {
                let _ = client.handle().write_frame(&reply).await;
            }
            Some(CloseReason::Requested)
        }
        Opcode::Binary | Opcode::Continuation => {
            warn!("Unexpected {} frame from {}", frame.opcode, client);
            send_close(client, close_code::UNSUPPORTED_DATA).await;
            Some(CloseReason::Error)
        }
    }
}

/// Resolves once the server asks connections to stop
///
/// A dropped sender counts as a shutdown request.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn send_close(client: &Client, code: u16) {
    if let Ok(frame) = encode_close(code) {
        if let Err(e) = client.handle().write_frame(&frame).await {
            debug!("Close frame to {} not sent: {}", client, e);
        }
    }
}
