//! Relay application
//!
//! The embedding application run by the `wsrelay` binary. Every text message
//! received from a client is broadcast to all connected clients, or echoed
//! back to the sender only in echo mode.
//!
//! Callbacks run on connection tasks and must not block, so messages are
//! queued on a channel and sent by [`forward`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::{Client, ServerEvents, WebSocketServer};

/// An outgoing message queued by the relay
#[derive(Debug)]
pub enum Outbound {
    /// Send to every connected client
    Broadcast(String),
    /// Send back to one client
    Reply(Client, String),
}

/// [`ServerEvents`] implementation that relays messages between clients
pub struct Relay {
    echo: bool,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
}

impl Relay {
    /// Create a relay and the receiving end of its outbound queue
    pub fn new(echo: bool) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (Self { echo, outbound_tx }, outbound_rx)
    }

    fn queue(&self, outbound: Outbound) {
        if self.outbound_tx.send(outbound).is_err() {
            debug!("Relay queue closed, dropping message");
        }
    }
}

impl ServerEvents for Relay {
    fn client_connected(&self, client: &Client) {
        info!("Relay: {} joined", client);
    }

    fn client_left(&self, client: &Client) {
        info!("Relay: {} left", client);
    }

    fn message_received(&self, client: &Client, message: String) {
        if self.echo {
            self.queue(Outbound::Reply(client.clone(), message));
        } else {
            self.queue(Outbound::Broadcast(message));
        }
    }
}

/// Drain the relay queue into `server` until every sender is gone
pub async fn forward(
    server: Arc<WebSocketServer>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Broadcast(message) => {
                if let Err(e) = server.send_message_to_all(&message).await {
                    warn!("Broadcast failed: {}", e);
                }
            }
            Outbound::Reply(client, message) => {
                if let Err(e) = server.send_message(&client, &message).await {
                    warn!("Reply to {} failed: {}", client, e);
                }
            }
        }
    }
}
