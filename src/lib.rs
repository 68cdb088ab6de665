//! wsrelay
//!
//! A minimal RFC 6455 WebSocket server built directly on TCP sockets.
//!
//! ```text
//! TcpListener ─accept─▶ Connection task ─handshake─▶ Registry::register
//!                              │                         (client_connected)
//!                              ├─ text ─▶ message_received
//!                              ├─ ping ─▶ pong
//!                              └─ close / error / EOF ─▶ Registry::deregister
//!                                                          (client_left)
//! ```
//!
//! The embedding application implements [`ServerEvents`] and sends through
//! [`WebSocketServer::send_message`] and [`WebSocketServer::send_message_to_all`].
//! Extensions, fragmentation, binary frames and TLS are not supported.

pub mod config;
pub mod protocol;
pub mod relay;
pub mod server;

pub use config::ServerConfig;
pub use server::{Client, Registry, SendError, ServerEvents, WebSocketServer};
