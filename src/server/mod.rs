//! WebSocket server module
//!
//! Accepts TCP connections, upgrades them to WebSocket, tracks live clients
//! and routes their messages to the embedding application.

mod connection;
mod registry;
mod websocket;

#[cfg(test)]
mod testing;

pub use connection::*;
pub use registry::*;
pub use websocket::*;
