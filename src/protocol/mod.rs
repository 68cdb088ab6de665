//! WebSocket wire protocol
//!
//! Frame encoding/decoding and the HTTP upgrade handshake. Nothing in here
//! knows about clients or the registry; it only turns bytes into frames and
//! back.

pub mod frame;
pub mod handshake;

pub use frame::*;
pub use handshake::*;
