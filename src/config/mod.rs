//! Configuration module
//!
//! Server settings, loaded from an optional TOML file and overridden from the
//! command line.

mod server;

pub use server::*;
