//! Transport layer (WebSocket).
//!
//! Exposes the WS upgrade handler. Every accepted socket gets a connection
//! context that owns its shaped outbound path.

pub mod ws;
