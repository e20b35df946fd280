//! Connection identity, per-connection contexts, and the live session directory.

pub mod context;
pub mod directory;
mod id;

pub use context::{
    ConnectionContext, ContextCommand, ContextDiscovery, ContextHandle, FrameSink,
};
pub use directory::{SessionDirectory, SessionView};
pub use id::ConnectionId;
