//! Outbound pipeline of one connection and the attachment seams used by the
//! bandwidth manager.
//!
//! The manager never touches a pipeline directly. It goes through
//! [`ConnectionDiscovery`] to obtain an [`AttachablePipeline`] for a
//! connection handle, and every call on that is marshalled onto the owning
//! connection context.

mod outbound;

use std::sync::Arc;

use axum::extract::ws::Message;

use bwlimit_core::error::Result;
use bwlimit_core::ShapingStage;

pub use outbound::{frame_len, wire_len, Delivery, OutboundPipeline};

/// Name of the marker slot after which byte counts equal wire size.
pub const ENCODER: &str = "encoder";

/// Shaping stage specialised to WebSocket frames.
pub type OutboundStage = ShapingStage<Message>;

/// A connection's outbound path, seen from outside its context.
///
/// All calls are fire-and-forget: they are queued onto the connection
/// context and take effect shortly after. They fail with
/// `ConnectionUnavailable` once the context is gone.
pub trait AttachablePipeline: Send + Sync {
    /// Insert (or replace) a named stage. Placed after [`ENCODER`] when the
    /// pipeline has one, otherwise at the front.
    fn insert_stage(&self, name: &str, stage: OutboundStage) -> Result<()>;
    fn remove_stage(&self, name: &str) -> Result<()>;
    fn set_write_limit(&self, name: &str, limit: u64) -> Result<()>;
    fn set_read_limit(&self, name: &str, limit: u64) -> Result<()>;
    /// Identity of the underlying outbound path.
    fn pipeline_key(&self) -> u64;
}

/// Finds the attachable outbound path behind a host connection handle.
pub trait ConnectionDiscovery: Send + Sync {
    type Handle: Clone + Send + Sync + 'static;

    fn resolve_outbound(&self, handle: &Self::Handle) -> Option<Arc<dyn AttachablePipeline>>;
}
