//! bwlimit core: transport-agnostic shaping primitives and error types.
//!
//! This crate holds the per-connection traffic accounting and the outbound
//! write shaper used by the gateway. It carries no runtime or transport
//! dependencies: every time-dependent operation takes `now` explicitly, so the
//! owner (a connection context) decides when windows roll and queued writes
//! are released.
//!
//! # Panic policy
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! All fallible paths surface as `BwError`/`Result`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod limit;
pub mod shaping;

/// Shared result type.
pub use error::{BwError, ErrorKind, Result};
pub use limit::BandwidthLimit;
pub use shaping::{Released, ShapingStage, TrafficCounter};
