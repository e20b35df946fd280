//! Top-level facade crate for bwlimit.
//!
//! Re-exports the shaping primitives and the gateway library so users can depend on a single crate.

pub mod core {
    pub use bwlimit_core::*;
}

pub mod gateway {
    pub use bwlimit_gateway::*;
}
