//! bwlimit gateway library entry.
//!
//! A WebSocket relay whose every connection writes through a shaped outbound
//! pipeline. This crate wires the per-connection contexts, the bandwidth
//! manager, the persisted policy store, and the HTTP admin and ops surfaces.
//! It is consumed by the binary (`main.rs`) and by integration tests.

pub mod admin;
pub mod app_state;
pub mod bandwidth;
pub mod config;
pub mod obs;
pub mod ops;
pub mod pipeline;
pub mod policy;
pub mod router;
pub mod session;
pub mod transport;
