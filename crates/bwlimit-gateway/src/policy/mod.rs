//! Persisted bandwidth policy: one default limit plus sparse per-connection
//! overrides.

pub mod store;

pub use store::{AliasResolver, NoAliases, PolicyFile, PolicyStore};
