//! Shared domain model for the HAProxy fleet-sync reconciler.
//!
//! Kept in its own crate so the reconciliation core and the daemon binary
//! can both depend on one definition of `Instance`/`Service`/`BackendState`
//! without a dependency cycle.

pub mod models;

pub use models::*;
