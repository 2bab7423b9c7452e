//! relayd - a weighted round-robin HTTP load balancer for RPC backends.
//!
//! Requests are dispatched over a ring of active backends in proportion to
//! each backend's rate limit, with per-backend token-bucket admission and
//! a bounded retry loop. A Postgres catalog is the source of truth for the
//! fleet; a reconciler keeps the in-memory ring in step with it, and a
//! health prober returns recovered backends to rotation.
//!
//! The crate is a library plus a thin binary: integration tests boot the
//! same server the binary runs, against an in-memory catalog.

pub mod auth;
pub mod balance;
pub mod catalog;
pub mod config;
pub mod metrics;
pub mod prober;
pub mod server;

pub use balance::{BackendCache, Node, run_reconciler};
pub use catalog::{BackendRecord, Catalog, MemoryCatalog, PgCatalog};
pub use config::{BalancerMode, HealthConfig, Settings};
pub use prober::HealthProber;
pub use server::{SharedState, serve};
