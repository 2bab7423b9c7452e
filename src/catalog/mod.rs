//! Persistent backend catalog.
//!
//! The catalog is the source of truth for the backend fleet: identity,
//! origin URL, rate limits and the active flag. The balancer reads it at
//! startup and on every reconciler tick, and writes only the `is_active`
//! column. The [`Catalog`] trait keeps the storage pluggable:
//!
//! - [`PgCatalog`] - Postgres, the production store
//! - [`MemoryCatalog`] - in-process map for tests and local runs
//!
//! Implementations surface errors to the caller and never retry; retry
//! policy belongs to the loops that call them.

mod memory;
mod postgres;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the `servers` table.
///
/// Created and destroyed by an out-of-band administrator; the balancer
/// mutates only `is_active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    pub id: i32,
    /// Absolute origin URL of the backend.
    pub url: String,
    /// Admitted requests per second. Always >= 1.
    pub rate_limit: i32,
    /// Token-bucket burst size. Always >= 1.
    pub burst_limit: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Narrow, driver-agnostic interface to the backend catalog.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// All active backends, ordered by ascending id for determinism.
    async fn list_active(&self) -> Result<Vec<BackendRecord>>;

    /// All inactive backends, ordered by ascending id.
    async fn list_inactive(&self) -> Result<Vec<BackendRecord>>;

    /// Flip the active flag of one backend.
    async fn set_active(&self, id: i32, active: bool) -> Result<()>;
}
