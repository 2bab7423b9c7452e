//! Postgres catalog driver.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row};
use tracing::error;

use super::{BackendRecord, Catalog};

const SELECT_COLUMNS: &str =
    "SELECT id, url, rate_limit, burst_limit, is_active, created_at, updated_at FROM servers";

/// Catalog backed by a single pipelined Postgres connection.
pub struct PgCatalog {
    client: Client,
}

impl PgCatalog {
    /// Connect and spawn the connection driver task. The task logs and
    /// exits if the connection drops; subsequent queries then fail and are
    /// handled by the callers (the reconciler retries on its next tick).
    pub async fn connect(postgres_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(postgres_url, NoTls)
            .await
            .context("failed to connect to postgres")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });

        Ok(Self { client })
    }

    async fn list_where(&self, active: bool) -> Result<Vec<BackendRecord>> {
        let query = format!("{SELECT_COLUMNS} WHERE is_active = $1 ORDER BY id ASC");
        let rows = self
            .client
            .query(query.as_str(), &[&active])
            .await
            .context("failed to query servers")?;
        Ok(rows.iter().map(record_from_row).collect())
    }
}

fn record_from_row(row: &Row) -> BackendRecord {
    BackendRecord {
        id: row.get("id"),
        url: row.get("url"),
        rate_limit: row.get("rate_limit"),
        burst_limit: row.get("burst_limit"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn list_active(&self) -> Result<Vec<BackendRecord>> {
        self.list_where(true).await
    }

    async fn list_inactive(&self) -> Result<Vec<BackendRecord>> {
        self.list_where(false).await
    }

    async fn set_active(&self, id: i32, active: bool) -> Result<()> {
        self.client
            .execute(
                "UPDATE servers SET is_active = $1, updated_at = now() WHERE id = $2",
                &[&active, &id],
            )
            .await
            .with_context(|| format!("failed to update server {id}"))?;
        Ok(())
    }
}
