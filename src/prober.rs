//! Health probing of inactive backends.
//!
//! A backend that was pulled out of rotation stays in the catalog with
//! `is_active = false`. On every tick the prober sweeps those rows, sends
//! each backend the configured probe request, and reactivates the ones
//! that answer 200: first in the catalog, then in the dispatch cache so
//! traffic resumes without waiting for the next reconcile.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::balance::BackendCache;
use crate::catalog::Catalog;
use crate::config::{HealthCheck, ProbeMethod};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodic prober over the catalog's inactive set.
pub struct HealthProber {
    catalog: Arc<dyn Catalog>,
    cache: Arc<BackendCache>,
    client: reqwest::Client,
    method: ProbeMethod,
    body: serde_json::Value,
    period: Duration,
}

impl HealthProber {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cache: Arc<BackendCache>,
        config: &HealthCheck,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("failed to build health probe client")?;

        Ok(Self {
            catalog,
            cache,
            client,
            method: config.request.method,
            body: config.request.body.clone(),
            period: config.interval.period(),
        })
    }

    /// Run sweeps on the configured interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick; backends start in the state the
        // catalog reported at boot.
        ticker.tick().await;

        info!(period_secs = self.period.as_secs(), "health prober started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One pass over the inactive backends. Probe failures and catalog
    /// errors never abort the sweep.
    pub async fn sweep(&self) {
        let inactive = match self.catalog.list_inactive().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to list inactive backends");
                return;
            }
        };

        for record in inactive {
            if !self.probe(&record.url).await {
                continue;
            }

            info!(backend = %record.url, node_id = record.id, "backend recovered, reactivating");
            if let Err(e) = self.catalog.set_active(record.id, true).await {
                warn!(
                    backend = %record.url,
                    error = %e,
                    "failed to persist backend reactivation"
                );
            }
            self.cache.activate(&record);
        }
    }

    async fn probe(&self, url: &str) -> bool {
        let method = match self.method {
            ProbeMethod::Get => reqwest::Method::GET,
            ProbeMethod::Post => reqwest::Method::POST,
        };

        match self.client.request(method, url).json(&self.body).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(backend = %url, error = %e, "health probe failed");
                false
            }
        }
    }
}
