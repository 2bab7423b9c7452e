//! In-memory catalog for tests and local runs.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{BackendRecord, Catalog};

/// Catalog backed by a mutex-guarded map. Ids iterate in ascending order
/// by construction (`BTreeMap`), matching the Postgres ordering contract.
#[derive(Default)]
pub struct MemoryCatalog {
    records: Mutex<BTreeMap<i32, BackendRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the catalog with the given records.
    pub fn with_records(records: Vec<BackendRecord>) -> Self {
        let catalog = Self::new();
        {
            let mut map = catalog.records.lock();
            for record in records {
                map.insert(record.id, record);
            }
        }
        catalog
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: BackendRecord) {
        self.records.lock().insert(record.id, record);
    }

    /// Current state of one record, if present.
    pub fn get(&self, id: i32) -> Option<BackendRecord> {
        self.records.lock().get(&id).cloned()
    }

    fn list_where(&self, active: bool) -> Vec<BackendRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.is_active == active)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn list_active(&self) -> Result<Vec<BackendRecord>> {
        Ok(self.list_where(true))
    }

    async fn list_inactive(&self) -> Result<Vec<BackendRecord>> {
        Ok(self.list_where(false))
    }

    async fn set_active(&self, id: i32, active: bool) -> Result<()> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&id) else {
            bail!("no such server: {id}");
        };
        record.is_active = active;
        record.updated_at = Utc::now();
        Ok(())
    }
}
