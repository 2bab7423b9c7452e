//! Active-backend cache and dispatch scheduling.
//!
//! The cache owns a weighted ring of [`Node`]s built from the catalog's
//! active set. Dispatch walks the ring cursor; rate admission is decided
//! per node by its token bucket; deactivated nodes are evicted lazily as
//! the cursor passes their slots. A background reconciler rebuilds the
//! ring when the catalog's active set changes shape.
//!
//! Locking: one mutex owns the ring structure and cursor and is never held
//! across await points; node activity is an atomic flag read through the
//! shared `Arc`, so a flip needs no ring lock and is observed by every
//! slot at once.

pub mod bucket;
pub mod ring;
pub mod wrr;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::catalog::{BackendRecord, Catalog};
use bucket::TokenBucket;
use ring::Ring;

/// Runtime pairing of a catalog record with its admission state: the
/// activity flag and the token bucket sized from the record's limits.
pub struct Node {
    record: BackendRecord,
    active: AtomicBool,
    bucket: TokenBucket,
}

impl Node {
    pub fn new(record: BackendRecord) -> Self {
        let bucket = TokenBucket::new(
            record.rate_limit.max(1) as u32,
            record.burst_limit.max(1) as u32,
        );
        Self {
            active: AtomicBool::new(record.is_active),
            bucket,
            record,
        }
    }

    pub fn id(&self) -> i32 {
        self.record.id
    }

    pub fn url(&self) -> &str {
        &self.record.url
    }

    pub fn rate_limit(&self) -> u32 {
        self.record.rate_limit.max(1) as u32
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Try to take one rate-limit token.
    pub fn admit(&self) -> bool {
        self.bucket.allow()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.record.id)
            .field("url", &self.record.url)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Shared cache of active backends behind the dispatch fast path.
pub struct BackendCache {
    ring: Mutex<Ring<Arc<Node>>>,
}

impl BackendCache {
    /// Build the cache from a catalog snapshot of active backends.
    pub fn new(records: Vec<BackendRecord>) -> Self {
        let nodes: Vec<Arc<Node>> = records
            .into_iter()
            .map(|r| Arc::new(Node::new(r)))
            .collect();
        Self {
            ring: Mutex::new(wrr::build_ring(&nodes)),
        }
    }

    /// Next active node in schedule order, or `None` when no active node
    /// remains.
    ///
    /// Any run of inactive slots under the cursor is unlinked before a
    /// node is picked, so a deactivated backend disappears from the ring
    /// after at most one full lap. Each loop iteration either returns an
    /// active node or strictly shrinks the ring.
    pub fn next_active(&self) -> Option<Arc<Node>> {
        let mut ring = self.ring.lock();
        loop {
            let active = match ring.current() {
                None => return None,
                Some(node) => node.is_active(),
            };
            if active {
                return ring.advance();
            }
            ring.remove_current();
        }
    }

    /// Mark a backend inactive. Every ring slot references the same node,
    /// so the flip is visible to all future probes; the slots themselves
    /// are evicted lazily by `next_active`.
    pub fn deactivate(&self, node: &Node) {
        node.set_active(false);
    }

    /// Mark a backend active again. If the backend has no slot left in the
    /// ring, the ring is rebuilt immediately from the live node set plus
    /// the newcomer rather than waiting for the next reconciler tick.
    pub fn activate(&self, record: &BackendRecord) {
        let mut ring = self.ring.lock();

        let existing = ring.iter().find(|n| n.id() == record.id).cloned();
        if let Some(node) = existing {
            node.set_active(true);
            return;
        }

        let mut nodes = distinct_active_nodes(&ring);
        let node = Arc::new(Node::new(record.clone()));
        node.set_active(true);
        nodes.push(node);
        *ring = wrr::build_ring(&nodes);
    }

    /// Rebuild the ring from a fresh active-set snapshot when the set has
    /// changed shape.
    ///
    /// Shape means backend count only: a same-sized snapshot is a no-op
    /// even if URLs or limits of individual backends changed. Activity
    /// flips are made on the live nodes and the ring catches up lazily, so
    /// the count is the only thing left that can drift.
    pub fn reconcile(&self, snapshot: Vec<BackendRecord>) -> bool {
        let mut ring = self.ring.lock();
        if snapshot.len() == count_distinct(&ring) {
            return false;
        }
        let nodes: Vec<Arc<Node>> = snapshot
            .into_iter()
            .map(|r| Arc::new(Node::new(r)))
            .collect();
        *ring = wrr::build_ring(&nodes);
        true
    }

    /// Look up a node by backend id.
    pub fn find(&self, id: i32) -> Option<Arc<Node>> {
        self.ring.lock().iter().find(|n| n.id() == id).cloned()
    }

    /// Number of ring slots (weighted).
    pub fn slot_count(&self) -> usize {
        self.ring.lock().len()
    }

    /// Number of distinct backends represented in the ring.
    pub fn backend_count(&self) -> usize {
        count_distinct(&self.ring.lock())
    }
}

fn distinct_active_nodes(ring: &Ring<Arc<Node>>) -> Vec<Arc<Node>> {
    let mut nodes: Vec<Arc<Node>> = Vec::new();
    for node in ring.iter() {
        if node.is_active() && !nodes.iter().any(|n| n.id() == node.id()) {
            nodes.push(Arc::clone(node));
        }
    }
    nodes
}

fn count_distinct(ring: &Ring<Arc<Node>>) -> usize {
    let mut seen: Vec<i32> = Vec::new();
    for node in ring.iter() {
        if !seen.contains(&node.id()) {
            seen.push(node.id());
        }
    }
    seen.len()
}

/// Periodically pull the active set from the catalog and reconcile the
/// cache. Catalog failures are logged and retried on the next tick; the
/// cache keeps serving its last-known state in the meantime.
pub async fn run_reconciler(
    cache: Arc<BackendCache>,
    catalog: Arc<dyn Catalog>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the cache was just built from the
    // same snapshot, so skip it.
    ticker.tick().await;

    info!(period_secs = period.as_secs(), "cache reconciler started");
    loop {
        tokio::select! {
            _ = ticker.tick() => match catalog.list_active().await {
                Ok(snapshot) => {
                    let size = snapshot.len();
                    if cache.reconcile(snapshot) {
                        info!(active_backends = size, "rebuilt dispatch ring");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "catalog refresh failed, serving last-known set");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}
