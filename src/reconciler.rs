/// Reconciler
///
/// Background repair of the lookup tables and the payload blob store:
/// - tx_lookup rows pointing at missing transactions are removed
/// - transactions missing a lookup row get one backfilled
/// - payload blobs no event references (orphans from aborted windows) are
///   deleted after a grace period

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::IndexError;
use crate::store::{LookupRepairReport, Store};

/// Blobs younger than this are never reclaimed; their window may still be
/// mid-commit.
const BLOB_GRACE: Duration = Duration::from_secs(3600);

pub struct Reconciler {
    store: Arc<dyn Store>,
    interval: Duration,
    limit: u64,
}

impl Reconciler {
    pub fn new(settings: &Settings, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            interval: Duration::from_secs(settings.lookup_repair_interval_min * 60),
            limit: settings.lookup_repair_limit,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexError> {
        info!(interval_secs = self.interval.as_secs(), "reconciler starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(err) = self.run_once().await {
                warn!(error = %err, "reconciler pass failed");
            }
        }
    }

    /// One full pass; also what the repair-lookups tool invokes.
    pub async fn run_once(&self) -> Result<LookupRepairReport, IndexError> {
        let report = self.store.repair_lookups(self.limit).await?;
        if report != LookupRepairReport::default() {
            info!(
                deleted = report.dangling_lookups_deleted,
                backfilled = report.lookups_backfilled,
                "lookup repair applied"
            );
        }

        let reclaimed = self.store.reclaim_orphan_blobs(BLOB_GRACE).await?;
        if reclaimed > 0 {
            info!(reclaimed, "orphaned payload blobs deleted");
        }
        Ok(report)
    }
}
