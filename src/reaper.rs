/// Lease reaper
///
/// Periodically expires ACTIVE leases whose heartbeat stopped: the lease
/// turns FAILED and its attempt count goes up, making it claimable again.
/// At the attempt cap the range is poisoned: a FATAL indexing error is
/// recorded and the lease stays FAILED until an operator resolves it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::derivations::checkpoint_name;
use crate::error::IndexError;
use crate::metrics;
use crate::scheduler::MAX_LEASE_ATTEMPTS;
use crate::store::Store;
use crate::types::{IndexingErrorRecord, Severity};

const REAP_INTERVAL: Duration = Duration::from_secs(60);

pub struct LeaseReaper {
    store: Arc<dyn Store>,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexError> {
        info!("lease reaper starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexError::Cancelled),
                _ = tokio::time::sleep(REAP_INTERVAL) => {}
            }
            if let Err(err) = self.sweep().await {
                warn!(error = %err, "reaper sweep failed");
            }
        }
    }

    /// One sweep: every expired ACTIVE lease transitions to FAILED with
    /// attempt + 1; ranges at the cap are reported FATAL.
    pub async fn sweep(&self) -> Result<usize, IndexError> {
        let expired = self.store.expire_leases(Utc::now()).await?;
        for lease in &expired {
            metrics::LEASE_TRANSITIONS
                .with_label_values(&[lease.worker_type.as_str(), "FAILED"])
                .inc();
            if lease.attempt >= MAX_LEASE_ATTEMPTS {
                error!(
                    worker_type = %lease.worker_type,
                    from = lease.from_height,
                    attempt = lease.attempt,
                    "lease poisoned; operator intervention required"
                );
                let record = IndexingErrorRecord::new(
                    checkpoint_name(&lease.worker_type),
                    lease.from_height,
                    None,
                    &format!(
                        "lease [{}, {}) failed {} times and is no longer auto-reclaimed",
                        lease.from_height, lease.to_height, lease.attempt
                    ),
                    Severity::Fatal,
                );
                if let Err(record_err) = self.store.record_indexing_error(&record).await {
                    warn!(error = %record_err, "failed to record poisoned-lease error");
                }
            } else {
                warn!(
                    worker_type = %lease.worker_type,
                    from = lease.from_height,
                    attempt = lease.attempt,
                    "expired lease reclaimed as FAILED"
                );
            }
        }
        Ok(expired.len())
    }
}
