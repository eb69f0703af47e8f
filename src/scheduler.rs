/// Derivation scheduler
///
/// For each derivation kind: a small pool of workers that claim aligned
/// height-range leases through the database, process them idempotently, and
/// mark them COMPLETED; plus a dedicated Committer that advances the kind's
/// watermark only over contiguous COMPLETED ranges. Coordination is
/// entirely in the lease table; workers on different machines compose.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::derivations::{checkpoint_name, DerivationKind};
use crate::error::IndexError;
use crate::metrics;
use crate::store::Store;
use crate::types::{IndexingErrorRecord, Lease, Severity};

/// Attempts after which a lease is poisoned and left for the operator.
pub const MAX_LEASE_ATTEMPTS: u32 = 5;
/// Claim lifetime; extended by heartbeat while the worker is alive.
pub const LEASE_DURATION: Duration = Duration::from_secs(300);
/// Heartbeat period for lease extension.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Sleep when no work is claimable.
const IDLE_SLEEP: Duration = Duration::from_secs(5);
/// How many ranges past the watermark the sequential claim will look.
const CLAIM_SEARCH_RANGES: u64 = 8;
/// Committer poll period.
const COMMIT_INTERVAL: Duration = Duration::from_secs(2);

pub struct DerivationScheduler {
    store: Arc<dyn Store>,
    kind: Arc<dyn DerivationKind>,
    range_size: u64,
    worker_count: usize,
}

impl DerivationScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        kind: Arc<dyn DerivationKind>,
        range_size: u64,
        worker_count: usize,
    ) -> Self {
        Self {
            store,
            kind,
            range_size,
            worker_count,
        }
    }

    /// Spawn the worker pool and the committer; resolves when all of them
    /// have exited after cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexError> {
        let mut handles = Vec::new();
        for i in 0..self.worker_count {
            let worker = RangeWorker {
                store: Arc::clone(&self.store),
                kind: Arc::clone(&self.kind),
                range_size: self.range_size,
                worker_id: format!("{}-{}-{}", self.kind.name(), std::process::id(), i),
            };
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { worker.run(cancel).await }));
        }

        let committer = Committer {
            store: Arc::clone(&self.store),
            kind_name: self.kind.name(),
            range_size: self.range_size,
        };
        let committer_cancel = cancel.clone();
        handles.push(tokio::spawn(async move { committer.run(committer_cancel).await }));

        for handle in handles {
            match handle.await {
                Ok(Ok(())) | Ok(Err(IndexError::Cancelled)) => {}
                Ok(Err(err)) => warn!(kind = self.kind.name(), error = %err, "derivation task exited with error"),
                Err(join_err) => warn!(kind = self.kind.name(), error = %join_err, "derivation task panicked"),
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------

struct RangeWorker {
    store: Arc<dyn Store>,
    kind: Arc<dyn DerivationKind>,
    range_size: u64,
    worker_id: String,
}

impl RangeWorker {
    async fn run(&self, cancel: CancellationToken) -> Result<(), IndexError> {
        info!(worker = %self.worker_id, "derivation worker starting");
        loop {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            match self.next_lease().await? {
                Some(lease) => self.process_lease(&cancel, lease).await?,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(IndexError::Cancelled),
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                }
            }
        }
    }

    /// FAILED leases under the attempt cap first; then the next sequential
    /// free range after the committer watermark, capped so the search never
    /// leaps far past the raw head.
    async fn next_lease(&self) -> Result<Option<Lease>, IndexError> {
        if let Some(lease) = self
            .store
            .reacquire_failed_lease(
                self.kind.name(),
                &self.worker_id,
                MAX_LEASE_ATTEMPTS,
                LEASE_DURATION,
            )
            .await?
        {
            debug!(worker = %self.worker_id, from = lease.from_height, attempt = lease.attempt, "re-acquired failed lease");
            return Ok(Some(lease));
        }

        let watermark = self
            .store
            .checkpoint(&checkpoint_name(self.kind.name()))
            .await?
            .map(|c| c.last_height)
            .unwrap_or(0);
        let raw_head = self
            .store
            .last_persisted_block()
            .await?
            .map(|(height, _)| height)
            .unwrap_or(0);

        // No point leasing ranges with no raw data yet.
        let aligned_watermark = watermark - (watermark % self.range_size);
        let head_cap = raw_head + 1;
        let search_cap = head_cap.min(aligned_watermark + CLAIM_SEARCH_RANGES * self.range_size);
        if search_cap <= aligned_watermark {
            return Ok(None);
        }

        let lease = self
            .store
            .claim_next_lease(
                self.kind.name(),
                &self.worker_id,
                self.range_size,
                aligned_watermark,
                search_cap,
                LEASE_DURATION,
            )
            .await?;
        Ok(lease)
    }

    /// Process the leased range with a heartbeat extending the lease. A
    /// processing error leaves the lease ACTIVE for the reaper to expire;
    /// the attempt count is its business, not ours.
    async fn process_lease(
        &self,
        cancel: &CancellationToken,
        lease: Lease,
    ) -> Result<(), IndexError> {
        let heartbeat = {
            let store = Arc::clone(&self.store);
            let kind_name = self.kind.name();
            let worker_id = self.worker_id.clone();
            let from = lease.from_height;
            async move {
                loop {
                    tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                    match store
                        .extend_lease(kind_name, from, &worker_id, LEASE_DURATION)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(worker = %worker_id, from, "lost lease while processing");
                            return;
                        }
                        Err(err) => warn!(worker = %worker_id, error = %err, "lease heartbeat failed"),
                    }
                }
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(IndexError::Cancelled),
            _ = heartbeat => {
                // Lease lost; abandon the range without completing it.
                return Ok(());
            }
            result = self.kind.process_range(self.store.as_ref(), lease.from_height, lease.to_height) => result,
        };

        match outcome {
            Ok(rows) => {
                self.store
                    .complete_lease(self.kind.name(), lease.from_height, &self.worker_id)
                    .await?;
                metrics::LEASE_TRANSITIONS
                    .with_label_values(&[self.kind.name(), "COMPLETED"])
                    .inc();
                debug!(worker = %self.worker_id, from = lease.from_height, to = lease.to_height, rows, "range completed");
                Ok(())
            }
            Err(err) => {
                warn!(worker = %self.worker_id, from = lease.from_height, error = %err, "range processing failed; lease left to expire");
                let record = IndexingErrorRecord::new(
                    checkpoint_name(self.kind.name()),
                    lease.from_height,
                    None,
                    &err.to_string(),
                    Severity::Error,
                );
                if let Err(record_err) = self.store.record_indexing_error(&record).await {
                    warn!(error = %record_err, "failed to record indexing error");
                }
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------
// Committer
// ----------------------------------------------------------------------

/// Advances the watermark over contiguous COMPLETED leases, one range at a
/// time. Never jumps a gap: MAX(to_height) shortcuts would publish heights
/// whose lower ranges are still outstanding.
pub struct Committer {
    store: Arc<dyn Store>,
    kind_name: &'static str,
    range_size: u64,
}

impl Committer {
    pub fn new(store: Arc<dyn Store>, kind_name: &'static str, range_size: u64) -> Self {
        Self {
            store,
            kind_name,
            range_size,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexError> {
        loop {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            if let Err(err) = self.tick().await {
                warn!(kind = self.kind_name, error = %err, "committer tick failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexError::Cancelled),
                _ = tokio::time::sleep(COMMIT_INTERVAL) => {}
            }
        }
    }

    /// One pass: walk forward while the range starting at the watermark is
    /// COMPLETED; stop at the first gap.
    pub async fn tick(&self) -> Result<u64, IndexError> {
        let name = checkpoint_name(self.kind_name);
        let mut last_height = self
            .store
            .checkpoint(&name)
            .await?
            .map(|c| c.last_height)
            .unwrap_or(0);
        // Rollback can park the watermark mid-range; re-align down.
        let mut from = last_height - (last_height % self.range_size);

        let mut advanced = false;
        while self.store.completed_lease_at(self.kind_name, from).await? {
            from += self.range_size;
            last_height = from;
            advanced = true;
        }

        if advanced {
            self.store.set_checkpoint(&name, last_height).await?;
            metrics::DERIVATION_WATERMARK
                .with_label_values(&[self.kind_name])
                .set(last_height as i64);
            debug!(kind = self.kind_name, watermark = last_height, "watermark advanced");
        }
        Ok(last_height)
    }
}
