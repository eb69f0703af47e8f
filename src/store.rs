/// Store contract
///
/// The single persistence seam. Ingesters, the derivation scheduler, the
/// reaper and the reconciler all coordinate exclusively through these
/// operations; there are no in-process locks guarding cross-service state.
/// The production implementation is PgStore; tests run against an
/// in-memory double.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{Checkpoint, FetchResult, IndexingErrorRecord, Lease};

/// Which way the owning ingester moves its checkpoint on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDirection {
    /// Checkpoint becomes the window's highest height.
    Forward,
    /// Checkpoint becomes the window's lowest height minus one.
    Backward,
}

/// What the lookup repair pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupRepairReport {
    /// tx_lookup rows pointing at a missing transaction, now deleted.
    pub dangling_lookups_deleted: u64,
    /// transactions missing their lookup row, now backfilled.
    pub lookups_backfilled: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Raw ingestion
    // ------------------------------------------------------------------

    /// Persist a window of fetch results atomically: scripts, blocks,
    /// transactions, events, lookups, address activity, key changes and the
    /// checkpoint advance, all in one transaction. Re-persisting the same
    /// window is a no-op thanks to idempotent keys.
    async fn persist_window(
        &self,
        checkpoint_name: &str,
        direction: WindowDirection,
        results: &[FetchResult],
    ) -> Result<(), StoreError>;

    /// Height and id of the highest persisted block, for parent-continuity
    /// checks across windows.
    async fn last_persisted_block(&self) -> Result<Option<(u64, String)>, StoreError>;

    /// Persisted block id at a height, for the fork-point walk during reorg
    /// handling.
    async fn block_id_at(&self, height: u64) -> Result<Option<String>, StoreError>;

    /// Make sure height-range partitions exist for every table a window
    /// spanning [lo, hi] will touch, plus lookahead. Idempotent; safe to
    /// race.
    async fn ensure_partitions(&self, lo: u64, hi: u64) -> Result<(), StoreError>;

    /// Delete every raw and derived row with block_height >= from_height,
    /// reset the forward checkpoint to from_height - 1, and pull any
    /// derivation watermark that advanced past the cut back to it. One
    /// transaction.
    async fn rollback_from(
        &self,
        from_height: u64,
        forward_checkpoint: &str,
    ) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    async fn checkpoint(&self, worker_name: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn set_checkpoint(&self, worker_name: &str, last_height: u64) -> Result<(), StoreError>;

    /// Every checkpoint row, for the health surface and diagnostics.
    async fn watermarks(&self) -> Result<Vec<Checkpoint>, StoreError>;

    // ------------------------------------------------------------------
    // Derivation leases
    // ------------------------------------------------------------------

    /// Try to take over a FAILED lease with attempt < max_attempts via
    /// compare-and-set. Does not touch the attempt count; the reaper owns
    /// it.
    async fn reacquire_failed_lease(
        &self,
        worker_type: &str,
        leased_by: &str,
        max_attempts: u32,
        lease_duration: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Claim the next free aligned range at or after start_from by
    /// insert-on-conflict-do-nothing, stepping up in range_size increments
    /// but never past search_cap.
    async fn claim_next_lease(
        &self,
        worker_type: &str,
        leased_by: &str,
        range_size: u64,
        start_from: u64,
        search_cap: u64,
        lease_duration: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Heartbeat: push lease_expires_at out. False when the lease is no
    /// longer held by this worker.
    async fn extend_lease(
        &self,
        worker_type: &str,
        from_height: u64,
        leased_by: &str,
        lease_duration: Duration,
    ) -> Result<bool, StoreError>;

    /// Terminal transition; COMPLETED is never left again.
    async fn complete_lease(
        &self,
        worker_type: &str,
        from_height: u64,
        leased_by: &str,
    ) -> Result<(), StoreError>;

    /// Whether a COMPLETED lease exists exactly at from_height. The
    /// committer's only question.
    async fn completed_lease_at(
        &self,
        worker_type: &str,
        from_height: u64,
    ) -> Result<bool, StoreError>;

    /// Reaper sweep: every ACTIVE lease with lease_expires_at < now turns
    /// FAILED with attempt + 1. Returns the transitioned leases.
    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError>;

    // ------------------------------------------------------------------
    // Derivation range processing
    // ------------------------------------------------------------------

    /// Derive app.token_transfers rows from raw.events over [from, to).
    /// Idempotent. Returns rows written.
    async fn derive_token_transfers(&self, from: u64, to: u64) -> Result<u64, StoreError>;

    /// Derive app.evm_transactions rows from raw over [from, to).
    /// Idempotent. Returns rows written.
    async fn derive_evm_transactions(&self, from: u64, to: u64) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // Errors and reconciliation
    // ------------------------------------------------------------------

    /// Insert an indexing error, deduplicated on
    /// (worker_name, block_height, transaction_id, error_hash).
    async fn record_indexing_error(&self, record: &IndexingErrorRecord) -> Result<(), StoreError>;

    /// Reconcile tx_lookup against transactions in both directions, bounded
    /// by limit per direction.
    async fn repair_lookups(&self, limit: u64) -> Result<LookupRepairReport, StoreError>;

    /// Delete payload blobs no event references, older than grace. Returns
    /// rows deleted.
    async fn reclaim_orphan_blobs(&self, grace: Duration) -> Result<u64, StoreError>;
}
