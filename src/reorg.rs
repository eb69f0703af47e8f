/// Reorg detection and bounded rollback
///
/// The forward path verifies parent continuity over every fetched window
/// and against the last persisted block. A mismatch against the persisted
/// tip means canonical history changed: the fork point is found by walking
/// persisted ids back against the remote chain, then everything above it is
/// rolled back, bounded by MAX_REORG_DEPTH. Deeper reorgs halt the
/// ingester for operator intervention.

use std::sync::Arc;

use tracing::{error, warn};

use crate::error::IndexError;
use crate::metrics;
use crate::store::Store;
use crate::types::FetchResult;

/// Outcome of the parent-continuity verification for a fetched window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuityCheck {
    Ok,
    /// The window head does not extend the persisted tip: canonical history
    /// above some fork point has changed.
    AnchorMismatch,
    /// Two freshly fetched neighbours disagree. Nothing stale is persisted;
    /// the fetch itself was inconsistent and the window should be retried.
    InnerMismatch(u64),
}

/// Details of a rollback that was executed.
#[derive(Debug, Clone)]
pub struct ReorgInfo {
    /// Height the store was rolled back to (this block stays).
    pub rollback_to: u64,
    /// Blocks deleted.
    pub orphaned_blocks: u64,
}

/// Verify every successive parent link in a sorted window, and the head
/// against the persisted tip when it is the direct predecessor.
pub fn check_continuity(
    last_persisted: Option<&(u64, String)>,
    window: &[FetchResult],
) -> ContinuityCheck {
    let Some(first) = window.first() else {
        return ContinuityCheck::Ok;
    };

    if let Some((last_height, last_id)) = last_persisted {
        if first.height() == last_height + 1 && first.block.parent_id != *last_id {
            return ContinuityCheck::AnchorMismatch;
        }
    }

    for pair in window.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.height() == prev.height() + 1 && next.block.parent_id != prev.block.id {
            return ContinuityCheck::InnerMismatch(next.height());
        }
    }
    ContinuityCheck::Ok
}

/// Walk backwards from the persisted tip comparing persisted ids with the
/// remote chain's, stopping at the last height where they agree. The
/// remote id is supplied by the caller per height so the walk stays pinned
/// to one endpoint. Fails fatally once the walk exceeds max_reorg_depth.
pub async fn find_fork_point<F, Fut>(
    store: &Arc<dyn Store>,
    tip_height: u64,
    max_reorg_depth: u64,
    mut remote_id: F,
) -> Result<u64, IndexError>
where
    F: FnMut(u64) -> Fut,
    Fut: std::future::Future<Output = Result<String, IndexError>>,
{
    let mut height = tip_height;
    loop {
        if tip_height - height > max_reorg_depth {
            error!(
                tip_height,
                max_reorg_depth, "no fork point within the reorg depth bound; halting"
            );
            return Err(IndexError::fatal(format!(
                "reorg deeper than MAX_REORG_DEPTH {} below height {}",
                max_reorg_depth, tip_height
            )));
        }

        // Heights we never persisted cannot anchor the fork.
        if let Some(ours) = store.block_id_at(height).await? {
            if ours == remote_id(height).await? {
                return Ok(height);
            }
        }

        if height == 0 {
            return Err(IndexError::fatal("no common ancestor with remote chain"));
        }
        height -= 1;
    }
}

/// Roll the store back so `rollback_to` becomes the new tip. Everything
/// above it is deleted from raw and derived tables, the forward checkpoint
/// is reset, and any derivation watermark past the cut is pulled back, all
/// in one transaction.
pub async fn execute_rollback(
    store: &Arc<dyn Store>,
    rollback_to: u64,
    last_persisted_height: u64,
    max_reorg_depth: u64,
    forward_checkpoint: &str,
) -> Result<ReorgInfo, IndexError> {
    let depth = last_persisted_height.saturating_sub(rollback_to);
    if depth > max_reorg_depth {
        error!(
            rollback_to,
            last_persisted_height, max_reorg_depth, "reorg exceeds maximum depth; halting"
        );
        return Err(IndexError::fatal(format!(
            "reorg depth {} to height {} exceeds MAX_REORG_DEPTH {}",
            depth, rollback_to, max_reorg_depth
        )));
    }

    warn!(rollback_to, orphaned = depth, "reorg detected, rolling back");
    store
        .rollback_from(rollback_to + 1, forward_checkpoint)
        .await?;
    metrics::REORG_ROLLBACKS.inc();

    Ok(ReorgInfo {
        rollback_to,
        orphaned_blocks: depth,
    })
}
