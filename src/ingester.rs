/// Ingester services
///
/// Two instances share the fetch pipeline: the forward ingester follows the
/// live head and handles reorgs; the backward ingester backfills history
/// toward HISTORY_STOP_HEIGHT. Each owns an independent checkpoint key;
/// sharing one is refused at configuration time.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::IndexError;
use crate::fetcher::Fetcher;
use crate::metrics;
use crate::reorg;
use crate::rpc::RpcClient;
use crate::sink::CommitSink;
use crate::store::{Store, WindowDirection};
use crate::types::{CommittedWindow, FetchResult, IndexingErrorRecord, Severity};

/// Idle sleep when the window is empty (caught up to tip).
const IDLE_SLEEP: Duration = Duration::from_secs(2);

/// Exponential backoff for failed windows, 1s doubling to 60s.
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: Duration::from_secs(1),
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Duration::from_secs(60));
        delay
    }

    fn reset(&mut self) {
        self.current = Duration::from_secs(1);
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> Result<(), IndexError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(IndexError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

// ----------------------------------------------------------------------
// Forward
// ----------------------------------------------------------------------

pub struct ForwardIngester {
    client: Arc<RpcClient>,
    fetcher: Arc<Fetcher>,
    store: Arc<dyn Store>,
    sink: Arc<dyn CommitSink>,
    checkpoint_name: String,
    start_block: u64,
    batch_size: u64,
    worker_count: usize,
    max_reorg_depth: u64,
}

impl ForwardIngester {
    pub fn new(
        settings: &Settings,
        client: Arc<RpcClient>,
        fetcher: Arc<Fetcher>,
        store: Arc<dyn Store>,
        sink: Arc<dyn CommitSink>,
    ) -> Self {
        Self {
            client,
            fetcher,
            store,
            sink,
            checkpoint_name: settings.forward_service_name.clone(),
            start_block: settings.start_block,
            batch_size: settings.latest_batch_size,
            worker_count: settings.latest_worker_count,
            max_reorg_depth: settings.max_reorg_depth,
        }
    }

    /// Main loop. Returns only on cancellation or a fatal error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexError> {
        let persisted = self
            .store
            .checkpoint(&self.checkpoint_name)
            .await?
            .map(|c| c.last_height)
            .unwrap_or(0);
        let mut checkpoint = persisted.max(self.start_block);
        let mut backoff = Backoff::new();

        info!(checkpoint, service = %self.checkpoint_name, "forward ingester starting");

        loop {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            match self.tick(&cancel, checkpoint).await {
                Ok(Some(new_checkpoint)) => {
                    checkpoint = new_checkpoint;
                    backoff.reset();
                }
                Ok(None) => {
                    sleep_or_cancel(&cancel, IDLE_SLEEP).await?;
                }
                Err(IndexError::Cancelled) => return Err(IndexError::Cancelled),
                Err(err @ IndexError::Fatal(_)) => {
                    error!(error = %err, "forward ingester halting");
                    return Err(err);
                }
                Err(err) => {
                    metrics::WINDOWS_FAILED.with_label_values(&["forward"]).inc();
                    let record = IndexingErrorRecord::new(
                        self.checkpoint_name.clone(),
                        checkpoint + 1,
                        None,
                        &err.to_string(),
                        Severity::Error,
                    );
                    if let Err(record_err) = self.store.record_indexing_error(&record).await {
                        warn!(error = %record_err, "failed to record indexing error");
                    }
                    let delay = backoff.next();
                    warn!(error = %err, delay_secs = delay.as_secs(), "forward window failed, backing off");
                    sleep_or_cancel(&cancel, delay).await?;
                }
            }
        }
    }

    /// One iteration: poll the tip, fetch the next window, verify
    /// continuity, persist, notify. Returns the new checkpoint, or None
    /// when there was nothing to do.
    pub(crate) async fn tick(
        &self,
        cancel: &CancellationToken,
        checkpoint: u64,
    ) -> Result<Option<u64>, IndexError> {
        let tip = self.client.latest_tip(cancel).await?;
        let lo = checkpoint + 1;
        let hi = tip.height.min(checkpoint + self.batch_size);
        if lo > hi {
            return Ok(None);
        }

        // A window never straddles a spork root; each piece routes to its
        // own pool and commits separately.
        let mut new_checkpoint = checkpoint;
        for (piece_lo, piece_hi) in self.client.router.split_window(lo, hi) {
            match self.ingest_piece(cancel, new_checkpoint, piece_lo, piece_hi).await? {
                PieceOutcome::Committed(height) => new_checkpoint = height,
                PieceOutcome::RolledBack(height) => {
                    // Restart the loop from the rolled-back checkpoint.
                    return Ok(Some(height));
                }
            }
        }
        Ok(Some(new_checkpoint))
    }

    async fn ingest_piece(
        &self,
        cancel: &CancellationToken,
        checkpoint: u64,
        lo: u64,
        hi: u64,
    ) -> Result<PieceOutcome, IndexError> {
        let results = self
            .fetcher
            .fetch_window(cancel, lo..=hi, self.worker_count)
            .await?;

        let last_persisted = self.store.last_persisted_block().await?;
        // Only check against the persisted tip when it is the direct
        // predecessor of this window; history backfill lives elsewhere in
        // the height space.
        let continuity_anchor = last_persisted
            .as_ref()
            .filter(|(height, _)| *height + 1 == lo);

        match reorg::check_continuity(continuity_anchor, &results) {
            reorg::ContinuityCheck::Ok => {}
            reorg::ContinuityCheck::InnerMismatch(height) => {
                // Nothing stale was persisted; the fetch disagreed with
                // itself. Retry the window.
                return Err(crate::error::RpcError::transient(
                    "FetchWindow",
                    format!("inconsistent parent link at height {} within window", height),
                )
                .into());
            }
            reorg::ContinuityCheck::AnchorMismatch => {
                let anchor_height = continuity_anchor.map(|(h, _)| *h).unwrap_or(checkpoint);
                let fork = self.find_fork(cancel, anchor_height).await?;
                let info = reorg::execute_rollback(
                    &self.store,
                    fork,
                    anchor_height,
                    self.max_reorg_depth,
                    &self.checkpoint_name,
                )
                .await?;
                return Ok(PieceOutcome::RolledBack(info.rollback_to));
            }
        }

        self.store.ensure_partitions(lo, hi).await?;

        let started = std::time::Instant::now();
        self.store
            .persist_window(&self.checkpoint_name, WindowDirection::Forward, &results)
            .await?;
        metrics::WINDOW_COMMIT_DURATION.observe(started.elapsed().as_secs_f64());
        observe_persisted("forward", &results);
        metrics::CHECKPOINT_HEIGHT
            .with_label_values(&[&self.checkpoint_name])
            .set(hi as i64);

        debug!(lo, hi, blocks = results.len(), "forward window committed");

        // Best effort: a full or closed sink never rolls back the commit.
        self.sink.on_committed(CommittedWindow::from_results(&results));

        Ok(PieceOutcome::Committed(hi))
    }

    /// Walk persisted ids back against the remote chain to find the last
    /// common height. Each compared block is fetched from an endpoint
    /// eligible for its height.
    async fn find_fork(
        &self,
        cancel: &CancellationToken,
        tip_height: u64,
    ) -> Result<u64, IndexError> {
        let client = Arc::clone(&self.client);
        reorg::find_fork_point(&self.store, tip_height, self.max_reorg_depth, move |height| {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            async move {
                let endpoint = client.pin_endpoint(height, &cancel).await?;
                let block = client.block_by_height(&cancel, &endpoint, height).await;
                client
                    .pool
                    .release(&endpoint, crate::node_pool::outcome_of(&block))
                    .await;
                Ok(block?.id.to_lowercase())
            }
        })
        .await
    }
}

enum PieceOutcome {
    Committed(u64),
    RolledBack(u64),
}

// ----------------------------------------------------------------------
// Backward
// ----------------------------------------------------------------------

pub struct BackwardIngester {
    fetcher: Arc<Fetcher>,
    store: Arc<dyn Store>,
    router: Arc<crate::sporks::SporkRouter>,
    checkpoint_name: String,
    stop_height: u64,
    batch_size: u64,
    worker_count: usize,
    /// First cursor when no history checkpoint exists yet: just below the
    /// forward ingester's start block.
    initial_cursor: u64,
}

impl BackwardIngester {
    pub fn new(
        settings: &Settings,
        fetcher: Arc<Fetcher>,
        store: Arc<dyn Store>,
        router: Arc<crate::sporks::SporkRouter>,
    ) -> Self {
        Self {
            fetcher,
            store,
            router,
            checkpoint_name: settings.history_service_name.clone(),
            stop_height: settings.history_stop_height,
            batch_size: settings.history_batch_size,
            worker_count: settings.history_worker_count,
            initial_cursor: settings.start_block.saturating_sub(1),
        }
    }

    /// Backfill until the cursor crosses the stop height. No reorg
    /// handling: historical data is final.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexError> {
        let mut cursor = match self.store.checkpoint(&self.checkpoint_name).await? {
            Some(c) => c.last_height,
            None => self.initial_cursor,
        };
        let mut backoff = Backoff::new();

        info!(cursor, stop = self.stop_height, service = %self.checkpoint_name, "history ingester starting");

        loop {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            if cursor < self.stop_height {
                info!(cursor, "history backfill complete");
                return Ok(());
            }

            let lo = self.stop_height.max(cursor.saturating_sub(self.batch_size - 1));
            match self.ingest_window(&cancel, lo, cursor).await {
                Ok(()) => {
                    backoff.reset();
                    metrics::CHECKPOINT_HEIGHT
                        .with_label_values(&[&self.checkpoint_name])
                        .set(lo.saturating_sub(1) as i64);
                    if lo == 0 {
                        info!("history backfill reached genesis");
                        return Ok(());
                    }
                    cursor = lo - 1;
                }
                Err(IndexError::Cancelled) => return Err(IndexError::Cancelled),
                Err(err) => {
                    // Logged and retried; the cursor never advances past a
                    // failed window.
                    metrics::WINDOWS_FAILED.with_label_values(&["history"]).inc();
                    let record = IndexingErrorRecord::new(
                        self.checkpoint_name.clone(),
                        lo,
                        None,
                        &err.to_string(),
                        Severity::Warn,
                    );
                    if let Err(record_err) = self.store.record_indexing_error(&record).await {
                        warn!(error = %record_err, "failed to record indexing error");
                    }
                    let delay = backoff.next();
                    warn!(lo, hi = cursor, error = %err, delay_secs = delay.as_secs(), "history window failed, backing off");
                    sleep_or_cancel(&cancel, delay).await?;
                }
            }
        }
    }

    async fn ingest_window(
        &self,
        cancel: &CancellationToken,
        lo: u64,
        hi: u64,
    ) -> Result<(), IndexError> {
        // Pieces are persisted from the top down so the checkpoint always
        // names the next height to backfill.
        let pieces = self.router.split_window(lo, hi);
        for (piece_lo, piece_hi) in pieces.into_iter().rev() {
            let results = self
                .fetcher
                .fetch_window(cancel, piece_lo..=piece_hi, self.worker_count)
                .await?;

            self.store.ensure_partitions(piece_lo, piece_hi).await?;
            let started = std::time::Instant::now();
            self.store
                .persist_window(&self.checkpoint_name, WindowDirection::Backward, &results)
                .await?;
            metrics::WINDOW_COMMIT_DURATION.observe(started.elapsed().as_secs_f64());
            observe_persisted("history", &results);
            debug!(piece_lo, piece_hi, "history window committed");
        }
        Ok(())
    }
}

fn observe_persisted(ingester: &str, results: &[FetchResult]) {
    metrics::BLOCKS_PERSISTED
        .with_label_values(&[ingester])
        .inc_by(results.len() as u64);
    metrics::TRANSACTIONS_PERSISTED
        .with_label_values(&[ingester])
        .inc_by(results.iter().map(|r| r.transactions.len() as u64).sum());
    metrics::EVENTS_PERSISTED
        .with_label_values(&[ingester])
        .inc_by(results.iter().map(|r| r.events.len() as u64).sum());
}
