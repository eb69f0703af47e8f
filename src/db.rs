/// Postgres store
///
/// Pool construction, migrations, and the Store implementation. The window
/// transaction itself lives in batch_writer.rs, partition DDL in
/// partitions.rs; everything else (checkpoints, leases, errors, derivation
/// SQL, reconciliation) is here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{IndexError, StoreError};
use crate::fetcher;
use crate::store::{LookupRepairReport, Store, WindowDirection};
use crate::types::{
    Checkpoint, EventRecord, FetchResult, IndexingErrorRecord, Lease, LeaseStatus,
};

/// Checkpoint-name prefix shared by every derivation watermark; rollback
/// resets these without touching ingester checkpoints.
pub const DERIVATION_CHECKPOINT_PREFIX: &str = "worker:";

const VALID_SYNCHRONOUS_COMMIT: &[&str] = &["on", "off", "local", "remote_write", "remote_apply"];

pub struct PgStore {
    pub pool: PgPool,
    pub payload_inline_max_bytes: usize,
}

impl PgStore {
    /// Build the pool per DB_MAX_OPEN_CONNS / DB_MAX_IDLE_CONNS, apply
    /// DB_SYNCHRONOUS_COMMIT per connection, and run migrations unless
    /// SKIP_MIGRATION is set.
    pub async fn connect(settings: &Settings) -> Result<Self, IndexError> {
        let mut options = PgPoolOptions::new()
            .max_connections(settings.db_max_open_conns)
            .min_connections(settings.db_max_idle_conns.min(settings.db_max_open_conns))
            .acquire_timeout(Duration::from_secs(30));

        if let Some(mode) = settings.db_synchronous_commit.clone() {
            if !VALID_SYNCHRONOUS_COMMIT.contains(&mode.as_str()) {
                return Err(IndexError::Config(format!(
                    "invalid DB_SYNCHRONOUS_COMMIT value: {}",
                    mode
                )));
            }
            options = options.after_connect(move |conn, _meta| {
                let stmt = format!("SET synchronous_commit = '{}'", mode);
                Box::pin(async move {
                    sqlx::Executor::execute(conn, stmt.as_str()).await?;
                    Ok(())
                })
            });
        }

        let pool = options
            .connect(&settings.db_url)
            .await
            .map_err(|e| IndexError::Config(format!("connecting to database: {}", e)))?;

        let store = Self {
            pool,
            payload_inline_max_bytes: settings.payload_inline_max_bytes,
        };

        if settings.skip_migration {
            info!("skipping migrations (SKIP_MIGRATION)");
        } else {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), IndexError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| IndexError::Config(format!("running migrations: {}", e)))?;
        Ok(())
    }

    fn row_to_lease(row: &PgRow) -> Result<Lease, StoreError> {
        let status_str: String = row.try_get("status").map_err(StoreError::from)?;
        let status = LeaseStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Other(format!("unknown lease status {}", status_str)))?;
        Ok(Lease {
            worker_type: row.try_get("worker_type").map_err(StoreError::from)?,
            from_height: row.try_get::<i64, _>("from_height").map_err(StoreError::from)? as u64,
            to_height: row.try_get::<i64, _>("to_height").map_err(StoreError::from)? as u64,
            status,
            attempt: row.try_get::<i32, _>("attempt").map_err(StoreError::from)? as u32,
            leased_by: row.try_get("leased_by").map_err(StoreError::from)?,
            lease_expires_at: row.try_get("lease_expires_at").map_err(StoreError::from)?,
        })
    }

    /// Events in [from, to) matching any of the type suffixes, with
    /// offloaded payloads joined back in. Keyset-paginated by the caller.
    async fn events_in_range(
        &self,
        from: u64,
        to: u64,
        type_patterns: &[&str],
    ) -> Result<Vec<EventRecord>, StoreError> {
        let pattern_clause = type_patterns
            .iter()
            .enumerate()
            .map(|(i, _)| format!("e.type LIKE ${}", i + 3))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT e.block_height, e.transaction_id, e.event_index, e.transaction_index, \
                    e.type, COALESCE(e.payload, b.payload) AS payload, e.payload_hash, e.payload_ref \
             FROM raw.events e \
             LEFT JOIN raw.event_payload_blobs b ON b.payload_hash = e.payload_ref \
             WHERE e.block_height >= $1 AND e.block_height < $2 AND ({}) \
             ORDER BY e.block_height, e.transaction_id, e.event_index",
            pattern_clause
        );
        let mut query = sqlx::query(&sql).bind(from as i64).bind(to as i64);
        for pattern in type_patterns {
            query = query.bind(*pattern);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(StoreError::from)?;

        rows.iter()
            .map(|row| {
                Ok(EventRecord {
                    block_height: row.try_get::<i64, _>("block_height").map_err(StoreError::from)? as u64,
                    transaction_id: row.try_get("transaction_id").map_err(StoreError::from)?,
                    event_index: row.try_get::<i32, _>("event_index").map_err(StoreError::from)? as u32,
                    transaction_index: row.try_get::<i32, _>("transaction_index").map_err(StoreError::from)?
                        as u32,
                    event_type: row.try_get("type").map_err(StoreError::from)?,
                    payload: row.try_get("payload").map_err(StoreError::from)?,
                    payload_hash: row.try_get("payload_hash").map_err(StoreError::from)?,
                    payload_ref: row.try_get("payload_ref").map_err(StoreError::from)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn persist_window(
        &self,
        checkpoint_name: &str,
        direction: WindowDirection,
        results: &[FetchResult],
    ) -> Result<(), StoreError> {
        self.persist_window_pg(checkpoint_name, direction, results).await
    }

    async fn last_persisted_block(&self) -> Result<Option<(u64, String)>, StoreError> {
        let row = sqlx::query("SELECT height, id FROM raw.blocks ORDER BY height DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.map(|r| (r.get::<i64, _>("height") as u64, r.get("id"))))
    }

    async fn block_id_at(&self, height: u64) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT id FROM raw.blocks WHERE height = $1")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn ensure_partitions(&self, lo: u64, hi: u64) -> Result<(), StoreError> {
        self.ensure_partitions_pg(lo, hi).await
    }

    async fn rollback_from(
        &self,
        from_height: u64,
        forward_checkpoint: &str,
    ) -> Result<(), StoreError> {
        self.rollback_from_pg(from_height, forward_checkpoint).await
    }

    async fn checkpoint(&self, worker_name: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT worker_name, last_height, updated_at FROM raw.checkpoints WHERE worker_name = $1",
        )
        .bind(worker_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.map(|r| Checkpoint {
            worker_name: r.get("worker_name"),
            last_height: r.get::<i64, _>("last_height") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn set_checkpoint(&self, worker_name: &str, last_height: u64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO raw.checkpoints (worker_name, last_height, updated_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (worker_name) DO UPDATE \
             SET last_height = EXCLUDED.last_height, updated_at = now()",
        )
        .bind(worker_name)
        .bind(last_height as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn watermarks(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT worker_name, last_height, updated_at FROM raw.checkpoints ORDER BY worker_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(rows
            .into_iter()
            .map(|r| Checkpoint {
                worker_name: r.get("worker_name"),
                last_height: r.get::<i64, _>("last_height") as u64,
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    async fn reacquire_failed_lease(
        &self,
        worker_type: &str,
        leased_by: &str,
        max_attempts: u32,
        lease_duration: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let expires = Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        // CAS: the inner select picks a candidate, the outer update only
        // succeeds if it is still FAILED under the attempt cap. The attempt
        // count is untouched; the reaper owns it.
        let row = sqlx::query(
            "UPDATE raw.worker_leases SET status = 'ACTIVE', leased_by = $2, lease_expires_at = $3 \
             WHERE worker_type = $1 AND status = 'FAILED' AND attempt < $4 \
               AND from_height = ( \
                   SELECT from_height FROM raw.worker_leases \
                   WHERE worker_type = $1 AND status = 'FAILED' AND attempt < $4 \
                   ORDER BY from_height LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING worker_type, from_height, to_height, status, attempt, leased_by, lease_expires_at",
        )
        .bind(worker_type)
        .bind(leased_by)
        .bind(expires)
        .bind(max_attempts as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        row.as_ref().map(Self::row_to_lease).transpose()
    }

    async fn claim_next_lease(
        &self,
        worker_type: &str,
        leased_by: &str,
        range_size: u64,
        start_from: u64,
        search_cap: u64,
        lease_duration: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        if range_size == 0 {
            return Err(StoreError::Other("lease range size must be > 0".into()));
        }
        let expires = Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        let mut from = start_from - (start_from % range_size);
        while from < search_cap {
            let row = sqlx::query(
                "INSERT INTO raw.worker_leases \
                   (worker_type, from_height, to_height, status, attempt, leased_by, lease_expires_at) \
                 VALUES ($1, $2, $3, 'ACTIVE', 0, $4, $5) \
                 ON CONFLICT (worker_type, from_height) DO NOTHING \
                 RETURNING worker_type, from_height, to_height, status, attempt, leased_by, lease_expires_at",
            )
            .bind(worker_type)
            .bind(from as i64)
            .bind((from + range_size) as i64)
            .bind(leased_by)
            .bind(expires)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

            if let Some(row) = row {
                return Ok(Some(Self::row_to_lease(&row)?));
            }
            from += range_size;
        }
        Ok(None)
    }

    async fn extend_lease(
        &self,
        worker_type: &str,
        from_height: u64,
        leased_by: &str,
        lease_duration: Duration,
    ) -> Result<bool, StoreError> {
        let expires = Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        let result = sqlx::query(
            "UPDATE raw.worker_leases SET lease_expires_at = $4 \
             WHERE worker_type = $1 AND from_height = $2 AND leased_by = $3 AND status = 'ACTIVE'",
        )
        .bind(worker_type)
        .bind(from_height as i64)
        .bind(leased_by)
        .bind(expires)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_lease(
        &self,
        worker_type: &str,
        from_height: u64,
        leased_by: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE raw.worker_leases SET status = 'COMPLETED' \
             WHERE worker_type = $1 AND from_height = $2 AND leased_by = $3 AND status = 'ACTIVE'",
        )
        .bind(worker_type)
        .bind(from_height as i64)
        .bind(leased_by)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            // Reaped mid-range. The processing was idempotent, so losing the
            // race is harmless; the range will be redone.
            warn!(worker_type, from_height, "lease no longer held at completion");
        }
        Ok(())
    }

    async fn completed_lease_at(
        &self,
        worker_type: &str,
        from_height: u64,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM raw.worker_leases \
             WHERE worker_type = $1 AND from_height = $2 AND status = 'COMPLETED'",
        )
        .bind(worker_type)
        .bind(from_height as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.is_some())
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError> {
        let rows = sqlx::query(
            "UPDATE raw.worker_leases SET status = 'FAILED', attempt = attempt + 1 \
             WHERE status = 'ACTIVE' AND lease_expires_at < $1 \
             RETURNING worker_type, from_height, to_height, status, attempt, leased_by, lease_expires_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        rows.iter().map(Self::row_to_lease).collect()
    }

    async fn derive_token_transfers(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        let events = self
            .events_in_range(
                from,
                to,
                &["%Deposited", "%Withdrawn"],
            )
            .await?;
        let candidates = fetcher::extract_token_transfers(&events);
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut written = 0u64;
        for chunk in candidates.chunks(1000) {
            let mut qb = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO app.token_transfers \
                 (block_height, transaction_id, event_index, token_contract, amount, counterparty, direction) ",
            );
            qb.push_values(chunk, |mut b, t| {
                b.push_bind(t.block_height as i64)
                    .push_bind(&t.transaction_id)
                    .push_bind(t.event_index as i32)
                    .push_bind(&t.token_contract)
                    .push("CAST(")
                    .push_bind_unseparated(&t.amount)
                    .push_unseparated(" AS NUMERIC)")
                    .push_bind(&t.counterparty)
                    .push_bind(t.direction.as_str());
            });
            qb.push(" ON CONFLICT (block_height, transaction_id, event_index) DO NOTHING");
            let result = qb.build().execute(&self.pool).await.map_err(StoreError::from)?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn derive_evm_transactions(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        let events = self
            .events_in_range(from, to, &["%.EVM.TransactionExecuted"])
            .await?;

        let mut rows: Vec<(u64, String, String)> = Vec::new();
        for event in &events {
            let Some(payload) = &event.payload else { continue };
            let Some(hash) = crate::addresses::cadence_field(payload, "hash")
                .and_then(|v| v.as_str())
                .map(crate::sanitize::normalize_address)
            else {
                continue;
            };
            rows.push((event.block_height, event.transaction_id.clone(), hash));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let mut written = 0u64;
        for chunk in rows.chunks(1000) {
            let mut qb = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO app.evm_transactions (block_height, transaction_id, evm_hash) ",
            );
            qb.push_values(chunk, |mut b, (height, tx_id, hash)| {
                b.push_bind(*height as i64).push_bind(tx_id).push_bind(hash);
            });
            qb.push(" ON CONFLICT (block_height, evm_hash) DO NOTHING");
            let result = qb.build().execute(&self.pool).await.map_err(StoreError::from)?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn record_indexing_error(&self, record: &IndexingErrorRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO raw.indexing_errors \
               (worker_name, block_height, transaction_id, error_hash, raw_data, severity) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (worker_name, block_height, (COALESCE(transaction_id, '')), error_hash) \
             DO NOTHING",
        )
        .bind(&record.worker_name)
        .bind(record.block_height as i64)
        .bind(&record.transaction_id)
        .bind(&record.error_hash)
        .bind(&record.raw_data)
        .bind(record.severity.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn repair_lookups(&self, limit: u64) -> Result<LookupRepairReport, StoreError> {
        let deleted = sqlx::query(
            "DELETE FROM raw.tx_lookup WHERE id IN ( \
               SELECT l.id FROM raw.tx_lookup l \
               LEFT JOIN raw.transactions t \
                 ON t.block_height = l.block_height AND t.id = l.id \
               WHERE t.id IS NULL LIMIT $1)",
        )
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?
        .rows_affected();

        let backfilled = sqlx::query(
            "INSERT INTO raw.tx_lookup (id, block_height, tx_index) \
             SELECT t.id, t.block_height, t.tx_index FROM raw.transactions t \
             LEFT JOIN raw.tx_lookup l ON l.id = t.id \
             WHERE l.id IS NULL LIMIT $1 \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?
        .rows_affected();

        Ok(LookupRepairReport {
            dangling_lookups_deleted: deleted,
            lookups_backfilled: backfilled,
        })
    }

    async fn reclaim_orphan_blobs(&self, grace: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_default();
        let deleted = sqlx::query(
            "DELETE FROM raw.event_payload_blobs b \
             WHERE b.created_at < $1 \
               AND NOT EXISTS (SELECT 1 FROM raw.events e WHERE e.payload_ref = b.payload_hash)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?
        .rows_affected();
        Ok(deleted)
    }
}
