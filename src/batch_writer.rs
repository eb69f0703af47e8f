/// Batch writer
///
/// Persists a window of fetch results in a single database transaction:
/// either every table reflects the window or none does, and the checkpoint
/// only moves on commit. All conflict targets are idempotent keys, so
/// replaying a window is a no-op rather than a duplicate.
///
/// Oversized event payloads are offloaded to the blob table before the
/// transaction opens; an aborted window can therefore leave orphaned blobs,
/// which the reconciler reclaims.

use sqlx::QueryBuilder;
use tracing::{debug, warn};

use crate::db::{PgStore, DERIVATION_CHECKPOINT_PREFIX};
use crate::error::StoreError;
use crate::sanitize;
use crate::store::WindowDirection;
use crate::types::{AccountKeyChange, EventRecord, FetchResult};

/// Keeps each bulk statement comfortably under the bind limit.
const INSERT_CHUNK: usize = 500;

impl PgStore {
    pub(crate) async fn persist_window_pg(
        &self,
        checkpoint_name: &str,
        direction: WindowDirection,
        results: &[FetchResult],
    ) -> Result<(), StoreError> {
        if results.is_empty() {
            return Ok(());
        }

        let events = self.offload_oversized_payloads(results).await?;

        // A timed-out transaction is transient; the window is retried once.
        match self.persist_once(checkpoint_name, direction, results, &events).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                warn!(error = %err, "window transaction failed transiently, retrying once");
                self.persist_once(checkpoint_name, direction, results, &events).await
            }
            Err(err) => Err(err),
        }
    }

    /// Split events into inline and offloaded, writing blobs for the
    /// offloaded ones outside the window transaction.
    async fn offload_oversized_payloads(
        &self,
        results: &[FetchResult],
    ) -> Result<Vec<EventRecord>, StoreError> {
        let threshold = self.payload_inline_max_bytes;
        let mut events = Vec::new();
        let mut blobs: Vec<(String, serde_json::Value)> = Vec::new();

        for result in results {
            for event in &result.events {
                let mut event = event.clone();
                if let Some(payload) = event.payload.take() {
                    if sanitize::payload_size(&payload) > threshold {
                        event.payload_ref = Some(event.payload_hash.clone());
                        blobs.push((event.payload_hash.clone(), payload));
                    } else {
                        event.payload = Some(payload);
                    }
                }
                events.push(event);
            }
        }

        for chunk in blobs.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO raw.event_payload_blobs (payload_hash, payload) ",
            );
            qb.push_values(chunk, |mut b, (hash, payload)| {
                b.push_bind(hash).push_bind(payload);
            });
            qb.push(" ON CONFLICT (payload_hash) DO NOTHING");
            qb.build().execute(&self.pool).await.map_err(StoreError::from)?;
        }

        Ok(events)
    }

    async fn persist_once(
        &self,
        checkpoint_name: &str,
        direction: WindowDirection,
        results: &[FetchResult],
        events: &[EventRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        sqlx::query("SET LOCAL statement_timeout = 60000")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        // 1. Scripts, first: transactions reference them by hash.
        let scripts: Vec<_> = results.iter().flat_map(|r| r.scripts.iter()).collect();
        for chunk in scripts.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO raw.scripts (script_hash, script_text, length, first_seen_height) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(&s.script_hash)
                    .push_bind(&s.script_text)
                    .push_bind(s.length as i64)
                    .push_bind(s.first_seen_height as i64);
            });
            // Script rows are immutable: never rewritten once seen.
            qb.push(" ON CONFLICT (script_hash) DO NOTHING");
            qb.build().execute(&mut *tx).await.map_err(StoreError::from)?;
        }

        // 2. Blocks, ascending height order within the window.
        for chunk in results.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO raw.blocks \
                 (height, id, parent_id, timestamp, signatures, seals, collection_guarantees, \
                  execution_result_id, status) ",
            );
            qb.push_values(chunk, |mut b, r| {
                let block = &r.block;
                b.push_bind(block.height as i64)
                    .push_bind(&block.id)
                    .push_bind(&block.parent_id)
                    .push_bind(block.timestamp)
                    .push_bind(&block.signatures)
                    .push_bind(&block.seals)
                    .push_bind(&block.collection_guarantees)
                    .push_bind(&block.execution_result_id)
                    .push_bind(&block.status);
            });
            qb.push(
                " ON CONFLICT (height) DO UPDATE SET \
                  id = EXCLUDED.id, parent_id = EXCLUDED.parent_id, \
                  timestamp = EXCLUDED.timestamp, signatures = EXCLUDED.signatures, \
                  seals = EXCLUDED.seals, collection_guarantees = EXCLUDED.collection_guarantees, \
                  execution_result_id = EXCLUDED.execution_result_id, \
                  status = EXCLUDED.status, updated_at = now()",
            );
            qb.build().execute(&mut *tx).await.map_err(StoreError::from)?;
        }

        // 3. Transactions.
        let txs: Vec<_> = results.iter().flat_map(|r| r.transactions.iter()).collect();
        for chunk in txs.chunks(100) {
            let mut qb = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO raw.transactions \
                 (block_height, id, tx_index, script_hash, script_inline, arguments, proposer, \
                  proposer_key_index, proposer_sequence, payer, authorizers, payload_signatures, \
                  envelope_signatures, gas_limit, gas_used, status, error_message, is_evm, events_count) ",
            );
            qb.push_values(chunk, |mut b, t| {
                b.push_bind(t.block_height as i64)
                    .push_bind(&t.id)
                    .push_bind(t.tx_index as i32)
                    .push_bind(&t.script_hash)
                    .push_bind(&t.script_inline)
                    .push_bind(&t.arguments)
                    .push_bind(&t.proposer)
                    .push_bind(t.proposer_key_index as i64)
                    .push_bind(t.proposer_sequence as i64)
                    .push_bind(&t.payer)
                    .push_bind(&t.authorizers)
                    .push_bind(&t.payload_signatures)
                    .push_bind(&t.envelope_signatures)
                    .push_bind(t.gas_limit as i64)
                    .push_bind(t.gas_used as i64)
                    .push_bind(&t.status)
                    .push_bind(&t.error_message)
                    .push_bind(t.is_evm)
                    .push_bind(t.events_count as i32);
            });
            qb.push(
                " ON CONFLICT (block_height, id) DO UPDATE SET \
                  tx_index = EXCLUDED.tx_index, script_hash = EXCLUDED.script_hash, \
                  script_inline = EXCLUDED.script_inline, arguments = EXCLUDED.arguments, \
                  proposer = EXCLUDED.proposer, proposer_key_index = EXCLUDED.proposer_key_index, \
                  proposer_sequence = EXCLUDED.proposer_sequence, payer = EXCLUDED.payer, \
                  authorizers = EXCLUDED.authorizers, payload_signatures = EXCLUDED.payload_signatures, \
                  envelope_signatures = EXCLUDED.envelope_signatures, gas_limit = EXCLUDED.gas_limit, \
                  gas_used = EXCLUDED.gas_used, status = EXCLUDED.status, \
                  error_message = EXCLUDED.error_message, is_evm = EXCLUDED.is_evm, \
                  events_count = EXCLUDED.events_count, updated_at = now()",
            );
            qb.build().execute(&mut *tx).await.map_err(StoreError::from)?;
        }

        // 4. Events. Insert-only: the composite key is the identity.
        for chunk in events.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO raw.events \
                 (block_height, transaction_id, event_index, transaction_index, type, \
                  payload, payload_hash, payload_ref) ",
            );
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(e.block_height as i64)
                    .push_bind(&e.transaction_id)
                    .push_bind(e.event_index as i32)
                    .push_bind(e.transaction_index as i32)
                    .push_bind(&e.event_type)
                    .push_bind(&e.payload)
                    .push_bind(&e.payload_hash)
                    .push_bind(&e.payload_ref);
            });
            qb.push(" ON CONFLICT (block_height, transaction_id, event_index) DO NOTHING");
            qb.build().execute(&mut *tx).await.map_err(StoreError::from)?;
        }

        // 5. Block lookup, same transaction as the owning rows.
        for chunk in results.chunks(INSERT_CHUNK) {
            let mut qb =
                QueryBuilder::<sqlx::Postgres>::new("INSERT INTO raw.block_lookup (id, height) ");
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(&r.block.id).push_bind(r.block.height as i64);
            });
            qb.push(" ON CONFLICT (id) DO UPDATE SET height = EXCLUDED.height");
            qb.build().execute(&mut *tx).await.map_err(StoreError::from)?;
        }

        // 6. Tx lookup, with the EVM hash when the events revealed one.
        let evm_by_tx: std::collections::HashMap<String, String> = results
            .iter()
            .flat_map(|r| r.evm_hashes())
            .collect();
        for chunk in txs.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO raw.tx_lookup (id, block_height, tx_index, evm_hash) ",
            );
            qb.push_values(chunk, |mut b, t| {
                b.push_bind(&t.id)
                    .push_bind(t.block_height as i64)
                    .push_bind(t.tx_index as i32)
                    .push_bind(evm_by_tx.get(&t.id));
            });
            qb.push(
                " ON CONFLICT (id) DO UPDATE SET \
                  block_height = EXCLUDED.block_height, tx_index = EXCLUDED.tx_index, \
                  evm_hash = COALESCE(EXCLUDED.evm_hash, raw.tx_lookup.evm_hash)",
            );
            qb.build().execute(&mut *tx).await.map_err(StoreError::from)?;
        }

        // 7. Address activity.
        let activity: Vec<_> = results.iter().flat_map(|r| r.address_activity.iter()).collect();
        for chunk in activity.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO app.address_transactions (address, block_height, transaction_id, role) ",
            );
            qb.push_values(chunk, |mut b, a| {
                b.push_bind(&a.address)
                    .push_bind(a.block_height as i64)
                    .push_bind(&a.transaction_id)
                    .push_bind(a.role.as_str());
            });
            qb.push(" ON CONFLICT (address, block_height, transaction_id, role) DO NOTHING");
            qb.build().execute(&mut *tx).await.map_err(StoreError::from)?;
        }

        // 8. Account key change log: additions insert, revocations close the
        //    open row for that (address, key_index).
        for result in results {
            for change in &result.key_changes {
                match change {
                    AccountKeyChange::Added {
                        address,
                        key_index,
                        public_key,
                        block_height,
                    } => {
                        sqlx::query(
                            "INSERT INTO app.account_keys \
                               (address, key_index, public_key, added_at_height) \
                             VALUES ($1, $2, $3, $4) \
                             ON CONFLICT (address, key_index, public_key) DO NOTHING",
                        )
                        .bind(address)
                        .bind(*key_index as i64)
                        .bind(public_key)
                        .bind(*block_height as i64)
                        .execute(&mut *tx)
                        .await
                        .map_err(StoreError::from)?;
                    }
                    AccountKeyChange::Revoked {
                        address,
                        key_index,
                        block_height,
                    } => {
                        sqlx::query(
                            "UPDATE app.account_keys SET revoked_at_height = $3 \
                             WHERE address = $1 AND key_index = $2 AND revoked_at_height IS NULL",
                        )
                        .bind(address)
                        .bind(*key_index as i64)
                        .bind(*block_height as i64)
                        .execute(&mut *tx)
                        .await
                        .map_err(StoreError::from)?;
                    }
                }
            }
        }

        // 9. Checkpoint, inside the same transaction: no commit, no advance.
        let checkpoint = match direction {
            WindowDirection::Forward => results.last().map(|r| r.height()).unwrap_or(0),
            WindowDirection::Backward => results
                .first()
                .map(|r| r.height().saturating_sub(1))
                .unwrap_or(0),
        };
        sqlx::query(
            "INSERT INTO raw.checkpoints (worker_name, last_height, updated_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (worker_name) DO UPDATE \
             SET last_height = EXCLUDED.last_height, updated_at = now()",
        )
        .bind(checkpoint_name)
        .bind(checkpoint as i64)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        debug!(
            checkpoint_name,
            checkpoint,
            blocks = results.len(),
            "window committed"
        );
        Ok(())
    }

    /// Delete-then-reingest rollback: everything at or above from_height
    /// goes, raw and derived, and the affected watermarks are pulled back.
    pub(crate) async fn rollback_from_pg(
        &self,
        from_height: u64,
        forward_checkpoint: &str,
    ) -> Result<(), StoreError> {
        let h = from_height as i64;
        let new_checkpoint = from_height.saturating_sub(1) as i64;
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        for stmt in [
            "DELETE FROM raw.events WHERE block_height >= $1",
            "DELETE FROM raw.transactions WHERE block_height >= $1",
            "DELETE FROM raw.blocks WHERE height >= $1",
            "DELETE FROM raw.block_lookup WHERE height >= $1",
            "DELETE FROM raw.tx_lookup WHERE block_height >= $1",
            "DELETE FROM app.address_transactions WHERE block_height >= $1",
            "DELETE FROM app.token_transfers WHERE block_height >= $1",
            "DELETE FROM app.evm_transactions WHERE block_height >= $1",
            "DELETE FROM app.account_keys WHERE added_at_height >= $1",
            "UPDATE app.account_keys SET revoked_at_height = NULL WHERE revoked_at_height >= $1",
        ] {
            sqlx::query(stmt)
                .bind(h)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
        }

        sqlx::query("UPDATE raw.checkpoints SET last_height = $2, updated_at = now() WHERE worker_name = $1")
            .bind(forward_checkpoint)
            .bind(new_checkpoint)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        // Derivation watermarks that advanced past the cut come back to it.
        sqlx::query(
            "UPDATE raw.checkpoints SET last_height = $2, updated_at = now() \
             WHERE worker_name LIKE $1 AND last_height > $2",
        )
        .bind(format!("{}%", DERIVATION_CHECKPOINT_PREFIX))
        .bind(new_checkpoint)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        // Leases overlapping the deleted heights are dropped so their
        // ranges get re-claimed and re-derived after re-ingestion. Leaving
        // them COMPLETED would let the committer re-advance over deleted
        // data.
        sqlx::query("DELETE FROM raw.worker_leases WHERE to_height > $1")
            .bind(h)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }
}
