/// Fetch workers
///
/// Stateless workers that turn a height into a FetchResult: block,
/// collections, transactions, results, events, plus everything derived on
/// the way (script blobs, address activity, token-transfer candidates,
/// account key changes). Nothing here writes to the database.
///
/// Concurrency follows the same shape as file-parallel import: a semaphore
/// bounds in-flight heights, results are collected and sorted by the caller.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::addresses;
use crate::error::IndexError;
use crate::metrics;
use crate::node_pool::CallOutcome;
use crate::rpc::{ApiEvent, ApiTransaction, ApiTransactionResult, RpcClient};
use crate::sanitize;
use crate::types::{
    AccountKeyChange, BlockRecord, EventRecord, FetchResult, ScriptBlob, TokenTransferCandidate,
    TransferDirection, TxRecord,
};

/// Endpoint switches per height before the task fails.
const ENDPOINT_ATTEMPTS: u32 = 3;

/// Script marker that flags a transaction as touching the EVM.
const EVM_IMPORT_MARKER: &str = "import EVM";

#[derive(Debug, Clone, Copy)]
pub struct FetchTask {
    pub height: u64,
}

pub struct Fetcher {
    client: Arc<RpcClient>,
    /// 0 disables script inlining entirely.
    script_inline_max_bytes: usize,
}

impl Fetcher {
    pub fn new(client: Arc<RpcClient>, script_inline_max_bytes: usize) -> Self {
        Self {
            client,
            script_inline_max_bytes,
        }
    }

    /// Fetch every height of a window with bounded concurrency. Fails the
    /// whole window if any height fails permanently; the caller retries the
    /// window. Results come back sorted ascending by height.
    pub async fn fetch_window(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        heights: impl IntoIterator<Item = u64>,
        max_concurrent: usize,
    ) -> Result<Vec<FetchResult>, IndexError> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut handles = Vec::new();

        for height in heights {
            let fetcher = Arc::clone(self);
            let sem = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|_| IndexError::Cancelled)?;
                fetcher.fetch_height(&cancel, FetchTask { height }).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(IndexError::Fatal(format!("fetch task panicked: {}", join_err)));
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        results.sort_by_key(|r| r.height());
        Ok(results)
    }

    /// Fetch one height, switching endpoints on failure. All sub-calls for
    /// the block go to the endpoint pinned at the top of each attempt.
    pub async fn fetch_height(
        &self,
        cancel: &CancellationToken,
        task: FetchTask,
    ) -> Result<FetchResult, IndexError> {
        let started = std::time::Instant::now();
        let mut last_err: Option<IndexError> = None;

        for attempt in 1..=ENDPOINT_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            let endpoint = self.client.pin_endpoint(task.height, cancel).await?;
            let outcome = self.fetch_on_endpoint(cancel, &endpoint, task.height).await;
            self.client
                .pool
                .release(&endpoint, if outcome.is_ok() { CallOutcome::Success } else { CallOutcome::Failure })
                .await;

            match outcome {
                Ok(result) => {
                    metrics::FETCH_HEIGHT_DURATION.observe(started.elapsed().as_secs_f64());
                    return Ok(result);
                }
                Err(err) => {
                    let retry_elsewhere = match &err {
                        IndexError::Rpc(rpc) => rpc.kind.is_retryable(),
                        IndexError::Cancelled => return Err(err),
                        _ => false,
                    };
                    if !retry_elsewhere || attempt == ENDPOINT_ATTEMPTS {
                        warn!(height = task.height, attempt, error = %err, "fetch failed");
                        return Err(err);
                    }
                    debug!(height = task.height, attempt, endpoint = %endpoint, error = %err, "fetch failed, switching endpoint");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| IndexError::Fatal("fetch attempts exhausted".into())))
    }

    async fn fetch_on_endpoint(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        height: u64,
    ) -> Result<FetchResult, IndexError> {
        let block = self.client.block_by_height(cancel, endpoint, height).await?;

        // Transaction ids come from the block's collections, in guarantee
        // order, which defines tx_index.
        let mut tx_ids = Vec::new();
        for guarantee in &block.collection_guarantees {
            let collection = self
                .client
                .collection(cancel, endpoint, &guarantee.collection_id, height)
                .await?;
            tx_ids.extend(collection.transaction_ids);
        }

        let txs = self
            .client
            .transactions_for_block(cancel, endpoint, &block.id, &tx_ids, height)
            .await?;
        let (results, _strategy) = self
            .client
            .transaction_results_for_block(cancel, endpoint, &block.id, &tx_ids, height)
            .await?;

        let events = self
            .events_for_results(cancel, endpoint, &block.id, height, &results)
            .await?;

        Ok(self.assemble(block, tx_ids, txs, results, events, height))
    }

    /// Use the events carried in the results when they are complete;
    /// otherwise re-fetch by the event-type list the results reference.
    async fn events_for_results(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        block_id: &str,
        height: u64,
        results: &[ApiTransactionResult],
    ) -> Result<Vec<ApiEvent>, IndexError> {
        let inline: Vec<ApiEvent> = results.iter().flat_map(|r| r.events.iter().cloned()).collect();
        let complete = !inline.is_empty() && inline.iter().all(|e| !e.payload.is_null());
        if complete || inline.is_empty() {
            return Ok(inline);
        }

        let mut types: Vec<String> = inline.iter().map(|e| e.event_type.clone()).collect();
        types.sort();
        types.dedup();
        let refetched = self
            .client
            .events_for_block(cancel, endpoint, block_id, height, &types)
            .await?;
        Ok(refetched)
    }

    fn assemble(
        &self,
        block: crate::rpc::ApiBlock,
        tx_ids: Vec<String>,
        txs: Vec<ApiTransaction>,
        results: Vec<ApiTransactionResult>,
        events: Vec<ApiEvent>,
        height: u64,
    ) -> FetchResult {
        let block_record = BlockRecord {
            height: block.height,
            id: block.id.to_lowercase(),
            parent_id: block.parent_id.to_lowercase(),
            timestamp: block.timestamp,
            signatures: block.signatures,
            seals: block.seals,
            collection_guarantees: serde_json::to_value(
                block
                    .collection_guarantees
                    .iter()
                    .map(|g| g.collection_id.clone())
                    .collect::<Vec<_>>(),
            )
            .unwrap_or_default(),
            execution_result_id: block.execution_result_id,
            status: block.status,
        };

        let results_by_tx: HashMap<&str, &ApiTransactionResult> = results
            .iter()
            .map(|r| (r.transaction_id.as_str(), r))
            .collect();
        let txs_by_id: HashMap<&str, &ApiTransaction> =
            txs.iter().map(|t| (t.id.as_str(), t)).collect();

        // Event rows first: tx assembly reads per-tx counts off them.
        let mut event_records = Vec::with_capacity(events.len());
        let mut events_per_tx: HashMap<String, u32> = HashMap::new();
        for event in events {
            let tx_id = event.transaction_id.to_lowercase();
            *events_per_tx.entry(tx_id.clone()).or_default() += 1;
            event_records.push(EventRecord {
                block_height: height,
                transaction_id: tx_id,
                event_index: event.event_index,
                transaction_index: event.transaction_index,
                event_type: event.event_type,
                payload_hash: sanitize::payload_hash(&event.payload),
                payload: Some(event.payload),
                payload_ref: None,
            });
        }

        let mut scripts: HashMap<String, ScriptBlob> = HashMap::new();
        let mut tx_records = Vec::with_capacity(tx_ids.len());

        for (tx_index, tx_id) in tx_ids.iter().enumerate() {
            let Some(tx) = txs_by_id.get(tx_id.as_str()) else {
                // The results join below tolerates the same gap; the
                // reconciler picks up anything the node failed to serve.
                warn!(height, tx = %crate::telemetry::truncate_hex(tx_id, 16), "transaction missing from node response");
                continue;
            };
            let result = results_by_tx.get(tx_id.as_str());

            let script_hash = sanitize::script_hash(&tx.script);
            scripts.entry(script_hash.clone()).or_insert_with(|| ScriptBlob {
                script_hash: script_hash.clone(),
                script_text: tx.script.clone(),
                length: tx.script.len() as u64,
                first_seen_height: height,
            });

            let script_inline = (self.script_inline_max_bytes > 0
                && tx.script.len() <= self.script_inline_max_bytes)
                .then(|| tx.script.clone());

            let is_evm = tx.script.contains(EVM_IMPORT_MARKER);
            let id_lower = tx_id.to_lowercase();

            tx_records.push(TxRecord {
                id: id_lower.clone(),
                block_height: height,
                tx_index: tx_index as u32,
                script_hash,
                script_inline,
                arguments: tx.arguments.clone(),
                proposer: sanitize::normalize_address(&tx.proposal_key.address),
                proposer_key_index: tx.proposal_key.key_index,
                proposer_sequence: tx.proposal_key.sequence_number,
                payer: sanitize::normalize_address(&tx.payer),
                authorizers: tx
                    .authorizers
                    .iter()
                    .map(|a| sanitize::normalize_address(a))
                    .collect(),
                payload_signatures: tx.payload_signatures.clone(),
                envelope_signatures: tx.envelope_signatures.clone(),
                gas_limit: tx.gas_limit,
                gas_used: result.map(|r| r.computation_used).unwrap_or(0),
                status: result
                    .map(|r| r.status.clone())
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
                error_message: result.and_then(|r| r.error_message.clone()),
                is_evm,
                events_count: events_per_tx.get(&id_lower).copied().unwrap_or(0),
            });
        }

        let address_activity = tx_records
            .iter()
            .flat_map(|tx| addresses::derive_address_activity(tx, &event_records))
            .collect();
        let token_transfers = extract_token_transfers(&event_records);
        let key_changes = extract_key_changes(&event_records);

        FetchResult {
            block: block_record,
            transactions: tx_records,
            events: event_records,
            scripts: scripts.into_values().collect(),
            address_activity,
            token_transfers,
            key_changes,
        }
    }
}

/// Fungible-token movements referenced by this block's events. The last
/// type segment decides the direction; the contract is the type without it.
pub fn extract_token_transfers(events: &[EventRecord]) -> Vec<TokenTransferCandidate> {
    let mut candidates = Vec::new();
    for event in events {
        let Some((contract, last)) = event.event_type.rsplit_once('.') else {
            continue;
        };
        let (direction, counterparty_field) = match last {
            "TokensDeposited" | "Deposited" => (TransferDirection::Deposit, "to"),
            "TokensWithdrawn" | "Withdrawn" => (TransferDirection::Withdraw, "from"),
            _ => continue,
        };
        let Some(payload) = &event.payload else { continue };
        let Some(amount) = addresses::cadence_field(payload, "amount")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
        else {
            continue;
        };
        let counterparty = addresses::cadence_field(payload, counterparty_field)
            .and_then(|v| v.as_str())
            .filter(|s| addresses::looks_like_address(s))
            .map(sanitize::normalize_address);

        candidates.push(TokenTransferCandidate {
            block_height: event.block_height,
            transaction_id: event.transaction_id.clone(),
            event_index: event.event_index,
            token_contract: contract.to_string(),
            amount,
            counterparty,
            direction,
        });
    }
    candidates
}

/// Account key additions and revocations from the core key events.
pub fn extract_key_changes(events: &[EventRecord]) -> Vec<AccountKeyChange> {
    let mut changes = Vec::new();
    for event in events {
        let added = event.event_type == "flow.AccountKeyAdded";
        let removed = event.event_type == "flow.AccountKeyRemoved";
        if !added && !removed {
            continue;
        }
        let Some(payload) = &event.payload else { continue };
        let Some(address) = addresses::cadence_field(payload, "address")
            .and_then(|v| v.as_str())
            .map(sanitize::normalize_address)
        else {
            continue;
        };
        let key_index = addresses::cadence_field(payload, "keyIndex")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(0);

        if added {
            let Some(public_key) = addresses::cadence_field(payload, "publicKey")
                .and_then(|v| v.as_str().map(|s| s.to_string()))
            else {
                continue;
            };
            changes.push(AccountKeyChange::Added {
                address,
                key_index,
                public_key,
                block_height: event.block_height,
            });
        } else {
            changes.push(AccountKeyChange::Revoked {
                address,
                key_index,
                block_height: event.block_height,
            });
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: serde_json::Value) -> EventRecord {
        EventRecord {
            block_height: 100,
            transaction_id: "cd".repeat(16),
            event_index: 0,
            transaction_index: 0,
            event_type: event_type.to_string(),
            payload_hash: sanitize::payload_hash(&payload),
            payload: Some(payload),
            payload_ref: None,
        }
    }

    #[test]
    fn test_extract_token_transfers() {
        let events = vec![
            event(
                "A.1654653399040a61.FlowToken.TokensDeposited",
                json!({"value": {"fields": [
                    {"name": "amount", "value": {"type": "UFix64", "value": "10.5"}},
                    {"name": "to", "value": {"type": "Address", "value": "0xf919ee77447b7497"}}
                ]}}),
            ),
            event(
                "A.1654653399040a61.FlowToken.TokensWithdrawn",
                json!({"value": {"fields": [
                    {"name": "amount", "value": {"type": "UFix64", "value": "10.5"}},
                    {"name": "from", "value": {"type": "Address", "value": "0x1654653399040a61"}}
                ]}}),
            ),
            event("A.1.Other.Minted", json!({})),
        ];

        let transfers = extract_token_transfers(&events);
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].direction, TransferDirection::Deposit);
        assert_eq!(transfers[0].token_contract, "A.1654653399040a61.FlowToken");
        assert_eq!(transfers[0].amount, "10.5");
        assert_eq!(transfers[0].counterparty.as_deref(), Some("f919ee77447b7497"));
        assert_eq!(transfers[1].direction, TransferDirection::Withdraw);
    }

    #[test]
    fn test_extract_key_changes() {
        let events = vec![
            event(
                "flow.AccountKeyAdded",
                json!({"value": {"fields": [
                    {"name": "address", "value": {"type": "Address", "value": "0x1654653399040a61"}},
                    {"name": "publicKey", "value": {"type": "String", "value": "abcd"}},
                    {"name": "keyIndex", "value": {"type": "Int", "value": "2"}}
                ]}}),
            ),
            event(
                "flow.AccountKeyRemoved",
                json!({"value": {"fields": [
                    {"name": "address", "value": {"type": "Address", "value": "0x1654653399040a61"}},
                    {"name": "keyIndex", "value": {"type": "Int", "value": "2"}}
                ]}}),
            ),
        ];

        let changes = extract_key_changes(&events);
        assert_eq!(changes.len(), 2);
        match &changes[0] {
            AccountKeyChange::Added { address, key_index, public_key, .. } => {
                assert_eq!(address, "1654653399040a61");
                assert_eq!(*key_index, 2);
                assert_eq!(public_key, "abcd");
            }
            other => panic!("expected Added, got {:?}", other),
        }
        assert!(matches!(changes[1], AccountKeyChange::Revoked { key_index: 2, .. }));
    }

    #[test]
    fn test_transfer_without_amount_is_skipped() {
        let events = vec![event(
            "A.1.FlowToken.TokensDeposited",
            json!({"value": {"fields": []}}),
        )];
        assert!(extract_token_transfers(&events).is_empty());
    }
}
