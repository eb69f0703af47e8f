/// Test scaffolding: an in-memory Store, a scriptable access-node mock over
/// a synthetic chain, and builders shared by the scenario tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use crate::config::{Settings, SporkEntry};
use crate::error::{RpcError, RpcErrorKind, StoreError};
use crate::fetcher;
use crate::node_pool::NodePool;
use crate::rpc::{
    AccessApi, ApiBlock, ApiCollection, ApiCollectionGuarantee, ApiEvent, ApiProposalKey,
    ApiTransaction, ApiTransactionResult, RpcClient,
};
use crate::sanitize;
use crate::sporks::SporkRouter;
use crate::store::{LookupRepairReport, Store, WindowDirection};
use crate::types::{
    BlockRecord, Checkpoint, EventRecord, FetchResult, IndexingErrorRecord, Lease, LeaseStatus,
    ScriptBlob, TokenTransferCandidate, TxRecord,
};

pub const GENESIS_PARENT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub fn block_id(seed: &str, height: u64) -> String {
    sanitize::sha256_hex(format!("block-{}-{}", seed, height).as_bytes())
}

pub fn tx_id(height: u64, index: usize) -> String {
    sanitize::sha256_hex(format!("tx-{}-{}", height, index).as_bytes())
}

pub fn ts(height: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + height as i64, 0).unwrap()
}

/// A FetchResult for tests that bypass the fetcher. Ids chain by seed.
pub fn synthetic_result(height: u64, tx_count: usize, seed: &str) -> FetchResult {
    let parent_id = if height == 0 {
        GENESIS_PARENT.to_string()
    } else {
        block_id(seed, height - 1)
    };
    let block = BlockRecord {
        height,
        id: block_id(seed, height),
        parent_id,
        timestamp: ts(height),
        signatures: json!([]),
        seals: json!([]),
        collection_guarantees: json!([format!("col{}", height)]),
        execution_result_id: None,
        status: "SEALED".to_string(),
    };

    let script = "transaction { execute {} }";
    let script_hash = sanitize::script_hash(script);
    let transactions: Vec<TxRecord> = (0..tx_count)
        .map(|i| TxRecord {
            id: tx_id(height, i),
            block_height: height,
            tx_index: i as u32,
            script_hash: script_hash.clone(),
            script_inline: Some(script.to_string()),
            arguments: json!([]),
            proposer: "1654653399040a61".to_string(),
            proposer_key_index: 0,
            proposer_sequence: height,
            payer: "f919ee77447b7497".to_string(),
            authorizers: vec!["e467b9dd11fa00df".to_string()],
            payload_signatures: json!([]),
            envelope_signatures: json!([]),
            gas_limit: 1000,
            gas_used: 7,
            status: "SEALED".to_string(),
            error_message: None,
            is_evm: false,
            events_count: 0,
        })
        .collect();

    let scripts = if tx_count > 0 {
        vec![ScriptBlob {
            script_hash,
            script_text: script.to_string(),
            length: script.len() as u64,
            first_seen_height: height,
        }]
    } else {
        Vec::new()
    };

    let address_activity = transactions
        .iter()
        .flat_map(|tx| crate::addresses::derive_address_activity(tx, &[]))
        .collect();

    FetchResult {
        block,
        transactions,
        events: Vec::new(),
        scripts,
        address_activity,
        token_transfers: Vec::new(),
        key_changes: Vec::new(),
    }
}

/// Deposit event payload in JSON-CDC shape.
pub fn deposit_payload(amount: &str, to: &str) -> Value {
    json!({
        "type": "Event",
        "value": {
            "id": "A.1654653399040a61.FlowToken.TokensDeposited",
            "fields": [
                {"name": "amount", "value": {"type": "UFix64", "value": amount}},
                {"name": "to", "value": {"type": "Address", "value": to}}
            ]
        }
    })
}

// ----------------------------------------------------------------------
// In-memory store
// ----------------------------------------------------------------------

#[derive(Default, Clone)]
struct MemState {
    blocks: BTreeMap<u64, BlockRecord>,
    transactions: BTreeMap<(u64, String), TxRecord>,
    events: BTreeMap<(u64, String, u32), EventRecord>,
    scripts: HashMap<String, ScriptBlob>,
    block_lookup: HashMap<String, u64>,
    tx_lookup: BTreeMap<String, (u64, u32, Option<String>)>,
    address_activity: HashSet<(String, u64, String, String)>,
    account_keys: HashMap<(String, u64, String), (u64, Option<u64>)>,
    token_transfers: BTreeMap<(u64, String, u32), TokenTransferCandidate>,
    evm_transactions: BTreeMap<(u64, String), String>,
    checkpoints: HashMap<String, Checkpoint>,
    leases: BTreeMap<(String, u64), Lease>,
    error_keys: HashSet<(String, u64, Option<String>, String)>,
    errors: Vec<IndexingErrorRecord>,
    blobs: HashMap<String, (Value, DateTime<Utc>)>,
    partition_calls: u64,
}

/// Store double with the same idempotence and atomicity contract as
/// PgStore (one lock held per operation stands in for one transaction).
pub struct MemStore {
    payload_inline_max_bytes: usize,
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new(payload_inline_max_bytes: usize) -> Self {
        Self {
            payload_inline_max_bytes,
            state: Mutex::new(MemState::default()),
        }
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().unwrap().blocks.len()
    }

    pub fn tx_count(&self) -> usize {
        self.state.lock().unwrap().transactions.len()
    }

    pub fn tx_lookup_count(&self) -> usize {
        self.state.lock().unwrap().tx_lookup.len()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    pub fn token_transfer_count(&self) -> usize {
        self.state.lock().unwrap().token_transfers.len()
    }

    pub fn evm_transaction_count(&self) -> usize {
        self.state.lock().unwrap().evm_transactions.len()
    }

    pub fn checkpoint_height(&self, name: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .get(name)
            .map(|c| c.last_height)
    }

    pub fn lease(&self, worker_type: &str, from_height: u64) -> Option<Lease> {
        self.state
            .lock()
            .unwrap()
            .leases
            .get(&(worker_type.to_string(), from_height))
            .cloned()
    }

    pub fn errors(&self) -> Vec<IndexingErrorRecord> {
        self.state.lock().unwrap().errors.clone()
    }

    pub fn event(&self, height: u64, tx: &str, index: u32) -> Option<EventRecord> {
        self.state
            .lock()
            .unwrap()
            .events
            .get(&(height, tx.to_string(), index))
            .cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().unwrap().blobs.len()
    }

    pub fn insert_lease(&self, lease: Lease) {
        self.state
            .lock()
            .unwrap()
            .leases
            .insert((lease.worker_type.clone(), lease.from_height), lease);
    }

    pub fn delete_tx_lookup(&self, id: &str) {
        self.state.lock().unwrap().tx_lookup.remove(id);
    }

    pub fn insert_dangling_lookup(&self, id: &str, height: u64) {
        self.state
            .lock()
            .unwrap()
            .tx_lookup
            .insert(id.to_string(), (height, 0, None));
    }

    /// Comparable snapshot of the raw tables, for idempotence checks.
    pub fn raw_fingerprint(&self) -> (Vec<BlockRecord>, Vec<TxRecord>, Vec<EventRecord>, Vec<(String, (u64, u32, Option<String>))>) {
        let state = self.state.lock().unwrap();
        (
            state.blocks.values().cloned().collect(),
            state.transactions.values().cloned().collect(),
            state.events.values().cloned().collect(),
            state.tx_lookup.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        )
    }
}

#[async_trait]
impl Store for MemStore {
    async fn persist_window(
        &self,
        checkpoint_name: &str,
        direction: WindowDirection,
        results: &[FetchResult],
    ) -> Result<(), StoreError> {
        if results.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();

        for result in results {
            for script in &result.scripts {
                state
                    .scripts
                    .entry(script.script_hash.clone())
                    .or_insert_with(|| script.clone());
            }

            state.blocks.insert(result.block.height, result.block.clone());
            state
                .block_lookup
                .insert(result.block.id.clone(), result.block.height);

            let evm_hashes: HashMap<String, String> = result.evm_hashes().into_iter().collect();
            for tx in &result.transactions {
                state
                    .transactions
                    .insert((tx.block_height, tx.id.clone()), tx.clone());
                let evm = evm_hashes.get(&tx.id).cloned();
                let entry = state
                    .tx_lookup
                    .entry(tx.id.clone())
                    .or_insert((tx.block_height, tx.tx_index, None));
                *entry = (tx.block_height, tx.tx_index, evm.or(entry.2.clone()));
            }

            for event in &result.events {
                let mut event = event.clone();
                if let Some(payload) = event.payload.take() {
                    if sanitize::payload_size(&payload) > self.payload_inline_max_bytes {
                        event.payload_ref = Some(event.payload_hash.clone());
                        state
                            .blobs
                            .entry(event.payload_hash.clone())
                            .or_insert((payload, Utc::now()));
                    } else {
                        event.payload = Some(payload);
                    }
                }
                let key = (
                    event.block_height,
                    event.transaction_id.clone(),
                    event.event_index,
                );
                state.events.entry(key).or_insert(event);
            }

            for activity in &result.address_activity {
                state.address_activity.insert((
                    activity.address.clone(),
                    activity.block_height,
                    activity.transaction_id.clone(),
                    activity.role.as_str().to_string(),
                ));
            }

            for change in &result.key_changes {
                match change {
                    crate::types::AccountKeyChange::Added {
                        address,
                        key_index,
                        public_key,
                        block_height,
                    } => {
                        state
                            .account_keys
                            .entry((address.clone(), *key_index, public_key.clone()))
                            .or_insert((*block_height, None));
                    }
                    crate::types::AccountKeyChange::Revoked {
                        address,
                        key_index,
                        block_height,
                    } => {
                        for ((a, k, _), v) in state.account_keys.iter_mut() {
                            if a == address && k == key_index && v.1.is_none() {
                                v.1 = Some(*block_height);
                            }
                        }
                    }
                }
            }
        }

        let checkpoint = match direction {
            WindowDirection::Forward => results.last().unwrap().height(),
            WindowDirection::Backward => results.first().unwrap().height().saturating_sub(1),
        };
        state.checkpoints.insert(
            checkpoint_name.to_string(),
            Checkpoint {
                worker_name: checkpoint_name.to_string(),
                last_height: checkpoint,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn last_persisted_block(&self) -> Result<Option<(u64, String)>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blocks
            .iter()
            .next_back()
            .map(|(h, b)| (*h, b.id.clone())))
    }

    async fn block_id_at(&self, height: u64) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.blocks.get(&height).map(|b| b.id.clone()))
    }

    async fn ensure_partitions(&self, _lo: u64, _hi: u64) -> Result<(), StoreError> {
        self.state.lock().unwrap().partition_calls += 1;
        Ok(())
    }

    async fn rollback_from(
        &self,
        from_height: u64,
        forward_checkpoint: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let new_checkpoint = from_height.saturating_sub(1);

        state.blocks.retain(|h, _| *h < from_height);
        state.transactions.retain(|(h, _), _| *h < from_height);
        state.events.retain(|(h, _, _), _| *h < from_height);
        state.block_lookup.retain(|_, h| *h < from_height);
        state.tx_lookup.retain(|_, (h, _, _)| *h < from_height);
        state
            .address_activity
            .retain(|(_, h, _, _)| *h < from_height);
        state.token_transfers.retain(|(h, _, _), _| *h < from_height);
        state.evm_transactions.retain(|(h, _), _| *h < from_height);
        state.account_keys.retain(|_, (added, _)| *added < from_height);
        for (_, revoked) in state.account_keys.values_mut() {
            if revoked.map(|h| h >= from_height).unwrap_or(false) {
                *revoked = None;
            }
        }
        state.leases.retain(|_, lease| lease.to_height <= from_height);

        if let Some(cp) = state.checkpoints.get_mut(forward_checkpoint) {
            cp.last_height = new_checkpoint;
            cp.updated_at = Utc::now();
        }
        for (name, cp) in state.checkpoints.iter_mut() {
            if name.starts_with(crate::db::DERIVATION_CHECKPOINT_PREFIX)
                && cp.last_height > new_checkpoint
            {
                cp.last_height = new_checkpoint;
            }
        }
        Ok(())
    }

    async fn checkpoint(&self, worker_name: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .get(worker_name)
            .cloned())
    }

    async fn set_checkpoint(&self, worker_name: &str, last_height: u64) -> Result<(), StoreError> {
        self.state.lock().unwrap().checkpoints.insert(
            worker_name.to_string(),
            Checkpoint {
                worker_name: worker_name.to_string(),
                last_height,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn watermarks(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let mut rows: Vec<Checkpoint> = self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .values()
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.worker_name.cmp(&b.worker_name));
        Ok(rows)
    }

    async fn reacquire_failed_lease(
        &self,
        worker_type: &str,
        leased_by: &str,
        max_attempts: u32,
        lease_duration: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let candidate = state
            .leases
            .iter()
            .find(|((wt, _), lease)| {
                wt == worker_type
                    && lease.status == LeaseStatus::Failed
                    && lease.attempt < max_attempts
            })
            .map(|(key, _)| key.clone());
        let Some(key) = candidate else { return Ok(None) };
        let lease = state.leases.get_mut(&key).unwrap();
        lease.status = LeaseStatus::Active;
        lease.leased_by = leased_by.to_string();
        lease.lease_expires_at =
            Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        Ok(Some(lease.clone()))
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
        let mut state = self.state.lock().unwrap();
        let mut from = start_from - (start_from % range_size);
        while from < search_cap {
            let key = (worker_type.to_string(), from);
            if !state.leases.contains_key(&key) {
                let lease = Lease {
                    worker_type: worker_type.to_string(),
                    from_height: from,
                    to_height: from + range_size,
                    status: LeaseStatus::Active,
                    attempt: 0,
                    leased_by: leased_by.to_string(),
                    lease_expires_at: Utc::now()
                        + chrono::Duration::from_std(lease_duration).unwrap_or_default(),
                };
                state.leases.insert(key, lease.clone());
                return Ok(Some(lease));
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
        let mut state = self.state.lock().unwrap();
        match state
            .leases
            .get_mut(&(worker_type.to_string(), from_height))
        {
            Some(lease) if lease.leased_by == leased_by && lease.status == LeaseStatus::Active => {
                lease.lease_expires_at =
                    Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_lease(
        &self,
        worker_type: &str,
        from_height: u64,
        leased_by: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(lease) = state
            .leases
            .get_mut(&(worker_type.to_string(), from_height))
        {
            if lease.leased_by == leased_by && lease.status == LeaseStatus::Active {
                lease.status = LeaseStatus::Completed;
            }
        }
        Ok(())
    }

    async fn completed_lease_at(
        &self,
        worker_type: &str,
        from_height: u64,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .leases
            .get(&(worker_type.to_string(), from_height))
            .map(|l| l.status == LeaseStatus::Completed)
            .unwrap_or(false))
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut expired = Vec::new();
        for lease in state.leases.values_mut() {
            if lease.status == LeaseStatus::Active && lease.lease_expires_at < now {
                lease.status = LeaseStatus::Failed;
                lease.attempt += 1;
                expired.push(lease.clone());
            }
        }
        Ok(expired)
    }

    async fn derive_token_transfers(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let events: Vec<EventRecord> = state
            .events
            .values()
            .filter(|e| e.block_height >= from && e.block_height < to)
            .cloned()
            .map(|mut e| {
                // Join offloaded payloads back in, as the SQL path does.
                if e.payload.is_none() {
                    if let Some(r) = &e.payload_ref {
                        e.payload = state.blobs.get(r).map(|(v, _)| v.clone());
                    }
                }
                e
            })
            .collect();
        let mut written = 0;
        for candidate in fetcher::extract_token_transfers(&events) {
            let key = (
                candidate.block_height,
                candidate.transaction_id.clone(),
                candidate.event_index,
            );
            if let std::collections::btree_map::Entry::Vacant(entry) =
                state.token_transfers.entry(key)
            {
                entry.insert(candidate);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn derive_evm_transactions(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let rows: Vec<(u64, String, String)> = state
            .events
            .values()
            .filter(|e| e.block_height >= from && e.block_height < to)
            .filter(|e| e.event_type.ends_with(".EVM.TransactionExecuted"))
            .filter_map(|e| {
                let payload = e.payload.as_ref()?;
                let hash = crate::addresses::cadence_field(payload, "hash")?
                    .as_str()
                    .map(sanitize::normalize_address)?;
                Some((e.block_height, e.transaction_id.clone(), hash))
            })
            .collect();
        let mut written = 0;
        for (height, tx, hash) in rows {
            if state
                .evm_transactions
                .insert((height, hash), tx)
                .is_none()
            {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn record_indexing_error(&self, record: &IndexingErrorRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = (
            record.worker_name.clone(),
            record.block_height,
            record.transaction_id.clone(),
            record.error_hash.clone(),
        );
        if state.error_keys.insert(key) {
            state.errors.push(record.clone());
        }
        Ok(())
    }

    async fn repair_lookups(&self, limit: u64) -> Result<LookupRepairReport, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut report = LookupRepairReport::default();

        let dangling: Vec<String> = state
            .tx_lookup
            .iter()
            .filter(|(id, (h, _, _))| !state.transactions.contains_key(&(*h, (*id).clone())))
            .map(|(id, _)| id.clone())
            .take(limit as usize)
            .collect();
        for id in dangling {
            state.tx_lookup.remove(&id);
            report.dangling_lookups_deleted += 1;
        }

        let missing: Vec<(String, u64, u32)> = state
            .transactions
            .values()
            .filter(|tx| !state.tx_lookup.contains_key(&tx.id))
            .map(|tx| (tx.id.clone(), tx.block_height, tx.tx_index))
            .take(limit as usize)
            .collect();
        for (id, height, index) in missing {
            state.tx_lookup.insert(id, (height, index, None));
            report.lookups_backfilled += 1;
        }
        Ok(report)
    }

    async fn reclaim_orphan_blobs(&self, grace: Duration) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_default();
        let referenced: HashSet<String> = state
            .events
            .values()
            .filter_map(|e| e.payload_ref.clone())
            .collect();
        let before = state.blobs.len();
        state
            .blobs
            .retain(|hash, (_, created)| referenced.contains(hash) || *created >= cutoff);
        Ok((before - state.blobs.len()) as u64)
    }
}

// ----------------------------------------------------------------------
// Synthetic chain + access mock
// ----------------------------------------------------------------------

/// Chain ids are derived from a per-height seed; rewriting from a height
/// with a new seed models a reorg (descendants change too).
pub struct MockChain {
    seeds: BTreeMap<u64, String>,
    pub tip: u64,
    pub txs_per_block: usize,
}

impl MockChain {
    pub fn new(tip: u64, txs_per_block: usize) -> Self {
        let mut seeds = BTreeMap::new();
        seeds.insert(0, "main".to_string());
        Self {
            seeds,
            tip,
            txs_per_block,
        }
    }

    fn seed_for(&self, height: u64) -> &str {
        self.seeds
            .range(..=height)
            .next_back()
            .map(|(_, s)| s.as_str())
            .unwrap_or("main")
    }

    pub fn id(&self, height: u64) -> String {
        block_id(self.seed_for(height), height)
    }

    pub fn parent_id(&self, height: u64) -> String {
        if height == 0 {
            GENESIS_PARENT.to_string()
        } else {
            self.id(height - 1)
        }
    }

    pub fn height_of(&self, id: &str) -> Option<u64> {
        (0..=self.tip).find(|h| self.id(*h) == id)
    }

    /// Rewrite the chain from `height` up with a new seed: that block and
    /// all descendants get new ids.
    pub fn rewrite_from(&mut self, height: u64, new_seed: &str) {
        self.seeds.insert(height, new_seed.to_string());
    }
}

/// Scriptable AccessApi over a MockChain. Records call counts per method
/// and the endpoint used per fetched height; methods can be forced to fail
/// with a given error kind.
pub struct MockAccess {
    pub chain: Mutex<MockChain>,
    calls: Mutex<HashMap<&'static str, u64>>,
    block_endpoints: Mutex<Vec<(u64, String)>>,
    fail: Mutex<HashMap<&'static str, RpcErrorKind>>,
    /// Mark every transaction as an EVM one with a matching executed event.
    pub evm: bool,
}

impl MockAccess {
    pub fn new(chain: MockChain) -> Self {
        Self {
            chain: Mutex::new(chain),
            calls: Mutex::new(HashMap::new()),
            block_endpoints: Mutex::new(Vec::new()),
            fail: Mutex::new(HashMap::new()),
            evm: false,
        }
    }

    pub fn fail_method(&self, method: &'static str, kind: RpcErrorKind) {
        self.fail.lock().unwrap().insert(method, kind);
    }

    pub fn clear_failure(&self, method: &'static str) {
        self.fail.lock().unwrap().remove(method);
    }

    pub fn calls(&self, method: &'static str) -> u64 {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub fn endpoints_for_height(&self, height: u64) -> Vec<String> {
        self.block_endpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| *h == height)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn enter(&self, method: &'static str) -> Result<(), RpcError> {
        *self.calls.lock().unwrap().entry(method).or_insert(0) += 1;
        if let Some(kind) = self.fail.lock().unwrap().get(method) {
            return Err(RpcError::new(*kind, method, "injected failure"));
        }
        Ok(())
    }

    fn script(&self) -> String {
        if self.evm {
            "import EVM\n\ntransaction { execute {} }".to_string()
        } else {
            "transaction { execute {} }".to_string()
        }
    }

    fn transaction(&self, height: u64, index: usize) -> ApiTransaction {
        ApiTransaction {
            id: tx_id(height, index),
            script: self.script(),
            arguments: json!([]),
            proposal_key: ApiProposalKey {
                address: "0x1654653399040a61".to_string(),
                key_index: 0,
                sequence_number: height,
            },
            payer: "0xf919ee77447b7497".to_string(),
            authorizers: vec!["0xe467b9dd11fa00df".to_string()],
            payload_signatures: json!([]),
            envelope_signatures: json!([]),
            gas_limit: 1000,
        }
    }

    fn result(&self, height: u64, index: usize) -> ApiTransactionResult {
        let id = tx_id(height, index);
        let mut events = vec![ApiEvent {
            event_type: "A.1654653399040a61.FlowToken.TokensDeposited".to_string(),
            transaction_id: id.clone(),
            transaction_index: index as u32,
            event_index: 0,
            payload: deposit_payload("10.0", "0x97bcb43aa1d62ce4"),
        }];
        if self.evm {
            events.push(ApiEvent {
                event_type: "A.e467b9dd11fa00df.EVM.TransactionExecuted".to_string(),
                transaction_id: id.clone(),
                transaction_index: index as u32,
                event_index: 1,
                payload: json!({
                    "type": "Event",
                    "value": {
                        "id": "A.e467b9dd11fa00df.EVM.TransactionExecuted",
                        "fields": [
                            {"name": "hash", "value": {"type": "String",
                              "value": sanitize::sha256_hex(format!("evm-{}", id).as_bytes())}}
                        ]
                    }
                }),
            });
        }
        ApiTransactionResult {
            transaction_id: id,
            status: "SEALED".to_string(),
            error_message: None,
            computation_used: 7,
            events,
        }
    }

    fn results_for_block(&self, height: u64) -> Vec<ApiTransactionResult> {
        let txs = self.chain.lock().unwrap().txs_per_block;
        (0..txs).map(|i| self.result(height, i)).collect()
    }
}

#[async_trait]
impl AccessApi for MockAccess {
    async fn get_latest_block(&self, _endpoint: &str) -> Result<crate::types::ChainTip, RpcError> {
        self.enter("GetLatestBlock")?;
        let chain = self.chain.lock().unwrap();
        Ok(crate::types::ChainTip {
            height: chain.tip,
            id: chain.id(chain.tip),
        })
    }

    async fn get_block_by_height(&self, endpoint: &str, height: u64) -> Result<ApiBlock, RpcError> {
        self.enter("GetBlockByHeight")?;
        self.block_endpoints
            .lock()
            .unwrap()
            .push((height, endpoint.to_string()));
        let chain = self.chain.lock().unwrap();
        if height > chain.tip {
            return Err(RpcError::not_found("GetBlockByHeight", "past tip"));
        }
        Ok(ApiBlock {
            id: chain.id(height),
            parent_id: chain.parent_id(height),
            height,
            timestamp: ts(height),
            collection_guarantees: vec![ApiCollectionGuarantee {
                collection_id: format!("col{}", height),
            }],
            signatures: json!([]),
            seals: json!([]),
            execution_result_id: None,
            status: "SEALED".to_string(),
        })
    }

    async fn get_collection(
        &self,
        _endpoint: &str,
        collection_id: &str,
        _height: u64,
    ) -> Result<ApiCollection, RpcError> {
        self.enter("GetCollection")?;
        let height: u64 = collection_id
            .strip_prefix("col")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RpcError::not_found("GetCollection", "unknown collection"))?;
        let txs = self.chain.lock().unwrap().txs_per_block;
        Ok(ApiCollection {
            id: collection_id.to_string(),
            transaction_ids: (0..txs).map(|i| tx_id(height, i)).collect(),
        })
    }

    async fn get_transaction(
        &self,
        _endpoint: &str,
        tx: &str,
        height: u64,
    ) -> Result<ApiTransaction, RpcError> {
        self.enter("GetTransaction")?;
        let txs = self.chain.lock().unwrap().txs_per_block;
        (0..txs)
            .find(|i| tx_id(height, *i) == tx)
            .map(|i| self.transaction(height, i))
            .ok_or_else(|| RpcError::not_found("GetTransaction", "unknown tx"))
    }

    async fn get_transaction_result(
        &self,
        _endpoint: &str,
        tx: &str,
        height: u64,
    ) -> Result<ApiTransactionResult, RpcError> {
        self.enter("GetTransactionResult")?;
        let txs = self.chain.lock().unwrap().txs_per_block;
        (0..txs)
            .find(|i| tx_id(height, *i) == tx)
            .map(|i| self.result(height, i))
            .ok_or_else(|| RpcError::not_found("GetTransactionResult", "unknown tx"))
    }

    async fn get_transactions_by_block_id(
        &self,
        _endpoint: &str,
        block: &str,
        _height: u64,
    ) -> Result<Vec<ApiTransaction>, RpcError> {
        self.enter("GetTransactionsByBlockID")?;
        let chain = self.chain.lock().unwrap();
        let height = chain
            .height_of(block)
            .ok_or_else(|| RpcError::not_found("GetTransactionsByBlockID", "unknown block"))?;
        let txs = chain.txs_per_block;
        drop(chain);
        Ok((0..txs).map(|i| self.transaction(height, i)).collect())
    }

    async fn get_transaction_results_by_block_id(
        &self,
        _endpoint: &str,
        block: &str,
        _height: u64,
    ) -> Result<Vec<ApiTransactionResult>, RpcError> {
        self.enter("GetTransactionResultsByBlockID")?;
        let chain = self.chain.lock().unwrap();
        let height = chain
            .height_of(block)
            .ok_or_else(|| RpcError::not_found("GetTransactionResultsByBlockID", "unknown block"))?;
        drop(chain);
        Ok(self.results_for_block(height))
    }

    async fn get_transaction_results_by_block_id_raw(
        &self,
        _endpoint: &str,
        block: &str,
        _height: u64,
    ) -> Result<Vec<ApiTransactionResult>, RpcError> {
        self.enter("GetTransactionResultsByBlockIDRaw")?;
        let chain = self.chain.lock().unwrap();
        let height = chain.height_of(block).ok_or_else(|| {
            RpcError::not_found("GetTransactionResultsByBlockIDRaw", "unknown block")
        })?;
        drop(chain);
        Ok(self.results_for_block(height))
    }

    async fn get_transaction_result_raw(
        &self,
        _endpoint: &str,
        tx: &str,
        height: u64,
    ) -> Result<ApiTransactionResult, RpcError> {
        self.enter("GetTransactionResultRaw")?;
        let txs = self.chain.lock().unwrap().txs_per_block;
        (0..txs)
            .find(|i| tx_id(height, *i) == tx)
            .map(|i| self.result(height, i))
            .ok_or_else(|| RpcError::not_found("GetTransactionResultRaw", "unknown tx"))
    }

    async fn get_events_for_block(
        &self,
        _endpoint: &str,
        block: &str,
        _height: u64,
        types: &[String],
    ) -> Result<Vec<ApiEvent>, RpcError> {
        self.enter("GetEventsForBlock")?;
        let chain = self.chain.lock().unwrap();
        let height = chain
            .height_of(block)
            .ok_or_else(|| RpcError::not_found("GetEventsForBlock", "unknown block"))?;
        drop(chain);
        Ok(self
            .results_for_block(height)
            .into_iter()
            .flat_map(|r| r.events)
            .filter(|e| types.contains(&e.event_type))
            .collect())
    }
}

// ----------------------------------------------------------------------
// Wiring helpers
// ----------------------------------------------------------------------

pub fn single_spork(endpoint: &str) -> Vec<SporkEntry> {
    vec![SporkEntry {
        spork_id: "test".to_string(),
        root_height: 0,
        endpoints: vec![endpoint.to_string()],
        rpc_timeout_secs: None,
    }]
}

/// RpcClient over a mock access node, with generous rate limits so tests
/// never stall on the bucket.
pub fn test_client(
    api: Arc<MockAccess>,
    sporks: Vec<SporkEntry>,
    crescendo_height: u64,
) -> Arc<RpcClient> {
    let endpoints: Vec<String> = sporks
        .iter()
        .flat_map(|s| s.endpoints.iter().cloned())
        .collect();
    let pool = Arc::new(NodePool::new(endpoints.clone(), 10_000, 10_000, -1, 0));
    let router = Arc::new(
        SporkRouter::new(sporks, crescendo_height, Duration::from_secs(5)).unwrap(),
    );
    Arc::new(RpcClient::new(api, pool, router, endpoints))
}

pub fn test_settings() -> Settings {
    Settings {
        db_url: "postgres://unused".to_string(),
        flow_access_node: "http://node-a:9000".to_string(),
        flow_access_nodes: None,
        flow_historic_access_nodes: None,
        sporks: Vec::new(),
        enable_forward_ingester: true,
        enable_history_ingester: true,
        forward_service_name: "forward_ingester".to_string(),
        history_service_name: "history_ingester".to_string(),
        start_block: 0,
        history_stop_height: 0,
        latest_worker_count: 3,
        latest_batch_size: 5,
        history_worker_count: 3,
        history_batch_size: 5,
        max_reorg_depth: 1000,
        flow_rpc_rps: -1,
        flow_rpc_burst: 0,
        flow_rpc_rps_per_node: 10_000,
        flow_rpc_burst_per_node: 10_000,
        flow_rpc_timeout_secs: 5,
        enable_token_transfers_worker: true,
        enable_evm_worker: true,
        token_transfers_worker_range: 50_000,
        evm_worker_range: 50_000,
        tx_script_inline_max_bytes: 4096,
        payload_inline_max_bytes: 8192,
        crescendo_height: 0,
        db_max_open_conns: 5,
        db_max_idle_conns: 1,
        db_synchronous_commit: None,
        skip_migration: true,
        enable_lookup_repair: true,
        lookup_repair_interval_min: 30,
        lookup_repair_limit: 1000,
        metrics_addr: String::new(),
    }
}
