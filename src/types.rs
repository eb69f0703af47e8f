use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A block as persisted into raw.blocks. Hashes are lowercase hex without
/// prefix; heights are non-negative and unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockRecord {
    pub height: u64,
    pub id: String,
    pub parent_id: String,
    pub timestamp: DateTime<Utc>,
    pub signatures: Value,
    pub seals: Value,
    pub collection_guarantees: Value,
    pub execution_result_id: Option<String>,
    pub status: String,
}

/// A transaction as persisted into raw.transactions.
///
/// script_hash always references a row in raw.scripts; script_inline is only
/// populated when the script fits under the configured inline threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxRecord {
    pub id: String,
    pub block_height: u64,
    pub tx_index: u32,
    pub script_hash: String,
    pub script_inline: Option<String>,
    pub arguments: Value,
    pub proposer: String,
    pub proposer_key_index: u64,
    pub proposer_sequence: u64,
    pub payer: String,
    pub authorizers: Vec<String>,
    pub payload_signatures: Value,
    pub envelope_signatures: Value,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub status: String,
    pub error_message: Option<String>,
    pub is_evm: bool,
    pub events_count: u32,
}

/// An event row. payload is None exactly when the serialized payload
/// exceeded the inline threshold; payload_ref then points at the blob row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub block_height: u64,
    pub transaction_id: String,
    pub event_index: u32,
    pub transaction_index: u32,
    pub event_type: String,
    pub payload: Option<Value>,
    pub payload_hash: String,
    pub payload_ref: Option<String>,
}

/// Deduplicated script text, keyed by sha256 of the bytes. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptBlob {
    pub script_hash: String,
    pub script_text: String,
    pub length: u64,
    pub first_seen_height: u64,
}

/// Role an address played in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressRole {
    Proposer,
    Payer,
    Authorizer,
    /// Discovered inside an event payload rather than the envelope.
    Participant,
}

impl AddressRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressRole::Proposer => "PROPOSER",
            AddressRole::Payer => "PAYER",
            AddressRole::Authorizer => "AUTHORIZER",
            AddressRole::Participant => "PARTICIPANT",
        }
    }
}

/// One (address, role) appearance in a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressActivity {
    pub address: String,
    pub block_height: u64,
    pub transaction_id: String,
    pub role: AddressRole,
}

/// Account key change extracted from the core key events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AccountKeyChange {
    Added {
        address: String,
        key_index: u64,
        public_key: String,
        block_height: u64,
    },
    Revoked {
        address: String,
        key_index: u64,
        block_height: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Deposit,
    Withdraw,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Deposit => "DEPOSIT",
            TransferDirection::Withdraw => "WITHDRAW",
        }
    }
}

/// A fungible-token movement spotted while fetching. Feeds the commit
/// notification; the durable app.token_transfers rows are re-derived from
/// raw events by the derivation worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenTransferCandidate {
    pub block_height: u64,
    pub transaction_id: String,
    pub event_index: u32,
    pub token_contract: String,
    pub amount: String,
    pub counterparty: Option<String>,
    pub direction: TransferDirection,
}

/// Everything a fetch worker assembles for one height. Side-effect free:
/// nothing here has touched the database yet.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub block: BlockRecord,
    pub transactions: Vec<TxRecord>,
    pub events: Vec<EventRecord>,
    pub scripts: Vec<ScriptBlob>,
    pub address_activity: Vec<AddressActivity>,
    pub token_transfers: Vec<TokenTransferCandidate>,
    pub key_changes: Vec<AccountKeyChange>,
}

impl FetchResult {
    pub fn height(&self) -> u64 {
        self.block.height
    }

    /// EVM transaction hashes keyed by owning transaction id, for tx_lookup.
    pub fn evm_hashes(&self) -> Vec<(String, String)> {
        self.transactions
            .iter()
            .filter_map(|tx| {
                tx.is_evm
                    .then(|| self.evm_hash_for(&tx.id).map(|h| (tx.id.clone(), h)))
                    .flatten()
            })
            .collect()
    }

    fn evm_hash_for(&self, tx_id: &str) -> Option<String> {
        self.events
            .iter()
            .filter(|e| e.transaction_id == tx_id)
            .filter(|e| e.event_type.ends_with(".EVM.TransactionExecuted"))
            .find_map(|e| {
                e.payload
                    .as_ref()
                    .and_then(|p| crate::addresses::cadence_field(p, "hash"))
                    .and_then(|v| v.as_str().map(|s| crate::sanitize::normalize_address(s)))
            })
    }
}

/// Current head of the chain as reported by a live node.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTip {
    pub height: u64,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    Active,
    Completed,
    Failed,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Active => "ACTIVE",
            LeaseStatus::Completed => "COMPLETED",
            LeaseStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(LeaseStatus::Active),
            "COMPLETED" => Some(LeaseStatus::Completed),
            "FAILED" => Some(LeaseStatus::Failed),
            _ => None,
        }
    }
}

/// A derivation worker's claim on an aligned height range.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub worker_type: String,
    pub from_height: u64,
    pub to_height: u64,
    pub status: LeaseStatus,
    pub attempt: u32,
    pub leased_by: String,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub worker_name: String,
    pub last_height: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

/// A recorded indexing failure, deduplicated on
/// (worker_name, block_height, transaction_id, error_hash).
#[derive(Debug, Clone, PartialEq)]
pub struct IndexingErrorRecord {
    pub worker_name: String,
    pub block_height: u64,
    pub transaction_id: Option<String>,
    pub error_hash: String,
    pub raw_data: String,
    pub severity: Severity,
}

impl IndexingErrorRecord {
    /// Truncates raw_data and derives error_hash from it.
    pub fn new(
        worker_name: impl Into<String>,
        block_height: u64,
        transaction_id: Option<String>,
        raw_data: &str,
        severity: Severity,
    ) -> Self {
        const RAW_DATA_MAX: usize = 2048;
        let truncated: String = raw_data.chars().take(RAW_DATA_MAX).collect();
        Self {
            worker_name: worker_name.into(),
            block_height,
            transaction_id,
            error_hash: crate::sanitize::sha256_hex(truncated.as_bytes()),
            raw_data: truncated,
            severity,
        }
    }
}

/// Per-block summary handed to the commit sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockSummary {
    pub height: u64,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub tx_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxSummary {
    pub id: String,
    pub block_height: u64,
    pub is_evm: bool,
}

/// What the forward ingester broadcasts after each committed window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommittedWindow {
    pub from_height: u64,
    pub to_height: u64,
    pub blocks: Vec<BlockSummary>,
    pub transactions: Vec<TxSummary>,
    pub token_transfers: Vec<TokenTransferCandidate>,
}

impl CommittedWindow {
    pub fn from_results(results: &[FetchResult]) -> Self {
        let from_height = results.first().map(|r| r.height()).unwrap_or(0);
        let to_height = results.last().map(|r| r.height()).unwrap_or(0);
        Self {
            from_height,
            to_height,
            blocks: results
                .iter()
                .map(|r| BlockSummary {
                    height: r.block.height,
                    id: r.block.id.clone(),
                    timestamp: r.block.timestamp,
                    tx_count: r.transactions.len(),
                })
                .collect(),
            transactions: results
                .iter()
                .flat_map(|r| r.transactions.iter())
                .map(|tx| TxSummary {
                    id: tx.id.clone(),
                    block_height: tx.block_height,
                    is_evm: tx.is_evm,
                })
                .collect(),
            token_transfers: results
                .iter()
                .flat_map(|r| r.token_transfers.iter().cloned())
                .collect(),
        }
    }
}
