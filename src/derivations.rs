/// Derivation kinds
///
/// Each kind turns raw rows into one derived app table over an aligned
/// height range. Processing must be idempotent: the composite keys already
/// encode the range position, so redoing a range after a crash or a failed
/// lease writes the same rows.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::Store;

/// Prefix shared with db.rs so rollback can find derivation watermarks.
pub fn checkpoint_name(kind: &str) -> String {
    format!("{}{}", crate::db::DERIVATION_CHECKPOINT_PREFIX, kind)
}

#[async_trait]
pub trait DerivationKind: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process [from, to) against the raw tables. Returns rows written.
    async fn process_range(&self, store: &dyn Store, from: u64, to: u64)
        -> Result<u64, StoreError>;
}

/// Fungible-token movements out of raw.events into app.token_transfers.
pub struct TokenTransfersKind;

#[async_trait]
impl DerivationKind for TokenTransfersKind {
    fn name(&self) -> &'static str {
        "token_transfers"
    }

    async fn process_range(
        &self,
        store: &dyn Store,
        from: u64,
        to: u64,
    ) -> Result<u64, StoreError> {
        store.derive_token_transfers(from, to).await
    }
}

/// EVM transaction hashes out of raw.events into app.evm_transactions.
pub struct EvmKind;

#[async_trait]
impl DerivationKind for EvmKind {
    fn name(&self) -> &'static str {
        "evm"
    }

    async fn process_range(
        &self,
        store: &dyn Store,
        from: u64,
        to: u64,
    ) -> Result<u64, StoreError> {
        store.derive_evm_transactions(from, to).await
    }
}
