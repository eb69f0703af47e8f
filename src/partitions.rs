/// Partition manager
///
/// raw and app tables are range-partitioned by block height. Before a
/// window commits, the partitions it will touch must exist; this module
/// creates them declaratively (current + lookahead) with
/// CREATE TABLE IF NOT EXISTS, which is idempotent and safe to race from
/// both ingesters.

use tracing::debug;

use crate::db::PgStore;
use crate::error::StoreError;

/// Partitions created beyond the window's upper bound.
const LOOKAHEAD: u64 = 2;

/// (schema, table, partition column span)
const PARTITIONED_TABLES: &[(&str, &str, u64)] = &[
    ("raw", "blocks", 5_000_000),
    ("raw", "transactions", 5_000_000),
    ("raw", "events", 10_000_000),
    ("app", "token_transfers", 10_000_000),
    ("app", "evm_transactions", 10_000_000),
];

/// Start of the partition containing `height`.
pub fn partition_start(height: u64, size: u64) -> u64 {
    height - (height % size)
}

/// Partition starts needed to cover [lo, hi] plus lookahead.
pub fn partition_starts(lo: u64, hi: u64, size: u64) -> Vec<u64> {
    let first = partition_start(lo, size);
    let last = partition_start(hi, size) + LOOKAHEAD * size;
    (first..=last).step_by(size as usize).collect()
}

pub fn partition_name(table: &str, start: u64) -> String {
    format!("{}_p{}", table, start)
}

impl PgStore {
    pub(crate) async fn ensure_partitions_pg(&self, lo: u64, hi: u64) -> Result<(), StoreError> {
        for (schema, table, size) in PARTITIONED_TABLES {
            for start in partition_starts(lo, hi, *size) {
                let end = start + size;
                let name = partition_name(table, start);
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS {schema}.{name} PARTITION OF {schema}.{table} \
                     FOR VALUES FROM ({start}) TO ({end})"
                );
                match sqlx::query(&ddl).execute(&self.pool).await {
                    Ok(_) => {}
                    // IF NOT EXISTS still loses the occasional race between
                    // two concurrent creators; the partition exists either
                    // way.
                    Err(err) if err.to_string().contains("already exists") => {
                        debug!(partition = %name, "partition creation raced, continuing");
                    }
                    Err(err) => return Err(StoreError::from(err)),
                }
            }
        }
        Ok(())
    }
}
