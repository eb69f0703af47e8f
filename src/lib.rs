pub mod addresses;
pub mod batch_writer;
pub mod config;
pub mod db;
pub mod derivations;
pub mod error;
pub mod fetcher;
pub mod ingester;
pub mod metrics;
pub mod node_pool;
pub mod partitions;
pub mod reaper;
pub mod reconciler;
pub mod reorg;
pub mod rpc;
pub mod sanitize;
pub mod scheduler;
pub mod sink;
pub mod sporks;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod testutil;
