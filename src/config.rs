/// Configuration
///
/// All recognized options, loaded once at startup from an optional
/// config.toml plus the environment, deserialized into a typed Settings
/// struct. Services receive the struct (or a clone) at construction; there
/// is no global config cell.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::IndexError;

/// One spork routing entry. Entries are ordered by root_height; a height
/// routes to the entry with the largest root_height at or below it.
#[derive(Debug, Clone, Deserialize)]
pub struct SporkEntry {
    pub spork_id: String,
    pub root_height: u64,
    pub endpoints: Vec<String>,
    /// Per-spork RPC timeout override, for known-slow historic sporks.
    #[serde(default)]
    pub rpc_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Required
    pub db_url: String,
    pub flow_access_node: String,

    // Node pools (csv)
    #[serde(default)]
    pub flow_access_nodes: Option<String>,
    #[serde(default)]
    pub flow_historic_access_nodes: Option<String>,

    // Spork table; when empty a single spork rooted at 0 is synthesized
    // from the live pool.
    #[serde(default)]
    pub sporks: Vec<SporkEntry>,

    // Ingester toggles
    #[serde(default = "default_true")]
    pub enable_forward_ingester: bool,
    #[serde(default = "default_true")]
    pub enable_history_ingester: bool,
    #[serde(default = "default_forward_service_name")]
    pub forward_service_name: String,
    #[serde(default = "default_history_service_name")]
    pub history_service_name: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub history_stop_height: u64,

    // Worker counts / batch sizes
    #[serde(default = "default_latest_worker_count")]
    pub latest_worker_count: usize,
    #[serde(default = "default_latest_batch_size")]
    pub latest_batch_size: u64,
    #[serde(default = "default_history_worker_count")]
    pub history_worker_count: usize,
    #[serde(default = "default_history_batch_size")]
    pub history_batch_size: u64,
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u64,

    // Rate limits. flow_rpc_rps = -1 disables the global ceiling.
    #[serde(default = "default_flow_rpc_rps")]
    pub flow_rpc_rps: i64,
    #[serde(default = "default_flow_rpc_burst")]
    pub flow_rpc_burst: u32,
    #[serde(default = "default_flow_rpc_rps_per_node")]
    pub flow_rpc_rps_per_node: u32,
    #[serde(default = "default_flow_rpc_burst_per_node")]
    pub flow_rpc_burst_per_node: u32,
    #[serde(default = "default_rpc_timeout_secs")]
    pub flow_rpc_timeout_secs: u64,

    // Derivation workers
    #[serde(default = "default_true")]
    pub enable_token_transfers_worker: bool,
    #[serde(default = "default_true")]
    pub enable_evm_worker: bool,
    #[serde(default = "default_worker_range")]
    pub token_transfers_worker_range: u64,
    #[serde(default = "default_worker_range")]
    pub evm_worker_range: u64,

    // Storage thresholds
    #[serde(default = "default_tx_script_inline_max_bytes")]
    pub tx_script_inline_max_bytes: usize,
    #[serde(default = "default_payload_inline_max_bytes")]
    pub payload_inline_max_bytes: usize,
    #[serde(default)]
    pub crescendo_height: u64,

    // Database pool
    #[serde(default = "default_db_max_open_conns")]
    pub db_max_open_conns: u32,
    #[serde(default = "default_db_max_idle_conns")]
    pub db_max_idle_conns: u32,
    #[serde(default)]
    pub db_synchronous_commit: Option<String>,

    // Maintenance
    #[serde(default)]
    pub skip_migration: bool,
    #[serde(default = "default_true")]
    pub enable_lookup_repair: bool,
    #[serde(default = "default_lookup_repair_interval_min")]
    pub lookup_repair_interval_min: u64,
    #[serde(default = "default_lookup_repair_limit")]
    pub lookup_repair_limit: u64,

    // Metrics / health listener ("" disables)
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_true() -> bool {
    true
}
fn default_forward_service_name() -> String {
    "forward_ingester".to_string()
}
fn default_history_service_name() -> String {
    "history_ingester".to_string()
}
fn default_latest_worker_count() -> usize {
    2
}
fn default_latest_batch_size() -> u64 {
    1
}
fn default_history_worker_count() -> usize {
    5
}
fn default_history_batch_size() -> u64 {
    20
}
fn default_max_reorg_depth() -> u64 {
    1000
}
fn default_flow_rpc_rps() -> i64 {
    5
}
fn default_flow_rpc_burst() -> u32 {
    10
}
fn default_flow_rpc_rps_per_node() -> u32 {
    5
}
fn default_flow_rpc_burst_per_node() -> u32 {
    10
}
fn default_rpc_timeout_secs() -> u64 {
    30
}
fn default_worker_range() -> u64 {
    50_000
}
fn default_tx_script_inline_max_bytes() -> usize {
    4096
}
fn default_payload_inline_max_bytes() -> usize {
    8192
}
fn default_db_max_open_conns() -> u32 {
    10
}
fn default_db_max_idle_conns() -> u32 {
    2
}
fn default_lookup_repair_interval_min() -> u64 {
    30
}
fn default_lookup_repair_limit() -> u64 {
    1000
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

impl Settings {
    /// Load from an optional toml file plus the environment. Environment
    /// variables win; FLOW_RPC_RPS becomes flow_rpc_rps and so on.
    pub fn load(config_file: Option<&str>) -> Result<Self, IndexError> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let cfg = builder
            .add_source(Environment::default())
            .build()
            .map_err(|e| IndexError::Config(e.to_string()))?;

        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| IndexError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), IndexError> {
        if self.db_url.is_empty() {
            return Err(IndexError::Config("DB_URL is required".into()));
        }
        if self.flow_access_node.is_empty() {
            return Err(IndexError::Config("FLOW_ACCESS_NODE is required".into()));
        }
        // Two running ingesters sharing a checkpoint key is a fatal
        // misconfiguration; refuse to start.
        if self.enable_forward_ingester
            && self.enable_history_ingester
            && self.forward_service_name == self.history_service_name
        {
            return Err(IndexError::Config(format!(
                "FORWARD_SERVICE_NAME and HISTORY_SERVICE_NAME must differ (both {})",
                self.forward_service_name
            )));
        }
        if self.latest_worker_count == 0 || self.history_worker_count == 0 {
            return Err(IndexError::Config("worker counts must be > 0".into()));
        }
        if self.latest_batch_size == 0 || self.history_batch_size == 0 {
            return Err(IndexError::Config("batch sizes must be > 0".into()));
        }
        Ok(())
    }

    /// Live pool endpoints: FLOW_ACCESS_NODES if set, else the single
    /// FLOW_ACCESS_NODE.
    pub fn live_endpoints(&self) -> Vec<String> {
        match &self.flow_access_nodes {
            Some(csv) if !csv.is_empty() => split_csv(csv),
            _ => vec![self.flow_access_node.clone()],
        }
    }

    /// Historic pool endpoints; falls back to the live pool when unset.
    pub fn historic_endpoints(&self) -> Vec<String> {
        match &self.flow_historic_access_nodes {
            Some(csv) if !csv.is_empty() => split_csv(csv),
            _ => self.live_endpoints(),
        }
    }

    /// The effective spork table. Without an explicit table: a single
    /// spork over the live pool, or, when a distinct historic pool and a
    /// start block are configured, the historic pool below START_BLOCK and
    /// the live pool from it.
    pub fn spork_table(&self) -> Vec<SporkEntry> {
        if !self.sporks.is_empty() {
            return self.sporks.clone();
        }
        let live = self.live_endpoints();
        let historic = self.historic_endpoints();
        if historic != live && self.start_block > 0 {
            return vec![
                SporkEntry {
                    spork_id: "historic".to_string(),
                    root_height: 0,
                    endpoints: historic,
                    rpc_timeout_secs: None,
                },
                SporkEntry {
                    spork_id: "current".to_string(),
                    root_height: self.start_block,
                    endpoints: live,
                    rpc_timeout_secs: None,
                },
            ];
        }
        vec![SporkEntry {
            spork_id: "mainnet".to_string(),
            root_height: 0,
            endpoints: live,
            rpc_timeout_secs: None,
        }]
    }
}

fn split_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
