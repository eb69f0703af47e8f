/// Access node RPC client
///
/// Height-aware wrapper over the upstream access API. The wire transport
/// lives behind the AccessApi trait; the client layers on top of it:
/// - per-call timeout and retry with backoff for transient failures
/// - the fallback ladder for transaction results (modern batched ->
///   modern per-item -> raw batched -> raw per-item)
/// - sanitization of everything bound for a text column
///
/// All sub-calls for a single block are issued against one endpoint handle
/// picked by the caller; consistency across a block depends on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IndexError, RpcError, RpcErrorKind};
use crate::metrics;
use crate::node_pool::NodePool;
use crate::sanitize;
use crate::sporks::SporkRouter;
use crate::types::ChainTip;

/// Retries on the same endpoint before the caller escalates to another one.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RATE_LIMIT_DELAY: Duration = Duration::from_millis(500);

/// How a transaction-results fetch was ultimately satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    ModernBatched,
    ModernPerItem,
    RawBatched,
    RawPerItem,
}

impl FetchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::ModernBatched => "modern_batched",
            FetchStrategy::ModernPerItem => "modern_per_item",
            FetchStrategy::RawBatched => "raw_batched",
            FetchStrategy::RawPerItem => "raw_per_item",
        }
    }
}

// ----------------------------------------------------------------------
// Wire shapes
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ApiCollectionGuarantee {
    pub collection_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiBlock {
    pub id: String,
    pub parent_id: String,
    pub height: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub collection_guarantees: Vec<ApiCollectionGuarantee>,
    #[serde(default)]
    pub signatures: Value,
    #[serde(default)]
    pub seals: Value,
    #[serde(default)]
    pub execution_result_id: Option<String>,
    #[serde(default = "default_block_status")]
    pub status: String,
}

fn default_block_status() -> String {
    "SEALED".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiCollection {
    pub id: String,
    #[serde(default)]
    pub transaction_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiProposalKey {
    pub address: String,
    #[serde(default)]
    pub key_index: u64,
    #[serde(default)]
    pub sequence_number: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTransaction {
    pub id: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub arguments: Value,
    pub proposal_key: ApiProposalKey,
    pub payer: String,
    #[serde(default)]
    pub authorizers: Vec<String>,
    #[serde(default)]
    pub payload_signatures: Value,
    #[serde(default)]
    pub envelope_signatures: Value,
    #[serde(default)]
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub transaction_id: String,
    #[serde(default)]
    pub transaction_index: u32,
    pub event_index: u32,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTransactionResult {
    pub transaction_id: String,
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub computation_used: u64,
    #[serde(default)]
    pub events: Vec<ApiEvent>,
}

// ----------------------------------------------------------------------
// Transport trait
// ----------------------------------------------------------------------

/// The raw access-node surface. One method per upstream call; the `raw`
/// variants bypass the modern codec for pre-crescendo sporks. Errors come
/// back already classified.
#[async_trait]
pub trait AccessApi: Send + Sync {
    async fn get_latest_block(&self, endpoint: &str) -> Result<ChainTip, RpcError>;

    async fn get_block_by_height(&self, endpoint: &str, height: u64) -> Result<ApiBlock, RpcError>;

    async fn get_collection(
        &self,
        endpoint: &str,
        collection_id: &str,
        height: u64,
    ) -> Result<ApiCollection, RpcError>;

    async fn get_transaction(
        &self,
        endpoint: &str,
        tx_id: &str,
        height: u64,
    ) -> Result<ApiTransaction, RpcError>;

    async fn get_transaction_result(
        &self,
        endpoint: &str,
        tx_id: &str,
        height: u64,
    ) -> Result<ApiTransactionResult, RpcError>;

    /// May return Unimplemented on older sporks.
    async fn get_transactions_by_block_id(
        &self,
        endpoint: &str,
        block_id: &str,
        height: u64,
    ) -> Result<Vec<ApiTransaction>, RpcError>;

    /// May return Unimplemented or CodecDecode on older sporks.
    async fn get_transaction_results_by_block_id(
        &self,
        endpoint: &str,
        block_id: &str,
        height: u64,
    ) -> Result<Vec<ApiTransactionResult>, RpcError>;

    /// Raw-bytes variant for heights below the crescendo height.
    async fn get_transaction_results_by_block_id_raw(
        &self,
        endpoint: &str,
        block_id: &str,
        height: u64,
    ) -> Result<Vec<ApiTransactionResult>, RpcError>;

    /// Raw-bytes per-transaction fallback.
    async fn get_transaction_result_raw(
        &self,
        endpoint: &str,
        tx_id: &str,
        height: u64,
    ) -> Result<ApiTransactionResult, RpcError>;

    async fn get_events_for_block(
        &self,
        endpoint: &str,
        block_id: &str,
        height: u64,
        types: &[String],
    ) -> Result<Vec<ApiEvent>, RpcError>;
}

// ----------------------------------------------------------------------
// Retrying, routing client
// ----------------------------------------------------------------------

/// The client the fetch workers use. Owns the transport, the spork router
/// and the node pool; callers pin an endpoint per block and thread it
/// through every sub-call for that block.
pub struct RpcClient {
    api: Arc<dyn AccessApi>,
    pub pool: Arc<NodePool>,
    pub router: Arc<SporkRouter>,
    live_endpoints: Vec<String>,
}

impl RpcClient {
    pub fn new(
        api: Arc<dyn AccessApi>,
        pool: Arc<NodePool>,
        router: Arc<SporkRouter>,
        live_endpoints: Vec<String>,
    ) -> Self {
        Self {
            api,
            pool,
            router,
            live_endpoints,
        }
    }

    /// Eligible endpoints for a height, from the routing entry.
    pub fn endpoints_for(&self, height: u64) -> Result<Vec<String>, IndexError> {
        Ok(self.router.route_for(height)?.endpoints.clone())
    }

    /// Pick an endpoint eligible for `height` and consume a rate token.
    pub async fn pin_endpoint(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<String, IndexError> {
        let eligible = self.endpoints_for(height)?;
        self.pool.pick(&eligible, cancel).await
    }

    /// Query the live pool for the current tip.
    pub async fn latest_tip(&self, cancel: &CancellationToken) -> Result<ChainTip, IndexError> {
        let endpoint = self.pool.pick(&self.live_endpoints, cancel).await?;
        let tip = self
            .call(cancel, u64::MAX, "GetLatestBlock", || {
                self.api.get_latest_block(&endpoint)
            })
            .await;
        self.pool
            .release(&endpoint, crate::node_pool::outcome_of(&tip))
            .await;
        let tip = tip?;
        metrics::CHAIN_TIP_HEIGHT.set(tip.height as i64);
        Ok(tip)
    }

    pub async fn block_by_height(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        height: u64,
    ) -> Result<ApiBlock, RpcError> {
        self.call(cancel, height, "GetBlockByHeight", || {
            self.api.get_block_by_height(endpoint, height)
        })
        .await
    }

    pub async fn collection(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        collection_id: &str,
        height: u64,
    ) -> Result<ApiCollection, RpcError> {
        self.call(cancel, height, "GetCollection", || {
            self.api.get_collection(endpoint, collection_id, height)
        })
        .await
    }

    /// Transactions for a block: batched when available, per-id otherwise.
    pub async fn transactions_for_block(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        block_id: &str,
        tx_ids: &[String],
        height: u64,
    ) -> Result<Vec<ApiTransaction>, RpcError> {
        let batched = self
            .call(cancel, height, "GetTransactionsByBlockID", || {
                self.api.get_transactions_by_block_id(endpoint, block_id, height)
            })
            .await;
        match batched {
            Ok(txs) => Ok(sanitize_transactions(txs)),
            Err(err) if err.kind.wants_fallback() => {
                debug!(height, block = %crate::telemetry::truncate_hex(block_id, 16), "batched transactions unavailable, fetching per id");
                metrics::FETCH_FALLBACKS.with_label_values(&["tx_per_item"]).inc();
                let mut txs = Vec::with_capacity(tx_ids.len());
                for tx_id in tx_ids {
                    let tx = self
                        .call(cancel, height, "GetTransaction", || {
                            self.api.get_transaction(endpoint, tx_id, height)
                        })
                        .await?;
                    txs.push(tx);
                }
                Ok(sanitize_transactions(txs))
            }
            Err(err) => Err(err),
        }
    }

    /// Transaction results with the full fallback ladder: modern batched
    /// first at modern heights, falling back per item on
    /// Unimplemented/CodecDecode; raw path below the crescendo height.
    pub async fn transaction_results_for_block(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        block_id: &str,
        tx_ids: &[String],
        height: u64,
    ) -> Result<(Vec<ApiTransactionResult>, FetchStrategy), RpcError> {
        if self.router.uses_raw_decode(height) {
            return self
                .raw_results(cancel, endpoint, block_id, tx_ids, height)
                .await;
        }

        let batched = self
            .call(cancel, height, "GetTransactionResultsByBlockID", || {
                self.api
                    .get_transaction_results_by_block_id(endpoint, block_id, height)
            })
            .await;
        match batched {
            Ok(results) => Ok((sanitize_results(results), FetchStrategy::ModernBatched)),
            Err(err) if err.kind.wants_fallback() => {
                warn!(height, kind = %err.kind, "batched transaction results unavailable, falling back per transaction");
                metrics::FETCH_FALLBACKS.with_label_values(&["modern_per_item"]).inc();
                let mut results = Vec::with_capacity(tx_ids.len());
                for tx_id in tx_ids {
                    let result = self
                        .call(cancel, height, "GetTransactionResult", || {
                            self.api.get_transaction_result(endpoint, tx_id, height)
                        })
                        .await?;
                    results.push(result);
                }
                Ok((sanitize_results(results), FetchStrategy::ModernPerItem))
            }
            Err(err) => Err(err),
        }
    }

    async fn raw_results(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        block_id: &str,
        tx_ids: &[String],
        height: u64,
    ) -> Result<(Vec<ApiTransactionResult>, FetchStrategy), RpcError> {
        let batched = self
            .call(cancel, height, "GetTransactionResultsByBlockIDRaw", || {
                self.api
                    .get_transaction_results_by_block_id_raw(endpoint, block_id, height)
            })
            .await;
        match batched {
            Ok(results) => {
                metrics::FETCH_FALLBACKS.with_label_values(&["raw_batched"]).inc();
                Ok((sanitize_results(results), FetchStrategy::RawBatched))
            }
            Err(err) if err.kind == RpcErrorKind::Unimplemented => {
                metrics::FETCH_FALLBACKS.with_label_values(&["raw_per_item"]).inc();
                let mut results = Vec::with_capacity(tx_ids.len());
                for tx_id in tx_ids {
                    let result = self
                        .call(cancel, height, "GetTransactionResultRaw", || {
                            self.api.get_transaction_result_raw(endpoint, tx_id, height)
                        })
                        .await?;
                    results.push(result);
                }
                Ok((sanitize_results(results), FetchStrategy::RawPerItem))
            }
            Err(err) => Err(err),
        }
    }

    /// Events by enumerated type list. An empty list is rejected before it
    /// reaches the wire.
    pub async fn events_for_block(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        block_id: &str,
        height: u64,
        types: &[String],
    ) -> Result<Vec<ApiEvent>, RpcError> {
        if types.is_empty() {
            return Err(RpcError::new(
                RpcErrorKind::InvalidArgument,
                "GetEventsForBlock",
                "empty event type list",
            ));
        }
        let events = self
            .call(cancel, height, "GetEventsForBlock", || {
                self.api.get_events_for_block(endpoint, block_id, height, types)
            })
            .await?;
        Ok(events.into_iter().map(sanitize_event).collect())
    }

    /// Run one wire call with the routing entry's timeout and a bounded
    /// retry loop for Transient/RateLimited/NotFound. Kinds that want a
    /// fallback tier or are permanent surface immediately.
    async fn call<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        height: u64,
        method: &'static str,
        mut op: F,
    ) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let call_timeout = if height == u64::MAX {
            Duration::from_secs(30)
        } else {
            self.router.timeout_for(height)
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = std::time::Instant::now();

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RpcError::new(RpcErrorKind::Transient, method, "cancelled"));
                }
                res = tokio::time::timeout(call_timeout, op()) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(RpcError::transient(method, format!("timed out after {:?}", call_timeout))),
                },
            };

            let elapsed = started.elapsed().as_secs_f64();
            match outcome {
                Ok(value) => {
                    metrics::RPC_CALL_DURATION
                        .with_label_values(&[method, "ok"])
                        .observe(elapsed);
                    return Ok(value);
                }
                Err(err) => {
                    metrics::RPC_CALL_DURATION
                        .with_label_values(&[method, "error"])
                        .observe(elapsed);
                    if !err.kind.is_retryable() || attempt >= RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    let delay = match err.kind {
                        RpcErrorKind::RateLimited => RATE_LIMIT_DELAY * attempt,
                        _ => RETRY_BASE_DELAY * (1 << (attempt - 1).min(4)),
                    };
                    debug!(method, height, attempt, kind = %err.kind, "retrying RPC call");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Sanitization at the client boundary
// ----------------------------------------------------------------------

fn sanitize_transactions(txs: Vec<ApiTransaction>) -> Vec<ApiTransaction> {
    txs.into_iter()
        .map(|mut tx| {
            tx.script = sanitize::strip_nul(&tx.script);
            sanitize::strip_nul_json(&mut tx.arguments);
            tx
        })
        .collect()
}

fn sanitize_results(results: Vec<ApiTransactionResult>) -> Vec<ApiTransactionResult> {
    results
        .into_iter()
        .map(|mut r| {
            r.error_message = r.error_message.map(|m| sanitize::strip_nul(&m));
            r.events = r.events.into_iter().map(sanitize_event).collect();
            r
        })
        .collect()
}

fn sanitize_event(mut event: ApiEvent) -> ApiEvent {
    sanitize::strip_nul_json(&mut event.payload);
    event
}

// ----------------------------------------------------------------------
// HTTP transport
// ----------------------------------------------------------------------

/// JSON-over-HTTP transport against the access node gateway. The raw
/// variants request base64 payload encoding and decode locally, which is
/// what makes pre-crescendo sporks readable at all.
pub struct HttpAccessClient {
    http: reqwest::Client,
}

impl HttpAccessClient {
    pub fn new(timeout: Duration) -> Result<Self, IndexError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexError::Config(format!("http client: {}", e)))?;
        Ok(Self { http })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        method: &'static str,
        url: String,
    ) -> Result<T, RpcError> {
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest(method, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(method, status.as_u16(), &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest(method, e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            RpcError::new(
                RpcErrorKind::CodecDecode,
                method,
                format!("decoding response: {}", e),
            )
        })
    }
}

/// Map an HTTP status to an error kind.
pub fn classify_status(method: &'static str, status: u16, body: &str) -> RpcError {
    let kind = match status {
        404 => RpcErrorKind::NotFound,
        429 => RpcErrorKind::RateLimited,
        501 => RpcErrorKind::Unimplemented,
        400 => RpcErrorKind::InvalidArgument,
        500..=599 => RpcErrorKind::Transient,
        _ => RpcErrorKind::Permanent,
    };
    RpcError::new(kind, method, format!("status {}: {}", status, body))
}

fn classify_reqwest(method: &'static str, err: reqwest::Error) -> RpcError {
    let kind = if err.is_timeout() || err.is_connect() {
        RpcErrorKind::Transient
    } else if err.is_decode() {
        RpcErrorKind::CodecDecode
    } else {
        RpcErrorKind::Permanent
    };
    RpcError::new(kind, method, err.to_string())
}

/// Decode a legacy base64-wrapped payload into JSON. Old sporks hand back
/// payloads the modern codec refuses; this is the raw path's decoder.
pub fn decode_legacy_payload(encoded: &str) -> Result<Value, String> {
    let bytes = base64::decode(encoded).map_err(|e| format!("base64: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("json: {}", e))
}

#[derive(Debug, Deserialize)]
struct RawEventEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    transaction_id: String,
    #[serde(default)]
    transaction_index: u32,
    event_index: u32,
    payload: String,
}

#[derive(Debug, Deserialize)]
struct RawResultEnvelope {
    transaction_id: String,
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    computation_used: u64,
    #[serde(default)]
    events: Vec<RawEventEnvelope>,
}

fn decode_raw_result(method: &'static str, raw: RawResultEnvelope) -> Result<ApiTransactionResult, RpcError> {
    let mut events = Vec::with_capacity(raw.events.len());
    for ev in raw.events {
        let payload = decode_legacy_payload(&ev.payload).map_err(|e| {
            RpcError::new(RpcErrorKind::CodecDecode, method, format!("raw payload: {}", e))
        })?;
        events.push(ApiEvent {
            event_type: ev.event_type,
            transaction_id: ev.transaction_id,
            transaction_index: ev.transaction_index,
            event_index: ev.event_index,
            payload,
        });
    }
    Ok(ApiTransactionResult {
        transaction_id: raw.transaction_id,
        status: raw.status,
        error_message: raw.error_message,
        computation_used: raw.computation_used,
        events,
    })
}

#[async_trait]
impl AccessApi for HttpAccessClient {
    async fn get_latest_block(&self, endpoint: &str) -> Result<ChainTip, RpcError> {
        #[derive(Deserialize)]
        struct Latest {
            id: String,
            height: u64,
        }
        let latest: Latest = self
            .get_json("GetLatestBlock", format!("{}/v1/blocks/sealed", endpoint))
            .await?;
        Ok(ChainTip {
            height: latest.height,
            id: latest.id,
        })
    }

    async fn get_block_by_height(&self, endpoint: &str, height: u64) -> Result<ApiBlock, RpcError> {
        self.get_json(
            "GetBlockByHeight",
            format!("{}/v1/blocks/height/{}", endpoint, height),
        )
        .await
    }

    async fn get_collection(
        &self,
        endpoint: &str,
        collection_id: &str,
        _height: u64,
    ) -> Result<ApiCollection, RpcError> {
        self.get_json(
            "GetCollection",
            format!("{}/v1/collections/{}", endpoint, collection_id),
        )
        .await
    }

    async fn get_transaction(
        &self,
        endpoint: &str,
        tx_id: &str,
        _height: u64,
    ) -> Result<ApiTransaction, RpcError> {
        self.get_json(
            "GetTransaction",
            format!("{}/v1/transactions/{}", endpoint, tx_id),
        )
        .await
    }

    async fn get_transaction_result(
        &self,
        endpoint: &str,
        tx_id: &str,
        _height: u64,
    ) -> Result<ApiTransactionResult, RpcError> {
        self.get_json(
            "GetTransactionResult",
            format!("{}/v1/transaction_results/{}", endpoint, tx_id),
        )
        .await
    }

    async fn get_transactions_by_block_id(
        &self,
        endpoint: &str,
        block_id: &str,
        _height: u64,
    ) -> Result<Vec<ApiTransaction>, RpcError> {
        self.get_json(
            "GetTransactionsByBlockID",
            format!("{}/v1/blocks/{}/transactions", endpoint, block_id),
        )
        .await
    }

    async fn get_transaction_results_by_block_id(
        &self,
        endpoint: &str,
        block_id: &str,
        _height: u64,
    ) -> Result<Vec<ApiTransactionResult>, RpcError> {
        self.get_json(
            "GetTransactionResultsByBlockID",
            format!("{}/v1/blocks/{}/transaction_results", endpoint, block_id),
        )
        .await
    }

    async fn get_transaction_results_by_block_id_raw(
        &self,
        endpoint: &str,
        block_id: &str,
        _height: u64,
    ) -> Result<Vec<ApiTransactionResult>, RpcError> {
        let method = "GetTransactionResultsByBlockIDRaw";
        let raw: Vec<RawResultEnvelope> = self
            .get_json(
                method,
                format!(
                    "{}/v1/blocks/{}/transaction_results?encoding=base64",
                    endpoint, block_id
                ),
            )
            .await?;
        raw.into_iter().map(|r| decode_raw_result(method, r)).collect()
    }

    async fn get_transaction_result_raw(
        &self,
        endpoint: &str,
        tx_id: &str,
        _height: u64,
    ) -> Result<ApiTransactionResult, RpcError> {
        let method = "GetTransactionResultRaw";
        let raw: RawResultEnvelope = self
            .get_json(
                method,
                format!(
                    "{}/v1/transaction_results/{}?encoding=base64",
                    endpoint, tx_id
                ),
            )
            .await?;
        decode_raw_result(method, raw)
    }

    async fn get_events_for_block(
        &self,
        endpoint: &str,
        block_id: &str,
        _height: u64,
        types: &[String],
    ) -> Result<Vec<ApiEvent>, RpcError> {
        self.get_json(
            "GetEventsForBlock",
            format!(
                "{}/v1/blocks/{}/events?type={}",
                endpoint,
                block_id,
                types.join(",")
            ),
        )
        .await
    }
}
