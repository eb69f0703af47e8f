/// Node pool and rate limiter
///
/// Holds the access-node endpoints with a per-endpoint token bucket and an
/// optional global ceiling. pick() blocks until an eligible endpoint has a
/// token or the caller cancels; repeated failures push an endpoint into an
/// exponentially growing cooldown (1s to 60s).

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::IndexError;
use crate::metrics;

/// Failures tolerated before an endpoint starts cooling down.
const COOLDOWN_AFTER_FAILURES: u32 = 3;
const COOLDOWN_MIN: Duration = Duration::from_secs(1);
const COOLDOWN_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Outcome of a fallible call, for release().
pub fn outcome_of<T, E>(result: &Result<T, E>) -> CallOutcome {
    if result.is_ok() {
        CallOutcome::Success
    } else {
        CallOutcome::Failure
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    burst: f64,
    /// Tokens per second; zero or negative disables the bucket.
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            burst,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.rate <= 0.0 {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.rate <= 0.0 {
            return true;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available.
    fn wait_for_token(&self) -> Duration {
        if self.rate <= 0.0 || self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
    }
}

#[derive(Debug)]
struct EndpointState {
    bucket: TokenBucket,
    last_used: Instant,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

#[derive(Debug)]
struct PoolState {
    endpoints: HashMap<String, EndpointState>,
    global: Option<TokenBucket>,
}

/// Shared, internally synchronized endpoint pool.
pub struct NodePool {
    state: Mutex<PoolState>,
}

impl NodePool {
    /// `global_rps < 0` disables the global ceiling.
    pub fn new(
        endpoints: impl IntoIterator<Item = String>,
        per_node_rps: u32,
        per_node_burst: u32,
        global_rps: i64,
        global_burst: u32,
    ) -> Self {
        let now = Instant::now();
        let endpoints = endpoints
            .into_iter()
            .map(|url| {
                (
                    url,
                    EndpointState {
                        bucket: TokenBucket::new(per_node_rps as f64, per_node_burst.max(1) as f64),
                        last_used: now,
                        consecutive_failures: 0,
                        cooldown_until: None,
                    },
                )
            })
            .collect();
        let global = (global_rps > 0)
            .then(|| TokenBucket::new(global_rps as f64, global_burst.max(1) as f64));
        Self {
            state: Mutex::new(PoolState { endpoints, global }),
        }
    }

    /// Register endpoints discovered after construction (e.g. from spork
    /// entries outside the live pool). Existing state is kept.
    pub async fn ensure_endpoints(
        &self,
        urls: impl IntoIterator<Item = String>,
        per_node_rps: u32,
        per_node_burst: u32,
    ) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for url in urls {
            state.endpoints.entry(url).or_insert_with(|| EndpointState {
                bucket: TokenBucket::new(per_node_rps as f64, per_node_burst.max(1) as f64),
                last_used: now,
                consecutive_failures: 0,
                cooldown_until: None,
            });
        }
    }

    /// Pick an endpoint from `eligible`, preferring least-recently-used
    /// among those out of cooldown with a token available. Blocks until a
    /// token frees up; if every eligible endpoint is cooling down, waits for
    /// the earliest cooldown to end. Cancellation aborts the wait.
    pub async fn pick(
        &self,
        eligible: &[String],
        cancel: &CancellationToken,
    ) -> Result<String, IndexError> {
        if eligible.is_empty() {
            return Err(IndexError::Config("no eligible endpoints for height".into()));
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                if let Some(global) = state.global.as_mut() {
                    global.refill(now);
                }

                // Candidates out of cooldown, LRU first.
                let mut candidates: Vec<&String> = eligible
                    .iter()
                    .filter(|url| {
                        state
                            .endpoints
                            .get(*url)
                            .map(|ep| ep.cooldown_until.map(|t| t <= now).unwrap_or(true))
                            .unwrap_or(false)
                    })
                    .collect();

                if candidates.is_empty() {
                    // Everything is cooling down; wait for the earliest end.
                    let earliest = eligible
                        .iter()
                        .filter_map(|url| state.endpoints.get(url))
                        .filter_map(|ep| ep.cooldown_until)
                        .min();
                    match earliest {
                        Some(t) => t.saturating_duration_since(now).max(Duration::from_millis(10)),
                        None => {
                            return Err(IndexError::Config(
                                "eligible endpoints are not registered in the pool".into(),
                            ))
                        }
                    }
                } else {
                    candidates.sort_by_key(|url| state.endpoints[*url].last_used);

                    let global_ok = state
                        .global
                        .as_mut()
                        .map(|g| g.tokens >= 1.0 || g.rate <= 0.0)
                        .unwrap_or(true);

                    let mut picked = None;
                    if global_ok {
                        for url in &candidates {
                            let ep = state.endpoints.get_mut(*url).unwrap();
                            ep.bucket.refill(now);
                            if ep.bucket.try_take() {
                                ep.last_used = now;
                                picked = Some((*url).clone());
                                break;
                            }
                        }
                    }

                    match picked {
                        Some(url) => {
                            if let Some(global) = state.global.as_mut() {
                                global.try_take();
                            }
                            return Ok(url);
                        }
                        None => {
                            // Shortest wait across the global bucket and the
                            // candidates' buckets.
                            let mut wait = state
                                .global
                                .as_ref()
                                .map(|g| g.wait_for_token())
                                .unwrap_or(Duration::ZERO);
                            if wait.is_zero() {
                                wait = candidates
                                    .iter()
                                    .map(|url| state.endpoints[*url].bucket.wait_for_token())
                                    .min()
                                    .unwrap_or(Duration::from_millis(50));
                            }
                            wait.max(Duration::from_millis(10))
                        }
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Report the outcome of a call on a picked endpoint. Failures
    /// accumulate into an exponentially growing cooldown.
    pub async fn release(&self, endpoint: &str, outcome: CallOutcome) {
        let mut state = self.state.lock().await;
        let Some(ep) = state.endpoints.get_mut(endpoint) else {
            return;
        };
        match outcome {
            CallOutcome::Success => {
                ep.consecutive_failures = 0;
                ep.cooldown_until = None;
            }
            CallOutcome::Failure => {
                ep.consecutive_failures += 1;
                if ep.consecutive_failures >= COOLDOWN_AFTER_FAILURES {
                    let exp = ep.consecutive_failures - COOLDOWN_AFTER_FAILURES;
                    let backoff = COOLDOWN_MIN
                        .checked_mul(1u32 << exp.min(6))
                        .unwrap_or(COOLDOWN_MAX)
                        .min(COOLDOWN_MAX);
                    ep.cooldown_until = Some(Instant::now() + backoff);
                    metrics::ENDPOINT_COOLDOWNS.with_label_values(&[endpoint]).inc();
                    warn!(endpoint, failures = ep.consecutive_failures, backoff_secs = backoff.as_secs(), "endpoint entering cooldown");
                } else {
                    debug!(endpoint, failures = ep.consecutive_failures, "endpoint call failed");
                }
            }
        }
    }

    /// Endpoints currently out of cooldown, for diagnostics.
    pub async fn healthy_count(&self) -> usize {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .endpoints
            .values()
            .filter(|ep| ep.cooldown_until.map(|t| t <= now).unwrap_or(true))
            .count()
    }
}
