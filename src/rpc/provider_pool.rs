use alloy::primitives::U256;
use futures_util::future;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// At most this many healthy endpoints are raced per call.
const MAX_RACED: usize = 5;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rate limited by {endpoint}: {message}")]
    RateLimited { endpoint: String, message: String },
    #[error("transport error from {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("bad response from {endpoint}: {message}")]
    BadResponse { endpoint: String, message: String },
    #[error("all raced providers failed")]
    AllProvidersFailed,
}

impl RpcError {
    fn endpoint(&self) -> Option<&str> {
        match self {
            RpcError::RateLimited { endpoint, .. }
            | RpcError::Transport { endpoint, .. }
            | RpcError::BadResponse { endpoint, .. } => Some(endpoint),
            RpcError::AllProvidersFailed => None,
        }
    }
}

/// Per-endpoint health, process-memory only. Safe to lose on restart.
#[derive(Debug, Clone)]
struct ProviderHealth {
    url: String,
    healthy: bool,
    cooldown_until: Option<Instant>,
    last_error_at: Option<Instant>,
}

/// Pool of JSON-RPC endpoints. Read-only queries are raced across the
/// healthy subset; rate-limited endpoints cool down instead of failing
/// the overall call. If every endpoint is unhealthy at once the pool
/// resets to all-healthy rather than deadlocking.
pub struct ProviderPool {
    client: reqwest::Client,
    cooldown: Duration,
    endpoints: Mutex<Vec<ProviderHealth>>,
}

impl ProviderPool {
    pub fn new(urls: Vec<String>, timeout_ms: u64, cooldown_secs: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(!urls.is_empty(), "provider pool needs at least one RPC url");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        let endpoints = urls
            .into_iter()
            .map(|url| ProviderHealth {
                url,
                healthy: true,
                cooldown_until: None,
                last_error_at: None,
            })
            .collect();
        Ok(ProviderPool {
            client,
            cooldown: Duration::from_secs(cooldown_secs),
            endpoints: Mutex::new(endpoints),
        })
    }

    /// Snapshot of endpoints eligible for the next race, capped at
    /// MAX_RACED. Expired cooldowns are lifted here; an all-unhealthy
    /// table fails open.
    fn pick_endpoints(&self) -> Vec<String> {
        let now = Instant::now();
        let mut endpoints = self.endpoints.lock().unwrap();

        for ep in endpoints.iter_mut() {
            if !ep.healthy {
                if let Some(until) = ep.cooldown_until {
                    if now >= until {
                        ep.healthy = true;
                        ep.cooldown_until = None;
                    }
                }
            }
        }

        if endpoints.iter().all(|ep| !ep.healthy) {
            warn!("all rpc endpoints unhealthy, resetting pool to healthy");
            for ep in endpoints.iter_mut() {
                ep.healthy = true;
                ep.cooldown_until = None;
            }
        }

        endpoints
            .iter()
            .filter(|ep| ep.healthy)
            .take(MAX_RACED)
            .map(|ep| ep.url.clone())
            .collect()
    }

    fn mark_rate_limited(&self, url: &str) {
        let now = Instant::now();
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(ep) = endpoints.iter_mut().find(|ep| ep.url == url) {
            ep.healthy = false;
            ep.cooldown_until = Some(now + self.cooldown);
            ep.last_error_at = Some(now);
        }
    }

    fn note_error(&self, url: &str) {
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(ep) = endpoints.iter_mut().find(|ep| ep.url == url) {
            ep.last_error_at = Some(Instant::now());
        }
    }

    /// Issues `method` against the healthy subset concurrently and
    /// returns the first success. Fails only when every raced endpoint
    /// fails.
    pub async fn race<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let urls = self.pick_endpoints();
        let mut futs: Vec<_> = urls
            .into_iter()
            .map(|url| Box::pin(self.call_one::<T>(url, method, params.clone())))
            .collect();

        let mut last_err = RpcError::AllProvidersFailed;
        while !futs.is_empty() {
            let (result, _idx, rest) = future::select_all(futs).await;
            futs = rest;
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if let Some(endpoint) = err.endpoint() {
                        if matches!(err, RpcError::RateLimited { .. }) {
                            debug!(endpoint, method, "endpoint rate limited, cooling down");
                            self.mark_rate_limited(endpoint);
                        } else {
                            self.note_error(endpoint);
                        }
                    }
                    last_err = err;
                }
            }
        }

        match last_err {
            RpcError::AllProvidersFailed => Err(RpcError::AllProvidersFailed),
            other => {
                warn!(method, error = %other, "every raced provider failed");
                Err(RpcError::AllProvidersFailed)
            }
        }
    }

    async fn call_one<T: DeserializeOwned>(
        &self,
        url: String,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.status().map(|s| s.as_u16()) == Some(429) {
                    RpcError::RateLimited {
                        endpoint: url.clone(),
                        message: e.to_string(),
                    }
                } else {
                    RpcError::Transport {
                        endpoint: url.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(RpcError::RateLimited {
                endpoint: url,
                message: "HTTP 429".to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(RpcError::Transport {
                endpoint: url,
                message: format!("HTTP {}", response.status()),
            });
        }

        let payload: Value = response.json().await.map_err(|e| RpcError::BadResponse {
            endpoint: url.clone(),
            message: e.to_string(),
        })?;

        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown rpc error")
                .to_string();
            if is_rate_limit_message(&message) {
                return Err(RpcError::RateLimited { endpoint: url, message });
            }
            return Err(RpcError::BadResponse { endpoint: url, message });
        }

        let result = payload
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::BadResponse {
                endpoint: url.clone(),
                message: "missing result".to_string(),
            })?;

        serde_json::from_value(result).map_err(|e| RpcError::BadResponse {
            endpoint: url,
            message: e.to_string(),
        })
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let hex: String = self.race("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex).ok_or(RpcError::AllProvidersFailed)
    }

    pub async fn block_with_transactions(&self, number: u64) -> Result<Value, RpcError> {
        self.race(
            "eth_getBlockByNumber",
            json!([format!("0x{number:x}"), true]),
        )
        .await
    }

    pub async fn transaction_receipt(&self, hash: &str) -> Result<Value, RpcError> {
        self.race("eth_getTransactionReceipt", json!([hash])).await
    }

    /// USDC `balanceOf(address)` via eth_call; USDC has 6 decimals.
    pub async fn usdc_balance_of(&self, usdc_contract: &str, address: &str) -> Result<f64, RpcError> {
        let padded = format!("{:0>64}", address.trim_start_matches("0x"));
        let data = format!("0x70a08231{padded}");
        let result: String = self
            .race(
                "eth_call",
                json!([{ "to": usdc_contract, "data": data }, "latest"]),
            )
            .await?;
        let raw = U256::from_str_radix(result.trim_start_matches("0x"), 16).map_err(|e| {
            RpcError::BadResponse {
                endpoint: "eth_call".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(raw.saturating_to::<u64>() as f64 / 1_000_000.0)
    }
}

fn parse_hex_u64(hex: &str) -> Option<u64> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok()
}

fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("exceeded")
        || lower.contains("429")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(urls: &[&str]) -> ProviderPool {
        ProviderPool::new(urls.iter().map(|s| s.to_string()).collect(), 1000, 60).unwrap()
    }

    #[test]
    fn rate_limited_endpoint_is_excluded_from_next_race() {
        let pool = pool_with(&["http://a", "http://b"]);
        pool.mark_rate_limited("http://a");
        assert_eq!(pool.pick_endpoints(), vec!["http://b".to_string()]);
    }

    #[test]
    fn all_unhealthy_fails_open() {
        let pool = pool_with(&["http://a", "http://b"]);
        pool.mark_rate_limited("http://a");
        pool.mark_rate_limited("http://b");
        let picked = pool.pick_endpoints();
        assert_eq!(picked.len(), 2, "pool must reset instead of deadlocking");
    }

    #[test]
    fn cooldown_expiry_restores_endpoint() {
        let mut pool = pool_with(&["http://a", "http://b"]);
        pool.cooldown = Duration::from_millis(1);
        pool.mark_rate_limited("http://a");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.pick_endpoints().len(), 2);
    }

    #[test]
    fn race_width_is_capped() {
        let urls: Vec<String> = (0..8).map(|i| format!("http://rpc{i}")).collect();
        let pool = ProviderPool::new(urls, 1000, 60).unwrap();
        assert_eq!(pool.pick_endpoints().len(), MAX_RACED);
    }

    #[test]
    fn rate_limit_classification() {
        assert!(is_rate_limit_message("Too Many Requests"));
        assert!(is_rate_limit_message("daily request count exceeded"));
        assert!(!is_rate_limit_message("execution reverted"));
    }
}
