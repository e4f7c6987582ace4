use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use tracing::debug;

use crate::interfaces::{BookLevel, MarketInfo, OrderArgs, OrderBook, OrderResponse, Side};
use crate::utils::fetch_data::HttpFetcher;

/// Seam to the exchange order service. The executor and the resolution
/// loop only ever speak this trait, so tests inject fakes and live order
/// signing stays behind the collaborator.
pub trait Exchange: Send + Sync {
    fn get_order_book(&self, asset: &str) -> impl Future<Output = Result<OrderBook>> + Send;

    /// Submits a market order; `fill_or_kill` orders either fill
    /// completely and immediately or are cancelled.
    fn post_market_order(
        &self,
        args: &OrderArgs,
        fill_or_kill: bool,
    ) -> impl Future<Output = Result<OrderResponse>> + Send;

    fn get_market(&self, condition_id: &str) -> impl Future<Output = Result<MarketInfo>> + Send;
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawBook {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

/// CLOB REST client. Book levels arrive as decimal strings; levels that
/// fail to parse are dropped rather than failing the whole book.
pub struct ClobExchange {
    fetcher: HttpFetcher,
    client: reqwest::Client,
    clob_url: String,
}

impl ClobExchange {
    pub fn new(clob_http_url: &str, timeout_ms: u64, retries: u32) -> Result<Self> {
        Ok(ClobExchange {
            fetcher: HttpFetcher::new(timeout_ms, retries)?,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(timeout_ms))
                .build()?,
            clob_url: clob_http_url.trim_end_matches('/').to_string(),
        })
    }
}

impl Exchange for ClobExchange {
    async fn get_order_book(&self, asset: &str) -> Result<OrderBook> {
        let url = format!("{}/book?token_id={}", self.clob_url, asset);
        let raw: RawBook = self.fetcher.get_json(&url).await?;
        Ok(OrderBook {
            bids: parse_levels(&raw.bids),
            asks: parse_levels(&raw.asks),
        })
    }

    async fn post_market_order(&self, args: &OrderArgs, fill_or_kill: bool) -> Result<OrderResponse> {
        let side = match args.side {
            Side::Buy => "BUY",
            // MERGE executes as a sell of the held position.
            Side::Sell | Side::Merge => "SELL",
        };
        let body = json!({
            "order": {
                "tokenID": args.asset,
                "side": side,
                "amount": args.amount,
                "price": args.price,
            },
            "orderType": if fill_or_kill { "FOK" } else { "GTC" },
        });

        let response = self
            .client
            .post(format!("{}/order", self.clob_url))
            .json(&body)
            .send()
            .await?;
        let payload: Value = response.json().await?;
        debug!(asset = %args.asset, side, amount = args.amount, "order posted");

        let success = payload
            .get("success")
            .and_then(|s| s.as_bool())
            .unwrap_or(false);
        Ok(OrderResponse {
            success,
            error: extract_order_error(&payload),
        })
    }

    async fn get_market(&self, condition_id: &str) -> Result<MarketInfo> {
        let url = format!("{}/markets/{}", self.clob_url, condition_id);
        self.fetcher.get_json(&url).await
    }
}

fn parse_levels(raw: &[RawLevel]) -> Vec<BookLevel> {
    raw.iter()
        .filter_map(|l| {
            Some(BookLevel {
                price: l.price.parse().ok()?,
                size: l.size.parse().ok()?,
            })
        })
        .collect()
}

/// Order responses put the message in different fields depending on the
/// failure path.
fn extract_order_error(payload: &Value) -> Option<String> {
    for key in ["error", "errorMsg", "message"] {
        if let Some(value) = payload.get(key) {
            if let Some(s) = value.as_str() {
                return Some(s.to_string());
            }
            if let Some(nested) = value.get("message").and_then(|m| m.as_str()) {
                return Some(nested.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_levels_are_dropped() {
        let raw = vec![
            RawLevel { price: "0.42".into(), size: "100".into() },
            RawLevel { price: "n/a".into(), size: "5".into() },
        ];
        let levels = parse_levels(&raw);
        assert_eq!(levels.len(), 1);
        assert!((levels[0].price - 0.42).abs() < 1e-9);
    }

    #[test]
    fn order_error_extraction_covers_variants() {
        assert_eq!(
            extract_order_error(&serde_json::json!({ "errorMsg": "not enough balance" })),
            Some("not enough balance".to_string())
        );
        assert_eq!(
            extract_order_error(&serde_json::json!({ "error": { "message": "bad order" } })),
            Some("bad order".to_string())
        );
        assert_eq!(extract_order_error(&serde_json::json!({ "success": true })), None);
    }
}
