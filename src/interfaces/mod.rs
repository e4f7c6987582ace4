use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade direction as reported by the activity feed or inferred on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "MERGE")]
    Merge,
}

impl Side {
    pub fn parse(s: &str) -> Option<Side> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            "MERGE" => Some(Side::Merge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::Merge => "MERGE",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which producer first observed a trade. Dedup is hash-based, never
/// source-based, so this is informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOrigin {
    #[serde(rename = "REST")]
    Rest,
    #[serde(rename = "CHAIN")]
    Chain,
}

impl fmt::Display for TradeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOrigin::Rest => f.write_str("REST"),
            TradeOrigin::Chain => f.write_str("CHAIN"),
        }
    }
}

/// One detected target-account fill, persisted keyed by transaction hash.
/// Created by the discovery service; only the executor mutates `attempts`
/// and `dispatched`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub transaction_hash: String,
    pub condition_id: String,
    /// Outcome token id.
    pub asset: String,
    pub side: Side,
    pub outcome: String,
    /// Shares.
    pub size: f64,
    /// Notional value in USDC.
    pub usdc_size: f64,
    /// Implied price, in [0, 1].
    pub price: f64,
    pub title: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub origin: TradeOrigin,
    /// Whether this trade should be replicated.
    pub copy: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub dispatched: bool,
}

/// Transient output of the chain decoder; feeds DiscoveryRecord creation.
#[derive(Debug, Clone)]
pub struct DecodedTrade {
    pub transaction_hash: String,
    pub side: Side,
    pub asset: String,
    pub size: f64,
    pub usdc_size: f64,
    pub price: f64,
    pub timestamp: i64,
}

/// Aggregation of pending records sharing (asset, side, outcome). Built
/// fresh each execution cycle, never persisted.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub asset: String,
    pub side: Side,
    pub outcome: String,
    pub condition_id: String,
    pub title: String,
    /// Merged shares.
    pub size: f64,
    /// Merged notional.
    pub usdc_size: f64,
    /// Volume-weighted average price of the constituents.
    pub price: f64,
    /// Latest constituent timestamp.
    pub timestamp: i64,
    pub record_hashes: Vec<String>,
}

/// One entry of the data-api activity feed. Keys from the API are
/// camelCase; absent fields default rather than fail the whole page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    #[serde(default)]
    pub proxy_wallet: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub condition_id: String,
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub usdc_size: f64,
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub title: String,
}

impl ActivityEntry {
    /// MERGE arrives as an activity type, not a side.
    pub fn effective_side(&self) -> Option<Side> {
        if self.activity_type.eq_ignore_ascii_case("MERGE") {
            Some(Side::Merge)
        } else {
            Side::parse(&self.side)
        }
    }
}

/// One price level of the live order book, already parsed to numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Lowest ask, the price a buyer crosses.
    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks
            .iter()
            .copied()
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// Highest bid, the price a seller crosses.
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids
            .iter()
            .copied()
            .max_by(|a, b| a.price.total_cmp(&b.price))
    }
}

/// Arguments for a market order. `amount` is USDC notional for buys and
/// shares for sells, matching the CLOB market-order convention.
#[derive(Debug, Clone)]
pub struct OrderArgs {
    pub asset: String,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Default)]
pub struct OrderResponse {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketToken {
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub winner: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketInfo {
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub tokens: Vec<MarketToken>,
}

impl MarketInfo {
    pub fn winning_outcome(&self) -> Option<&str> {
        self.tokens
            .iter()
            .find(|t| t.winner)
            .map(|t| t.outcome.as_str())
    }
}

/// Paper-trading position, keyed uniquely by (conditionId, outcome).
/// Tracks the bot-side and target-side cost basis independently so
/// slippage between the two can be measured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperPosition {
    pub condition_id: String,
    pub outcome: String,
    pub title: String,
    pub total_spend: f64,
    pub total_shares: f64,
    pub avg_price: f64,
    /// Everything ever spent on this position; sells never reduce it.
    #[serde(default)]
    pub lifetime_spend: f64,
    pub target_spend: f64,
    pub target_shares: f64,
    pub target_avg_price: f64,
    #[serde(default)]
    pub target_lifetime_spend: f64,
    pub total_return: f64,
    pub target_return: f64,
    pub is_closed: bool,
    pub is_winner: bool,
    pub pnl: f64,
    pub target_pnl: f64,
}

impl PaperPosition {
    pub fn new(condition_id: &str, outcome: &str, title: &str) -> Self {
        PaperPosition {
            condition_id: condition_id.to_string(),
            outcome: outcome.to_string(),
            title: title.to_string(),
            total_spend: 0.0,
            total_shares: 0.0,
            avg_price: 0.0,
            lifetime_spend: 0.0,
            target_spend: 0.0,
            target_shares: 0.0,
            target_avg_price: 0.0,
            target_lifetime_spend: 0.0,
            total_return: 0.0,
            target_return: 0.0,
            is_closed: false,
            is_winner: false,
            pnl: 0.0,
            target_pnl: 0.0,
        }
    }
}

/// Singleton paper-trading aggregate, updated atomically whenever a
/// position closes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperStats {
    pub total_spend: f64,
    pub total_returns: f64,
    pub winning_positions: i64,
    pub losing_positions: i64,
    pub net_pnl: f64,
    pub target_total_spend: f64,
    pub target_total_returns: f64,
    pub target_net_pnl: f64,
    pub largest_market_spend: f64,
    pub largest_market_title: String,
    pub avg_latency_secs: f64,
    pub trades_with_latency: i64,
}
