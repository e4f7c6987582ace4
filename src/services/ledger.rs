use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Store;
use crate::exchange::Exchange;
use crate::interfaces::{PaperPosition, PaperStats, WorkItem};

const SHARE_EPSILON: f64 = 1e-9;

/// Applies a simulated buy fill. The bot side records the simulated
/// execution, the target side records the source trade so slippage
/// between the two stays measurable.
pub fn apply_buy(
    position: &mut PaperPosition,
    bot_spend: f64,
    bot_shares: f64,
    target_spend: f64,
    target_shares: f64,
) {
    position.total_spend += bot_spend;
    position.total_shares += bot_shares;
    position.lifetime_spend += bot_spend;
    if position.total_shares > SHARE_EPSILON {
        position.avg_price = position.total_spend / position.total_shares;
    }

    position.target_spend += target_spend;
    position.target_shares += target_shares;
    position.target_lifetime_spend += target_spend;
    if position.target_shares > SHARE_EPSILON {
        position.target_avg_price = position.target_spend / position.target_shares;
    }
}

/// Applies a simulated sell fill. Both ledgers shrink by the sold
/// fraction; realized P&L is proceeds minus the cost basis removed. A
/// fully closed-out position zeroes its cost basis.
pub fn apply_sell(position: &mut PaperPosition, shares: f64, price: f64, target_price: f64) {
    if position.total_shares <= SHARE_EPSILON {
        return;
    }
    let shares = shares.min(position.total_shares);
    let fraction = shares / position.total_shares;

    let cost_removed = position.total_spend * fraction;
    let proceeds = shares * price;
    position.total_return += proceeds;
    position.pnl += proceeds - cost_removed;
    position.total_spend -= cost_removed;
    position.total_shares -= shares;

    let target_shares = position.target_shares * fraction;
    let target_cost_removed = position.target_spend * fraction;
    let target_proceeds = target_shares * target_price;
    position.target_return += target_proceeds;
    position.target_pnl += target_proceeds - target_cost_removed;
    position.target_spend -= target_cost_removed;
    position.target_shares -= target_shares;

    if position.total_shares <= SHARE_EPSILON {
        position.total_spend = 0.0;
        position.total_shares = 0.0;
        position.target_spend = 0.0;
        position.target_shares = 0.0;
    }
}

/// Settles a position against a resolved market. Winning outcome tokens
/// redeem at one dollar per share; everything else returns nothing. A
/// resolved market with no winner yet settles at zero as well.
pub fn apply_resolution(position: &mut PaperPosition, winner: Option<&str>) {
    let won = winner.is_some_and(|w| w.eq_ignore_ascii_case(&position.outcome));

    let redemption = if won { position.total_shares } else { 0.0 };
    position.total_return += redemption;
    position.pnl += redemption - position.total_spend;

    let target_redemption = if won { position.target_shares } else { 0.0 };
    position.target_return += target_redemption;
    position.target_pnl += target_redemption - position.target_spend;

    position.is_winner = won;
    position.is_closed = true;
}

/// Paper-trading position ledger over the persistent store.
pub struct PaperLedger {
    store: Store,
    /// The executor and the resolution sweep both read-modify-write the
    /// stats singleton; this serializes them.
    stats_lock: tokio::sync::Mutex<()>,
}

impl PaperLedger {
    pub fn new(store: Store) -> Self {
        PaperLedger {
            store,
            stats_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Positions discovered on-chain may lack a condition id; fall back
    /// to the asset so unrelated markets never share a ledger entry.
    fn position_key(item: &WorkItem) -> &str {
        if item.condition_id.is_empty() {
            &item.asset
        } else {
            &item.condition_id
        }
    }

    pub async fn record_buy(&self, item: &WorkItem, bot_spend: f64, bot_shares: f64) -> Result<()> {
        let key = Self::position_key(item);
        let mut position = self
            .store
            .find_position(key, &item.outcome)
            .await?
            .unwrap_or_else(|| PaperPosition::new(key, &item.outcome, &item.title));
        apply_buy(&mut position, bot_spend, bot_shares, item.usdc_size, item.size);
        self.store.upsert_position(&position).await?;
        info!(
            market = %position.title,
            outcome = %position.outcome,
            shares = position.total_shares,
            avg_price = position.avg_price,
            "paper buy recorded"
        );
        Ok(())
    }

    pub async fn record_sell(&self, item: &WorkItem, shares: f64, price: f64) -> Result<()> {
        let key = Self::position_key(item);
        let Some(mut position) = self.store.find_position(key, &item.outcome).await? else {
            warn!(condition = key, outcome = %item.outcome, "paper sell without a position");
            return Ok(());
        };
        apply_sell(&mut position, shares, price, item.price);
        self.store.upsert_position(&position).await?;
        info!(
            market = %position.title,
            outcome = %position.outcome,
            sold = shares,
            remaining = position.total_shares,
            "paper sell recorded"
        );
        Ok(())
    }

    pub async fn held_shares(&self, item: &WorkItem) -> Result<f64> {
        let position = self
            .store
            .find_position(Self::position_key(item), &item.outcome)
            .await?;
        Ok(position.filter(|p| !p.is_closed).map_or(0.0, |p| p.total_shares))
    }

    /// The target's remaining shares as mirrored in the paper ledger,
    /// used to size sells by the fraction of their position being sold.
    pub async fn target_held_shares(&self, item: &WorkItem) -> Result<f64> {
        let position = self
            .store
            .find_position(Self::position_key(item), &item.outcome)
            .await?;
        Ok(position.filter(|p| !p.is_closed).map_or(0.0, |p| p.target_shares))
    }

    /// Rolls detection-to-execution latency into the running mean.
    pub async fn record_latency(&self, latency_secs: f64) -> Result<()> {
        if latency_secs < 0.0 {
            return Ok(());
        }
        let _guard = self.stats_lock.lock().await;
        let mut stats = self.store.load_stats().await?;
        let n = stats.trades_with_latency as f64;
        stats.avg_latency_secs = (stats.avg_latency_secs * n + latency_secs) / (n + 1.0);
        stats.trades_with_latency += 1;
        self.store.save_stats(&stats).await?;
        Ok(())
    }

    /// One resolution sweep: settle every open position whose market has
    /// closed and fold the outcome into the aggregate stats.
    pub async fn resolve_once<E: Exchange>(&self, exchange: &E) -> Result<()> {
        let open = self.store.open_positions().await?;
        if open.is_empty() {
            return Ok(());
        }

        let mut by_condition: HashMap<String, Vec<PaperPosition>> = HashMap::new();
        for position in open {
            by_condition
                .entry(position.condition_id.clone())
                .or_default()
                .push(position);
        }

        for (condition_id, positions) in by_condition {
            // Chain-origin positions are keyed by asset id; there is no
            // market document to ask for, so they stay open until a REST
            // observation supplies the condition id.
            if !resolvable(&condition_id) {
                debug!(key = %condition_id, "position has no condition id, skipping sweep");
                continue;
            }
            let market = match exchange.get_market(&condition_id).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(condition = %condition_id, error = %e, "market lookup failed");
                    continue;
                }
            };
            if !market.closed {
                continue;
            }
            let winner = market.winning_outcome().map(str::to_string);
            if winner.is_none() {
                warn!(condition = %condition_id, "market closed without a winner, settling at zero");
            }

            for mut position in positions {
                apply_resolution(&mut position, winner.as_deref());
                self.store.upsert_position(&position).await?;
                self.roll_into_stats(&position).await?;
                info!(
                    market = %position.title,
                    outcome = %position.outcome,
                    won = position.is_winner,
                    pnl = position.pnl,
                    "position resolved"
                );
            }
        }
        Ok(())
    }

    /// Lifetime spend pairs with `total_return` (which includes sell
    /// proceeds), so partially-sold positions do not understate spend.
    async fn roll_into_stats(&self, position: &PaperPosition) -> Result<()> {
        let _guard = self.stats_lock.lock().await;
        let mut stats = self.store.load_stats().await?;
        stats.total_spend += position.lifetime_spend;
        stats.total_returns += position.total_return;
        stats.net_pnl += position.pnl;
        stats.target_total_spend += position.target_lifetime_spend;
        stats.target_total_returns += position.target_return;
        stats.target_net_pnl += position.target_pnl;
        if position.is_winner {
            stats.winning_positions += 1;
        } else {
            stats.losing_positions += 1;
        }
        if position.lifetime_spend > stats.largest_market_spend {
            stats.largest_market_spend = position.lifetime_spend;
            stats.largest_market_title = position.title.clone();
        }
        self.store.save_stats(&stats).await?;
        Ok(())
    }
}

/// Condition ids are 0x-prefixed hashes; asset ids (the fallback
/// position key for chain-decoded trades) are decimal token ids.
fn resolvable(condition_id: &str) -> bool {
    condition_id.starts_with("0x")
}

/// Long-running resolution loop, paper mode only.
pub async fn run_resolution<E: Exchange>(
    ledger: Arc<PaperLedger>,
    exchange: Arc<E>,
    interval_secs: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = ledger.resolve_once(exchange.as_ref()).await {
            warn!(error = %e, "resolution sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_position() -> PaperPosition {
        let mut p = PaperPosition::new("0xcond", "Yes", "Will it rain?");
        apply_buy(&mut p, 4.0, 10.0, 4.4, 11.0);
        p
    }

    #[test]
    fn buys_track_weighted_average() {
        let mut p = open_position();
        apply_buy(&mut p, 3.5, 5.0, 3.85, 5.5);
        assert!((p.total_spend - 7.5).abs() < 1e-9);
        assert!((p.total_shares - 15.0).abs() < 1e-9);
        assert!((p.avg_price - 0.5).abs() < 1e-9);
        assert!((p.target_shares - 16.5).abs() < 1e-9);
    }

    #[test]
    fn partial_sell_conserves_cost_basis() {
        let mut p = open_position();
        apply_sell(&mut p, 4.0, 0.5, 0.5);

        // 40% of the position sold, 40% of the spend removed.
        assert!((p.total_shares - 6.0).abs() < 1e-9);
        assert!((p.total_spend - 2.4).abs() < 1e-9);
        assert!((p.total_return - 2.0).abs() < 1e-9);
        // Proceeds 2.0 against 1.6 of cost.
        assert!((p.pnl - 0.4).abs() < 1e-9);
        assert!(!p.is_closed);
    }

    #[test]
    fn full_sell_zeroes_cost_basis() {
        let mut p = open_position();
        apply_sell(&mut p, 10.0, 0.5, 0.5);
        assert_eq!(p.total_shares, 0.0);
        assert_eq!(p.total_spend, 0.0);
        assert_eq!(p.target_shares, 0.0);
        assert_eq!(p.target_spend, 0.0);
        assert!((p.total_return - 5.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_sell_is_clamped_to_the_position() {
        let mut p = open_position();
        apply_sell(&mut p, 25.0, 0.5, 0.5);
        assert_eq!(p.total_shares, 0.0);
        assert!((p.total_return - 5.0).abs() < 1e-9);
    }

    #[test]
    fn lifetime_spend_survives_sells() {
        let mut p = open_position();
        assert!((p.lifetime_spend - 4.0).abs() < 1e-9);
        apply_sell(&mut p, 4.0, 0.5, 0.5);
        // Residual cost basis shrinks, the lifetime figure does not.
        assert!((p.total_spend - 2.4).abs() < 1e-9);
        assert!((p.lifetime_spend - 4.0).abs() < 1e-9);
        assert!((p.target_lifetime_spend - 4.4).abs() < 1e-9);
    }

    #[test]
    fn partially_sold_position_accounts_consistently_at_close() {
        let mut p = open_position();
        apply_sell(&mut p, 4.0, 0.5, 0.5);
        apply_resolution(&mut p, Some("Yes"));
        // Sell proceeds 2.0 plus 6 redeemed shares against 4.0 lifetime
        // spend; realized P&L must match returns minus lifetime spend.
        assert!((p.total_return - 8.0).abs() < 1e-9);
        assert!((p.pnl - (p.total_return - p.lifetime_spend)).abs() < 1e-9);
    }

    #[test]
    fn winning_resolution_redeems_at_one_dollar() {
        let mut p = open_position();
        apply_resolution(&mut p, Some("Yes"));
        assert!(p.is_closed);
        assert!(p.is_winner);
        assert!((p.total_return - 10.0).abs() < 1e-9);
        assert!((p.pnl - 6.0).abs() < 1e-9);
        assert!((p.target_pnl - (11.0 - 4.4)).abs() < 1e-9);
    }

    #[test]
    fn losing_resolution_returns_nothing() {
        let mut p = open_position();
        apply_resolution(&mut p, Some("No"));
        assert!(p.is_closed);
        assert!(!p.is_winner);
        assert_eq!(p.total_return, 0.0);
        assert!((p.pnl - (-4.0)).abs() < 1e-9);
    }

    #[test]
    fn asset_keyed_positions_are_not_swept() {
        assert!(resolvable("0xcond"));
        assert!(!resolvable("52114319501245915516055106046884209969926127482827954674443846427813813222426"));
        assert!(!resolvable(""));
    }

    #[test]
    fn disputed_market_settles_at_zero() {
        let mut p = open_position();
        apply_resolution(&mut p, None);
        assert!(p.is_closed);
        assert!(!p.is_winner);
        assert_eq!(p.total_return, 0.0);
    }
}
