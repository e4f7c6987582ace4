use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Env, SizingPolicy, Store};
use crate::exchange::Exchange;
use crate::interfaces::{OrderArgs, Side, WorkItem};
use crate::services::aggregator::aggregate;
use crate::services::ledger::PaperLedger;
use crate::utils::balance_cache::BalanceCache;
use crate::utils::dispatch_gate::DispatchGate;
use crate::utils::fetch_data::HttpFetcher;

/// Orders below this notional are dust and not worth posting.
const MIN_ORDER_USDC: f64 = 0.01;
const SHARE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    PriceDrift { live: f64, target: f64 },
    NoPosition,
    EmptyBook,
    ZeroSized,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecOutcome {
    Filled { shares: f64, usdc: f64 },
    Skipped(SkipReason),
    RetryExhausted { attempts: u32 },
}

/// How much to work off the book: buys are usually sized in USDC
/// notional, sells and share-matched buys in outcome shares.
#[derive(Debug, Clone, Copy)]
pub enum OrderSize {
    Notional(f64),
    Shares(f64),
}

/// Buy notional under the configured sizing policy, truncated at the
/// per-trade cap. Share-matched sizing never goes through here.
pub fn sized_notional(
    policy: SizingPolicy,
    trade_scale: f64,
    max_trade_amount: f64,
    target_usdc: f64,
    bot_balance: f64,
    target_balance: f64,
) -> f64 {
    let raw = match policy {
        SizingPolicy::Exact | SizingPolicy::PaperMatch => target_usdc * trade_scale,
        SizingPolicy::Proportional => {
            // The target's balance no longer includes what they just
            // spent, so the ratio is taken against balance + notional.
            let denominator = target_balance + target_usdc;
            if denominator <= 0.0 {
                0.0
            } else {
                target_usdc * (bot_balance / denominator) * trade_scale
            }
        }
    };
    raw.min(max_trade_amount)
}

/// Shares to sell: the fraction of the target's pre-trade position they
/// sold, applied to the bot's holding. Without a usable target position
/// the target's share count (scaled) stands in. Always clamped to what
/// the bot holds.
pub fn sized_sell_shares(
    policy: SizingPolicy,
    trade_scale: f64,
    held: f64,
    target_sold: f64,
    target_pre_trade: Option<f64>,
) -> f64 {
    let wanted = match policy {
        SizingPolicy::PaperMatch => target_sold,
        _ => match target_pre_trade {
            Some(pre_trade) if pre_trade > SHARE_EPSILON => {
                let fraction = (target_sold / pre_trade).min(1.0);
                held * fraction * trade_scale
            }
            _ => target_sold * trade_scale,
        },
    };
    wanted.min(held)
}

/// Walks the live book for one work item. Each pass takes the best
/// opposing level, guards against price drift from the copied trade,
/// and posts a fill-or-kill order sized to min(remaining, depth). A
/// successful order resets the retry counter; in paper mode the whole
/// remainder fills at the best level without posting anything.
pub async fn walk_book<E: Exchange>(
    exchange: &E,
    item: &WorkItem,
    size: OrderSize,
    max_price_diff: f64,
    retry_limit: u32,
    paper: bool,
) -> Result<ExecOutcome> {
    let buying = item.side == Side::Buy;
    let mut remaining = match size {
        OrderSize::Notional(n) => n,
        OrderSize::Shares(s) => s,
    };
    let in_shares = matches!(size, OrderSize::Shares(_));

    let mut filled_shares = 0.0;
    let mut filled_usdc = 0.0;
    let mut retries: u32 = 0;

    loop {
        let book = exchange.get_order_book(&item.asset).await?;
        let best = if buying { book.best_ask() } else { book.best_bid() };
        let Some(best) = best else {
            if filled_shares > SHARE_EPSILON {
                return Ok(ExecOutcome::Filled { shares: filled_shares, usdc: filled_usdc });
            }
            return Ok(ExecOutcome::Skipped(SkipReason::EmptyBook));
        };

        if (best.price - item.price).abs() > max_price_diff {
            if filled_shares > SHARE_EPSILON {
                return Ok(ExecOutcome::Filled { shares: filled_shares, usdc: filled_usdc });
            }
            return Ok(ExecOutcome::Skipped(SkipReason::PriceDrift {
                live: best.price,
                target: item.price,
            }));
        }

        if paper {
            let (shares, usdc) = if in_shares {
                (remaining, remaining * best.price)
            } else {
                (remaining / best.price, remaining)
            };
            return Ok(ExecOutcome::Filled { shares, usdc });
        }

        let depth_notional = best.price * best.size;
        let (chunk_shares, chunk_usdc) = if in_shares {
            let shares = remaining.min(best.size);
            (shares, shares * best.price)
        } else {
            let usdc = remaining.min(depth_notional);
            (usdc / best.price, usdc)
        };

        let args = OrderArgs {
            asset: item.asset.clone(),
            side: item.side,
            amount: if buying { chunk_usdc } else { chunk_shares },
            price: best.price,
        };
        let response = exchange.post_market_order(&args, true).await?;

        if response.success {
            filled_shares += chunk_shares;
            filled_usdc += chunk_usdc;
            remaining -= if in_shares { chunk_shares } else { chunk_usdc };
            retries = 0;
            let done = if in_shares {
                remaining <= SHARE_EPSILON
            } else {
                remaining <= MIN_ORDER_USDC
            };
            if done {
                return Ok(ExecOutcome::Filled { shares: filled_shares, usdc: filled_usdc });
            }
        } else {
            retries += 1;
            warn!(
                asset = %item.asset,
                attempt = retries,
                error = response.error.as_deref().unwrap_or("unknown"),
                "order rejected"
            );
            if retries >= retry_limit {
                return Ok(ExecOutcome::RetryExhausted { attempts: retries });
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DataPosition {
    #[serde(default)]
    asset: String,
    #[serde(default)]
    size: f64,
}

/// Executes aggregated work items, one dispatch cycle at a time.
pub struct Executor<E: Exchange> {
    exchange: Arc<E>,
    store: Store,
    balances: Arc<BalanceCache>,
    ledger: Arc<PaperLedger>,
    fetcher: HttpFetcher,
    gate: Arc<DispatchGate>,
    data_api_url: String,
    bot_address: String,
    target_address: String,
    policy: SizingPolicy,
    trade_scale: f64,
    max_trade_amount: f64,
    max_price_diff: f64,
    retry_limit: u32,
    paper_mode: bool,
    fallback_interval: Duration,
}

impl<E: Exchange> Executor<E> {
    pub fn new(
        env: &Env,
        exchange: Arc<E>,
        store: Store,
        balances: Arc<BalanceCache>,
        ledger: Arc<PaperLedger>,
        gate: Arc<DispatchGate>,
    ) -> Result<Self> {
        Ok(Executor {
            exchange,
            store,
            balances,
            ledger,
            fetcher: HttpFetcher::new(env.request_timeout_ms, env.network_retry_limit)?,
            gate,
            data_api_url: env.data_api_url.trim_end_matches('/').to_string(),
            bot_address: env.bot_address.clone(),
            target_address: env.target_address.clone(),
            policy: env.sizing_policy,
            trade_scale: env.trade_scale,
            max_trade_amount: env.max_trade_amount,
            max_price_diff: env.max_price_diff,
            retry_limit: env.retry_limit,
            paper_mode: env.paper_mode,
            fallback_interval: Duration::from_secs(env.fetch_interval_secs.max(5)),
        })
    }

    /// Single-flight dispatch loop. A gate notification during a running
    /// cycle is absorbed into the next iteration; the fallback ticker
    /// catches records persisted while no notification was pending.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.fallback_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.gate.wait() => {}
                _ = ticker.tick() => {}
            }
            if !self.gate.try_begin() {
                continue;
            }
            if let Err(e) = self.run_cycle().await {
                warn!(error = %e, "dispatch cycle failed");
            }
            self.gate.end();
        }
    }

    async fn run_cycle(&self) -> Result<()> {
        let pending = self.store.pending_records(self.retry_limit).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let items = aggregate(pending);
        info!(items = items.len(), "dispatch cycle started");

        for item in items {
            match self.execute_item(&item).await {
                Ok(ExecOutcome::Filled { shares, usdc }) => {
                    info!(
                        market = %item.title,
                        side = %item.side,
                        shares,
                        usdc,
                        "work item filled"
                    );
                    self.store.mark_dispatched(&item.record_hashes).await?;
                }
                Ok(ExecOutcome::Skipped(reason)) => {
                    warn!(market = %item.title, side = %item.side, ?reason, "work item skipped");
                    self.store
                        .mark_skipped(&item.record_hashes, self.retry_limit)
                        .await?;
                }
                Ok(ExecOutcome::RetryExhausted { attempts }) => {
                    warn!(market = %item.title, side = %item.side, attempts, "retries exhausted");
                    self.store.mark_skipped(&item.record_hashes, attempts).await?;
                }
                Err(e) => {
                    // Transient; the records stay pending and are retried
                    // until the attempt budget runs out.
                    warn!(market = %item.title, error = %e, "work item errored");
                    self.store.bump_attempts(&item.record_hashes).await?;
                }
            }
        }
        Ok(())
    }

    async fn execute_item(&self, item: &WorkItem) -> Result<ExecOutcome> {
        let size = match item.side {
            Side::Buy => {
                if self.policy == SizingPolicy::PaperMatch {
                    OrderSize::Shares(item.size)
                } else {
                    let (bot, target) = if self.policy == SizingPolicy::Proportional {
                        (
                            self.balances.bot_balance().await?,
                            self.balances.target_balance().await?,
                        )
                    } else {
                        (0.0, 0.0)
                    };
                    let notional = sized_notional(
                        self.policy,
                        self.trade_scale,
                        self.max_trade_amount,
                        item.usdc_size,
                        bot,
                        target,
                    );
                    if notional < MIN_ORDER_USDC {
                        return Ok(ExecOutcome::Skipped(SkipReason::ZeroSized));
                    }
                    OrderSize::Notional(notional)
                }
            }
            Side::Sell => {
                let held = self.held_shares(item).await?;
                if held <= SHARE_EPSILON {
                    return Ok(ExecOutcome::Skipped(SkipReason::NoPosition));
                }
                let target_pre_trade = match self.target_pre_trade_shares(item).await {
                    Ok(shares) => Some(shares),
                    Err(e) => {
                        warn!(market = %item.title, error = %e, "target position lookup failed");
                        None
                    }
                };
                OrderSize::Shares(sized_sell_shares(
                    self.policy,
                    self.trade_scale,
                    held,
                    item.size,
                    target_pre_trade,
                ))
            }
            // MERGE closes out whatever the bot holds, regardless of the
            // target's size.
            Side::Merge => {
                let held = self.held_shares(item).await?;
                if held <= SHARE_EPSILON {
                    return Ok(ExecOutcome::Skipped(SkipReason::NoPosition));
                }
                OrderSize::Shares(held)
            }
        };

        let outcome = walk_book(
            self.exchange.as_ref(),
            item,
            size,
            self.max_price_diff,
            self.retry_limit,
            self.paper_mode,
        )
        .await?;

        if let ExecOutcome::Filled { shares, usdc } = outcome {
            if self.paper_mode {
                match item.side {
                    Side::Buy => self.ledger.record_buy(item, usdc, shares).await?,
                    Side::Sell | Side::Merge => {
                        let price = if shares > SHARE_EPSILON { usdc / shares } else { 0.0 };
                        self.ledger.record_sell(item, shares, price).await?;
                    }
                }
                let latency = chrono::Utc::now().timestamp() - item.timestamp;
                self.ledger.record_latency(latency as f64).await?;
            } else {
                self.balances.invalidate().await;
            }
        }
        Ok(outcome)
    }

    /// Shares of the item's outcome token the bot currently holds. Paper
    /// mode reads the ledger; live mode asks the data-api.
    async fn held_shares(&self, item: &WorkItem) -> Result<f64> {
        if self.paper_mode {
            return self.ledger.held_shares(item).await;
        }
        self.data_api_shares(&self.bot_address, item).await
    }

    /// The target's position before the copied sell. The ledger mirrors
    /// the pre-trade position (this sell is recorded only after
    /// execution); the data-api reports the post-trade remainder, so the
    /// sold size is added back.
    async fn target_pre_trade_shares(&self, item: &WorkItem) -> Result<f64> {
        if self.paper_mode {
            return self.ledger.target_held_shares(item).await;
        }
        let remaining = self.data_api_shares(&self.target_address, item).await?;
        Ok(remaining + item.size)
    }

    async fn data_api_shares(&self, user: &str, item: &WorkItem) -> Result<f64> {
        let url = format!(
            "{}/positions?user={}&market={}",
            self.data_api_url, user, item.condition_id
        );
        let positions: Vec<DataPosition> = self.fetcher.get_json(&url).await?;
        Ok(positions
            .iter()
            .filter(|p| p.asset == item.asset)
            .map(|p| p.size)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{BookLevel, MarketInfo, OrderBook, OrderResponse};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeExchange {
        books: Mutex<VecDeque<OrderBook>>,
        responses: Mutex<VecDeque<OrderResponse>>,
        posted: Mutex<Vec<OrderArgs>>,
    }

    impl FakeExchange {
        fn new(books: Vec<OrderBook>, responses: Vec<OrderResponse>) -> Self {
            FakeExchange {
                books: Mutex::new(books.into()),
                responses: Mutex::new(responses.into()),
                posted: Mutex::new(Vec::new()),
            }
        }

        fn posted_count(&self) -> usize {
            self.posted.lock().unwrap().len()
        }
    }

    impl Exchange for FakeExchange {
        async fn get_order_book(&self, _asset: &str) -> Result<OrderBook> {
            let mut books = self.books.lock().unwrap();
            if books.len() > 1 {
                Ok(books.pop_front().unwrap())
            } else {
                Ok(books.front().cloned().unwrap_or_default())
            }
        }

        async fn post_market_order(&self, args: &OrderArgs, _fok: bool) -> Result<OrderResponse> {
            self.posted.lock().unwrap().push(args.clone());
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.pop_front().unwrap_or_default())
        }

        async fn get_market(&self, _condition_id: &str) -> Result<MarketInfo> {
            unimplemented!("not used in these tests")
        }
    }

    fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBook {
        OrderBook {
            bids: bids.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
            asks: asks.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
        }
    }

    fn buy_item(price: f64) -> WorkItem {
        WorkItem {
            asset: "tok1".to_string(),
            side: Side::Buy,
            outcome: "Yes".to_string(),
            condition_id: "0xcond".to_string(),
            title: "Will it rain?".to_string(),
            size: 25.0,
            usdc_size: 25.0 * price,
            price,
            timestamp: 0,
            record_hashes: vec!["0xa".to_string()],
        }
    }

    fn ok() -> OrderResponse {
        OrderResponse { success: true, error: None }
    }

    fn rejected() -> OrderResponse {
        OrderResponse { success: false, error: Some("fok not filled".to_string()) }
    }

    #[test]
    fn sizing_truncates_at_the_cap() {
        let sized = sized_notional(SizingPolicy::Exact, 1.0, 10.0, 250.0, 0.0, 0.0);
        assert!((sized - 10.0).abs() < 1e-9);
    }

    #[test]
    fn sells_copy_the_targets_sold_fraction() {
        // Target sold 10 of a 40-share position; the bot holds 50, so
        // it sells the same quarter of its own position.
        let shares = sized_sell_shares(SizingPolicy::Exact, 1.0, 50.0, 10.0, Some(40.0));
        assert!((shares - 12.5).abs() < 1e-9);
    }

    #[test]
    fn sell_sizing_clamps_to_the_held_position() {
        // Target exits completely: the bot follows, but never oversells.
        let all = sized_sell_shares(SizingPolicy::Exact, 1.0, 50.0, 40.0, Some(40.0));
        assert!((all - 50.0).abs() < 1e-9);
        let scaled = sized_sell_shares(SizingPolicy::Exact, 3.0, 50.0, 10.0, Some(40.0));
        assert!((scaled - 37.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_target_position_falls_back_to_the_sold_size() {
        let shares = sized_sell_shares(SizingPolicy::Exact, 1.0, 50.0, 10.0, None);
        assert!((shares - 10.0).abs() < 1e-9);
        let untracked = sized_sell_shares(SizingPolicy::Exact, 1.0, 50.0, 10.0, Some(0.0));
        assert!((untracked - 10.0).abs() < 1e-9);
    }

    #[test]
    fn paper_match_sells_the_exact_share_count() {
        let shares = sized_sell_shares(SizingPolicy::PaperMatch, 2.0, 50.0, 10.0, Some(40.0));
        assert!((shares - 10.0).abs() < 1e-9);
    }

    #[test]
    fn proportional_sizing_scales_by_balance_ratio() {
        // Target spent 100 out of 1000, bot holds 50: copy 100 * 50/1000.
        let sized = sized_notional(SizingPolicy::Proportional, 1.0, 1000.0, 100.0, 50.0, 900.0);
        assert!((sized - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn drift_guard_posts_nothing() {
        let exchange = FakeExchange::new(vec![book(&[], &[(0.60, 100.0)])], vec![]);
        let outcome = walk_book(&exchange, &buy_item(0.40), OrderSize::Notional(10.0), 0.05, 3, false)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecOutcome::Skipped(SkipReason::PriceDrift { live: 0.60, target: 0.40 })
        );
        assert_eq!(exchange.posted_count(), 0);
    }

    #[tokio::test]
    async fn empty_book_is_skipped() {
        let exchange = FakeExchange::new(vec![book(&[], &[])], vec![]);
        let outcome = walk_book(&exchange, &buy_item(0.40), OrderSize::Notional(10.0), 0.05, 3, false)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Skipped(SkipReason::EmptyBook));
    }

    #[tokio::test]
    async fn paper_fill_takes_the_best_level_without_posting() {
        let exchange = FakeExchange::new(vec![book(&[], &[(0.40, 5.0)])], vec![]);
        let outcome = walk_book(&exchange, &buy_item(0.40), OrderSize::Notional(10.0), 0.05, 3, true)
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Filled { shares, usdc } => {
                assert!((shares - 25.0).abs() < 1e-9);
                assert!((usdc - 10.0).abs() < 1e-9);
            }
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(exchange.posted_count(), 0);
    }

    #[tokio::test]
    async fn buy_walks_multiple_levels() {
        // First level holds $4 of depth, the rest fills at 0.41.
        let exchange = FakeExchange::new(
            vec![book(&[], &[(0.40, 10.0)]), book(&[], &[(0.41, 50.0)])],
            vec![ok(), ok()],
        );
        let outcome = walk_book(&exchange, &buy_item(0.40), OrderSize::Notional(10.0), 0.05, 3, false)
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Filled { shares, usdc } => {
                assert!((usdc - 10.0).abs() < 1e-9);
                let expected_shares = 4.0 / 0.40 + 6.0 / 0.41;
                assert!((shares - expected_shares).abs() < 1e-9);
            }
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(exchange.posted_count(), 2);
    }

    #[tokio::test]
    async fn rejections_exhaust_the_retry_budget() {
        let exchange = FakeExchange::new(
            vec![book(&[], &[(0.40, 100.0)])],
            vec![rejected(), rejected(), rejected()],
        );
        let outcome = walk_book(&exchange, &buy_item(0.40), OrderSize::Notional(10.0), 0.05, 3, false)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::RetryExhausted { attempts: 3 });
        assert_eq!(exchange.posted_count(), 3);
    }

    #[tokio::test]
    async fn successful_order_resets_the_retry_counter() {
        // fail, fill, fail, fill with a retry limit of 2: never exhausts
        // because each success resets the counter.
        let exchange = FakeExchange::new(
            vec![
                book(&[], &[(0.40, 10.0)]),
                book(&[], &[(0.40, 10.0)]),
                book(&[], &[(0.41, 50.0)]),
                book(&[], &[(0.41, 50.0)]),
            ],
            vec![rejected(), ok(), rejected(), ok()],
        );
        let outcome = walk_book(&exchange, &buy_item(0.40), OrderSize::Notional(10.0), 0.05, 2, false)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecOutcome::Filled { .. }));
        assert_eq!(exchange.posted_count(), 4);
    }

    #[tokio::test]
    async fn sell_crosses_the_best_bid() {
        let mut item = buy_item(0.40);
        item.side = Side::Sell;
        let exchange = FakeExchange::new(vec![book(&[(0.39, 100.0)], &[])], vec![ok()]);
        let outcome = walk_book(&exchange, &item, OrderSize::Shares(10.0), 0.05, 3, false)
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Filled { shares, usdc } => {
                assert!((shares - 10.0).abs() < 1e-9);
                assert!((usdc - 3.9).abs() < 1e-9);
            }
            other => panic!("expected fill, got {other:?}"),
        }
        let posted = exchange.posted.lock().unwrap();
        assert!((posted[0].price - 0.39).abs() < 1e-9);
        assert!((posted[0].amount - 10.0).abs() < 1e-9);
    }
}
