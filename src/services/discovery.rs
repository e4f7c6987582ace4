use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Env, Store};
use crate::interfaces::{ActivityEntry, DecodedTrade, DiscoveryRecord, TradeOrigin};
use crate::utils::dispatch_gate::DispatchGate;
use crate::utils::fetch_data::HttpFetcher;

const PAGE_SIZE: usize = 100;

/// Whether a trade should be replicated under the title allow-list.
/// With no filter everything copies; with one, the title must contain
/// the filter case-insensitively. An unresolvable title under an active
/// filter is conservatively not copied.
pub fn should_copy(title_filter: Option<&str>, title: &str) -> bool {
    match title_filter {
        None => true,
        Some(filter) => {
            !title.is_empty() && title.to_lowercase().contains(&filter.to_lowercase())
        }
    }
}

/// Watches the target account through the data-api activity feed and,
/// optionally, decoded chain events. Both producers funnel into the
/// same hash-deduplicated persistence path.
pub struct DiscoveryService {
    store: Store,
    fetcher: HttpFetcher,
    gate: Arc<DispatchGate>,
    data_api_url: String,
    target_address: String,
    fetch_interval: Duration,
    too_old_minutes: i64,
    title_filter: Option<String>,
}

impl DiscoveryService {
    pub fn new(env: &Env, store: Store, gate: Arc<DispatchGate>) -> Result<Self> {
        Ok(DiscoveryService {
            store,
            fetcher: HttpFetcher::new(env.request_timeout_ms, env.network_retry_limit)?,
            gate,
            data_api_url: env.data_api_url.trim_end_matches('/').to_string(),
            target_address: env.target_address.clone(),
            fetch_interval: Duration::from_secs(env.fetch_interval_secs),
            too_old_minutes: env.too_old_minutes,
            title_filter: env.title_filter.clone(),
        })
    }

    /// REST producer loop. Poll failures are logged and the next tick
    /// tries again.
    pub async fn run_rest(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.fetch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_activity().await {
                warn!(error = %e, "activity poll failed");
            }
        }
    }

    /// Chain producer loop: drains decoded trades from the listener.
    pub async fn run_chain(self: Arc<Self>, mut rx: mpsc::Receiver<DecodedTrade>) {
        while let Some(trade) = rx.recv().await {
            if let Err(e) = self.ingest_chain(trade).await {
                warn!(error = %e, "chain trade ingest failed");
            }
        }
    }

    /// Pages the activity feed newest-first and stops once entries fall
    /// outside the staleness window or a short page signals end-of-data.
    async fn poll_activity(&self) -> Result<()> {
        let cutoff = chrono::Utc::now().timestamp() - self.too_old_minutes * 60;
        let mut offset = 0usize;

        loop {
            let url = format!(
                "{}/activity?user={}&limit={}&offset={}&type=TRADE",
                self.data_api_url, self.target_address, PAGE_SIZE, offset
            );
            let page: Vec<ActivityEntry> = self.fetcher.get_json(&url).await?;
            let page_len = page.len();
            let mut saw_stale = false;

            for entry in page {
                if entry.timestamp < cutoff {
                    saw_stale = true;
                    continue;
                }
                self.ingest_activity(entry).await?;
            }

            if saw_stale || page_len < PAGE_SIZE {
                return Ok(());
            }
            offset += PAGE_SIZE;
        }
    }

    async fn ingest_activity(&self, entry: ActivityEntry) -> Result<()> {
        let Some(side) = entry.effective_side() else {
            debug!(activity_type = %entry.activity_type, "ignoring non-trade activity");
            return Ok(());
        };
        if entry.transaction_hash.is_empty() {
            return Ok(());
        }
        if self.store.record_by_hash(&entry.transaction_hash).await?.is_some() {
            return Ok(());
        }

        let copy = should_copy(self.title_filter.as_deref(), &entry.title);
        let record = DiscoveryRecord {
            transaction_hash: entry.transaction_hash,
            condition_id: entry.condition_id,
            asset: entry.asset,
            side,
            outcome: entry.outcome,
            size: entry.size,
            usdc_size: entry.usdc_size,
            price: entry.price,
            title: entry.title,
            timestamp: entry.timestamp,
            origin: TradeOrigin::Rest,
            copy,
            attempts: 0,
            dispatched: false,
        };
        self.persist(record).await
    }

    /// Chain-decoded trades carry no market metadata; with an active
    /// title filter they cannot be matched and are kept only as an
    /// audit record.
    async fn ingest_chain(&self, trade: DecodedTrade) -> Result<()> {
        if self.store.record_by_hash(&trade.transaction_hash).await?.is_some() {
            return Ok(());
        }

        let copy = self.title_filter.is_none();
        let record = DiscoveryRecord {
            transaction_hash: trade.transaction_hash,
            condition_id: String::new(),
            asset: trade.asset,
            side: trade.side,
            outcome: String::new(),
            size: trade.size,
            usdc_size: trade.usdc_size,
            price: trade.price,
            title: String::new(),
            timestamp: trade.timestamp,
            origin: TradeOrigin::Chain,
            copy,
            attempts: 0,
            dispatched: false,
        };
        self.persist(record).await
    }

    /// The find-by-hash in the ingest paths is only a fast path; the
    /// upsert is what actually guarantees one record per hash when both
    /// producers observe the same fill concurrently.
    async fn persist(&self, record: DiscoveryRecord) -> Result<()> {
        if !self.store.insert_record(&record).await? {
            debug!(tx = %record.transaction_hash, origin = %record.origin, "duplicate discovery suppressed");
            return Ok(());
        }
        info!(
            tx = %record.transaction_hash,
            side = %record.side,
            usdc = record.usdc_size,
            origin = %record.origin,
            copy = record.copy,
            market = %record.title,
            "trade discovered"
        );
        if record.copy {
            self.gate.notify();
        }
        Ok(())
    }
}
