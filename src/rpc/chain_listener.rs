use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::interfaces::DecodedTrade;
use crate::rpc::chain_decoder::ChainDecoder;
use crate::rpc::provider_pool::ProviderPool;
use crate::utils::ttl_cache::TtlCache;

/// Watches new blocks through the provider pool and feeds decoded target
/// trades into the discovery pipeline over a channel.
///
/// Racing providers may report the same block more than once; the block
/// and tx-hash TTL caches make reprocessing idempotent instead of trying
/// to prevent the race (first provider to respond wins).
/// How far behind the tip a restarted or stalled poll loop will catch
/// up. Anything older is left to the REST discovery path.
const MAX_CATCHUP_BLOCKS: u64 = 5;

pub struct ChainListener {
    pool: Arc<ProviderPool>,
    decoder: ChainDecoder,
    target: String,
    proxy: Option<String>,
    block_cache: TtlCache,
    tx_cache: TtlCache,
    poll_interval: Duration,
    /// Next block to process; 0 until the first tip is observed.
    next_block: AtomicU64,
}

impl ChainListener {
    pub fn new(
        pool: Arc<ProviderPool>,
        decoder: ChainDecoder,
        target: &str,
        proxy: Option<&str>,
        poll_interval: Duration,
    ) -> Self {
        ChainListener {
            pool,
            decoder,
            target: target.to_lowercase(),
            proxy: proxy.map(|p| p.to_lowercase()),
            block_cache: TtlCache::new(Duration::from_secs(45)),
            tx_cache: TtlCache::new(Duration::from_secs(60)),
            poll_interval,
            next_block: AtomicU64::new(0),
        }
    }

    /// Long-running loop; block processing fans out to worker tasks so a
    /// slow receipt fetch never stalls block polling. Errors are logged
    /// and skipped, never fatal.
    pub async fn run(self: Arc<Self>, out: mpsc::Sender<DecodedTrade>) {
        info!(target_account = %self.target, "chain listener started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            let tip = match self.pool.block_number().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "block number fetch failed");
                    continue;
                }
            };
            // Blocks mined between polls are caught up, bounded so a
            // long stall cannot trigger an unbounded fetch burst.
            let start = catchup_start(self.next_block.load(Ordering::Acquire), tip);
            self.next_block.store(tip + 1, Ordering::Release);

            for number in start..=tip {
                if !self.block_cache.insert_if_absent(&number.to_string()) {
                    continue;
                }
                let listener = Arc::clone(&self);
                let out = out.clone();
                tokio::spawn(async move {
                    if let Err(e) = listener.process_block(number, out).await {
                        warn!(block = number, error = %e, "block processing failed");
                    }
                });
            }
        }
    }

    async fn process_block(
        &self,
        number: u64,
        out: mpsc::Sender<DecodedTrade>,
    ) -> anyhow::Result<()> {
        let block = self.pool.block_with_transactions(number).await?;
        let Some(txs) = block.get("transactions").and_then(|t| t.as_array()) else {
            return Ok(());
        };

        for tx in txs {
            if !self.touches_target(tx) {
                continue;
            }
            let Some(hash) = tx.get("hash").and_then(|h| h.as_str()) else {
                continue;
            };
            if !self.tx_cache.insert_if_absent(hash) {
                continue;
            }
            debug!(block = number, tx = hash, "target transaction observed on-chain");

            // Release the claim on a failed receipt fetch so the next
            // provider race (or the REST path) can pick the tx up again;
            // later txs in the block still get processed.
            let receipt = match self.pool.transaction_receipt(hash).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(tx = hash, error = %e, "receipt fetch failed");
                    self.tx_cache.remove(hash);
                    continue;
                }
            };
            if receipt.is_null() {
                continue;
            }
            if let Some(trade) = self
                .decoder
                .decode(&receipt, &self.target, self.proxy.as_deref())
            {
                info!(
                    tx = %trade.transaction_hash,
                    side = %trade.side,
                    size = trade.size,
                    price = trade.price,
                    "trade decoded from chain"
                );
                if out.send(trade).await.is_err() {
                    anyhow::bail!("discovery channel closed");
                }
            }
        }
        Ok(())
    }

    /// Direct from/to match, or the target address embedded in calldata
    /// (relayed meta-transactions route through an operator contract).
    fn touches_target(&self, tx: &Value) -> bool {
        let from = tx.get("from").and_then(|v| v.as_str()).unwrap_or_default();
        let to = tx.get("to").and_then(|v| v.as_str()).unwrap_or_default();
        for addr in [&self.target].into_iter().chain(self.proxy.as_ref()) {
            if from.eq_ignore_ascii_case(addr) || to.eq_ignore_ascii_case(addr) {
                return true;
            }
        }

        let input = tx.get("input").and_then(|v| v.as_str()).unwrap_or_default();
        if input.len() > 10 {
            let haystack = input.to_lowercase();
            let needle = self.target.trim_start_matches("0x");
            if haystack.contains(needle) {
                return true;
            }
            if let Some(proxy) = &self.proxy {
                if haystack.contains(proxy.trim_start_matches("0x")) {
                    return true;
                }
            }
        }
        false
    }
}

/// First block of the next poll sweep: the tip on a cold start, else
/// every not-yet-processed block up to `MAX_CATCHUP_BLOCKS` behind.
fn catchup_start(next: u64, tip: u64) -> u64 {
    if next == 0 || next > tip {
        return tip;
    }
    next.max(tip.saturating_sub(MAX_CATCHUP_BLOCKS - 1))
}
