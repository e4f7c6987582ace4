use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::rpc::provider_pool::ProviderPool;

struct CachedBalance {
    value: f64,
    fetched_at: Instant,
}

/// Caches on-chain USDC balances for the bot and target wallets so the
/// executor does not pay a balance fetch per sizing decision. Entries
/// refresh on TTL expiry or explicit invalidation after a fill.
pub struct BalanceCache {
    pool: Arc<ProviderPool>,
    usdc_contract: String,
    bot_address: String,
    target_address: String,
    ttl: Duration,
    bot: Mutex<Option<CachedBalance>>,
    target: Mutex<Option<CachedBalance>>,
}

impl BalanceCache {
    pub fn new(
        pool: Arc<ProviderPool>,
        usdc_contract: &str,
        bot_address: &str,
        target_address: &str,
        ttl: Duration,
    ) -> Self {
        BalanceCache {
            pool,
            usdc_contract: usdc_contract.to_string(),
            bot_address: bot_address.to_string(),
            target_address: target_address.to_string(),
            ttl,
            bot: Mutex::new(None),
            target: Mutex::new(None),
        }
    }

    pub async fn bot_balance(&self) -> anyhow::Result<f64> {
        self.cached(&self.bot, &self.bot_address).await
    }

    pub async fn target_balance(&self) -> anyhow::Result<f64> {
        self.cached(&self.target, &self.target_address).await
    }

    /// Drops both entries; the next read refetches. Called after fills.
    pub async fn invalidate(&self) {
        *self.bot.lock().await = None;
        *self.target.lock().await = None;
    }

    async fn cached(&self, slot: &Mutex<Option<CachedBalance>>, address: &str) -> anyhow::Result<f64> {
        let mut guard = slot.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.value);
            }
        }
        let value = self
            .pool
            .usdc_balance_of(&self.usdc_contract, address)
            .await?;
        debug!(address, balance = value, "balance refreshed");
        *guard = Some(CachedBalance {
            value,
            fetched_at: Instant::now(),
        });
        Ok(value)
    }
}
