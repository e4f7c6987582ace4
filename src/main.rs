use anyhow::Result;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use polymarket_mirror::config::{connect_db, load_env, Store};
use polymarket_mirror::exchange::ClobExchange;
use polymarket_mirror::rpc::chain_decoder::ChainDecoder;
use polymarket_mirror::rpc::chain_listener::ChainListener;
use polymarket_mirror::rpc::provider_pool::ProviderPool;
use polymarket_mirror::services::discovery::DiscoveryService;
use polymarket_mirror::services::executor::Executor;
use polymarket_mirror::services::ledger::{run_resolution, PaperLedger};
use polymarket_mirror::utils::balance_cache::BalanceCache;
use polymarket_mirror::utils::dispatch_gate::DispatchGate;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let env = Arc::new(load_env()?);

    println!();
    println!("{}", "Polymarket Mirror".cyan().bold());
    println!("   target:  {}", env.target_address.yellow());
    println!("   bot:     {}", env.bot_address.yellow());
    println!(
        "   mode:    {}",
        if env.paper_mode {
            "PAPER (no real orders)".green().bold()
        } else {
            "LIVE".red().bold()
        }
    );
    println!();

    let db = connect_db(&env.mongo_uri).await?;
    let store = Store::new(&db);
    store.ensure_indexes().await?;

    let pool = Arc::new(ProviderPool::new(
        env.rpc_urls.clone(),
        env.request_timeout_ms,
        env.provider_cooldown_secs,
    )?);
    let balances = Arc::new(BalanceCache::new(
        Arc::clone(&pool),
        &env.usdc_contract_address,
        &env.bot_address,
        &env.target_address,
        Duration::from_secs(env.balance_ttl_secs),
    ));
    report_balances(&balances).await;

    let exchange = Arc::new(ClobExchange::new(
        &env.clob_http_url,
        env.request_timeout_ms,
        env.network_retry_limit,
    )?);
    let gate = Arc::new(DispatchGate::new());
    let ledger = Arc::new(PaperLedger::new(store.clone()));

    let discovery = Arc::new(DiscoveryService::new(&env, store.clone(), Arc::clone(&gate))?);
    info!("starting trade discovery");
    tokio::spawn(Arc::clone(&discovery).run_rest());

    if env.chain_listen_enabled {
        info!("starting chain listener");
        let (tx, rx) = mpsc::channel(256);
        let listener = Arc::new(ChainListener::new(
            Arc::clone(&pool),
            ChainDecoder::new(&env.usdc_contract_address),
            &env.target_address,
            env.target_proxy.as_deref(),
            Duration::from_millis(env.block_poll_ms),
        ));
        tokio::spawn(listener.run(tx));
        tokio::spawn(Arc::clone(&discovery).run_chain(rx));
    }

    info!("starting executor");
    let executor = Arc::new(Executor::new(
        &env,
        Arc::clone(&exchange),
        store.clone(),
        Arc::clone(&balances),
        Arc::clone(&ledger),
        Arc::clone(&gate),
    )?);
    tokio::spawn(executor.run());

    if env.paper_mode {
        info!("starting market resolution sweep");
        tokio::spawn(run_resolution(
            Arc::clone(&ledger),
            Arc::clone(&exchange),
            env.resolve_interval_secs,
        ));
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("received SIGINT, shutting down"),
        Err(e) => warn!(error = %e, "unable to listen for shutdown signal"),
    }
    // Let in-flight cycles settle before the process exits.
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("shutdown complete");
    Ok(())
}

async fn report_balances(balances: &BalanceCache) {
    let bot = balances.bot_balance().await;
    let target = balances.target_balance().await;
    match (bot, target) {
        (Ok(bot), Ok(target)) => {
            let ratio = if target > 0.0 { bot / target } else { 0.0 };
            info!(
                bot_usdc = format!("{bot:.2}"),
                target_usdc = format!("{target:.2}"),
                ratio = format!("{ratio:.4}"),
                "startup balances"
            );
        }
        (bot, target) => {
            if let Err(e) = bot {
                warn!(error = %e, "bot balance fetch failed");
            }
            if let Err(e) = target {
                warn!(error = %e, "target balance fetch failed");
            }
        }
    }
}
