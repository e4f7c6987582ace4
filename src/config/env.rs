use anyhow::{Context, Result};
use regex::Regex;
use std::env;
use url::Url;

/// How a replicated order's size is derived from the target's trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingPolicy {
    /// Target notional times the scale factor.
    Exact,
    /// Target notional scaled by bot balance over target balance.
    Proportional,
    /// Copy the exact share count; paper mode only.
    PaperMatch,
}

#[derive(Debug, Clone)]
pub struct Env {
    pub target_address: String,
    pub target_proxy: Option<String>,
    pub bot_address: String,
    pub rpc_urls: Vec<String>,
    pub mongo_uri: String,
    pub clob_http_url: String,
    pub data_api_url: String,
    pub usdc_contract_address: String,
    pub fetch_interval_secs: u64,
    /// Staleness window for REST discovery, in minutes.
    pub too_old_minutes: i64,
    pub retry_limit: u32,
    pub network_retry_limit: u32,
    pub request_timeout_ms: u64,
    pub sizing_policy: SizingPolicy,
    pub trade_scale: f64,
    pub max_trade_amount: f64,
    pub max_price_diff: f64,
    pub title_filter: Option<String>,
    pub paper_mode: bool,
    pub chain_listen_enabled: bool,
    pub block_poll_ms: u64,
    pub provider_cooldown_secs: u64,
    pub resolve_interval_secs: u64,
    pub balance_ttl_secs: u64,
}

fn is_valid_ethereum_address(address: &str) -> bool {
    let re = Regex::new(r"^0x[a-fA-F0-9]{40}$").unwrap();
    re.is_match(address)
}

fn validate_required_env() -> Result<()> {
    let required = [
        "TARGET_ADDRESS",
        "BOT_ADDRESS",
        "RPC_URLS",
        "MONGO_URI",
        "CLOB_HTTP_URL",
        "USDC_CONTRACT_ADDRESS",
    ];

    let missing: Vec<&str> = required
        .iter()
        .filter(|key| env::var(key).is_err())
        .copied()
        .collect();

    if !missing.is_empty() {
        anyhow::bail!(
            "Missing required environment variables: {}",
            missing.join(", ")
        );
    }
    Ok(())
}

fn validate_address(name: &str, value: &str) -> Result<()> {
    if !is_valid_ethereum_address(value) {
        anyhow::bail!(
            "Invalid {name} address format: {value} (expected 0x followed by 40 hex characters)"
        );
    }
    Ok(())
}

fn parse_rpc_urls(input: &str) -> Result<Vec<String>> {
    let urls: Vec<String> = input
        .split(',')
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();

    if urls.is_empty() {
        anyhow::bail!("RPC_URLS must list at least one endpoint");
    }
    for url in &urls {
        let parsed = Url::parse(url).with_context(|| format!("Invalid RPC url: {url}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("Invalid RPC url {url}: must be http(s)");
        }
    }
    Ok(urls)
}

/// The allow-list filter supports an inline comment after '#'.
fn parse_title_filter(raw: &str) -> Option<String> {
    let filter = raw.split('#').next().unwrap_or("").trim();
    if filter.is_empty() {
        None
    } else {
        Some(filter.to_string())
    }
}

fn parse_sizing_policy(raw: &str, paper_mode: bool) -> Result<SizingPolicy> {
    let policy = match raw.to_uppercase().as_str() {
        "EXACT" => SizingPolicy::Exact,
        "PROPORTIONAL" | "" => SizingPolicy::Proportional,
        "PAPER_MATCH" => SizingPolicy::PaperMatch,
        other => anyhow::bail!(
            "Invalid SIZING_POLICY '{other}': expected EXACT, PROPORTIONAL or PAPER_MATCH"
        ),
    };
    if policy == SizingPolicy::PaperMatch && !paper_mode {
        anyhow::bail!("SIZING_POLICY=PAPER_MATCH requires DRY_RUN=true");
    }
    Ok(policy)
}

fn env_or<T: std::str::FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid {key}: {e}"))
}

pub fn load_env() -> Result<Env> {
    dotenvy::dotenv().ok();

    validate_required_env()?;

    let target_address = env::var("TARGET_ADDRESS")?.to_lowercase();
    validate_address("TARGET_ADDRESS", &target_address)?;

    let bot_address = env::var("BOT_ADDRESS")?.to_lowercase();
    validate_address("BOT_ADDRESS", &bot_address)?;

    let target_proxy = match env::var("TARGET_PROXY") {
        Ok(p) if !p.trim().is_empty() => {
            let p = p.to_lowercase();
            validate_address("TARGET_PROXY", &p)?;
            Some(p)
        }
        _ => None,
    };

    let usdc_contract_address = env::var("USDC_CONTRACT_ADDRESS")?;
    validate_address("USDC_CONTRACT_ADDRESS", &usdc_contract_address)?;

    let rpc_urls = parse_rpc_urls(&env::var("RPC_URLS")?)?;

    let mongo_uri = env::var("MONGO_URI")?;
    if !mongo_uri.starts_with("mongodb") {
        anyhow::bail!("Invalid MONGO_URI: must start with mongodb:// or mongodb+srv://");
    }

    let clob_http_url = env::var("CLOB_HTTP_URL")?;
    if !clob_http_url.starts_with("http") {
        anyhow::bail!("Invalid CLOB_HTTP_URL: must be a valid HTTP/HTTPS URL");
    }

    let retry_limit: u32 = env_or("RETRY_LIMIT", "3")?;
    if !(1..=10).contains(&retry_limit) {
        anyhow::bail!("Invalid RETRY_LIMIT: must be between 1 and 10");
    }

    let network_retry_limit: u32 = env_or("NETWORK_RETRY_LIMIT", "3")?;
    if !(1..=10).contains(&network_retry_limit) {
        anyhow::bail!("Invalid NETWORK_RETRY_LIMIT: must be between 1 and 10");
    }

    let request_timeout_ms: u64 = env_or("REQUEST_TIMEOUT_MS", "10000")?;
    if request_timeout_ms < 1000 {
        anyhow::bail!("Invalid REQUEST_TIMEOUT_MS: must be at least 1000ms");
    }

    let fetch_interval_secs: u64 = env_or("FETCH_INTERVAL", "1")?;
    if fetch_interval_secs == 0 {
        anyhow::bail!("Invalid FETCH_INTERVAL: must be positive");
    }

    let too_old_minutes: i64 = env_or("TOO_OLD_TIMESTAMP", "24")?;
    if too_old_minutes <= 0 {
        anyhow::bail!("Invalid TOO_OLD_TIMESTAMP: must be positive");
    }

    let max_price_diff: f64 = env_or("MAX_PRICE_DIFF", "0.05")?;
    if !(0.0..=1.0).contains(&max_price_diff) {
        anyhow::bail!("Invalid MAX_PRICE_DIFF: must be within [0, 1]");
    }

    let max_trade_amount: f64 = env_or("MAX_TRADE_AMOUNT", "10")?;
    if max_trade_amount <= 0.0 {
        anyhow::bail!("Invalid MAX_TRADE_AMOUNT: must be positive");
    }

    let paper_mode: bool = env_or("DRY_RUN", "true")?;
    let sizing_policy = parse_sizing_policy(
        &env::var("SIZING_POLICY").unwrap_or_default(),
        paper_mode,
    )?;

    Ok(Env {
        target_address,
        target_proxy,
        bot_address,
        rpc_urls,
        mongo_uri,
        clob_http_url,
        data_api_url: env::var("DATA_API_URL")
            .unwrap_or_else(|_| "https://data-api.polymarket.com".to_string()),
        usdc_contract_address,
        fetch_interval_secs,
        too_old_minutes,
        retry_limit,
        network_retry_limit,
        request_timeout_ms,
        sizing_policy,
        trade_scale: env_or("TRADE_SCALE", "1.0")?,
        max_trade_amount,
        max_price_diff,
        title_filter: env::var("TITLE_FILTER")
            .ok()
            .and_then(|raw| parse_title_filter(&raw)),
        paper_mode,
        chain_listen_enabled: env_or("CHAIN_LISTEN_ENABLED", "false")?,
        block_poll_ms: env_or("BLOCK_POLL_MS", "1000")?,
        provider_cooldown_secs: env_or("PROVIDER_COOLDOWN_SECS", "60")?,
        resolve_interval_secs: env_or("RESOLVE_INTERVAL_SECS", "60")?,
        balance_ttl_secs: env_or("BALANCE_TTL_SECS", "30")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(is_valid_ethereum_address(
            "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"
        ));
        assert!(!is_valid_ethereum_address("0x123"));
        assert!(!is_valid_ethereum_address("2791bca1f2de4661ed88a30c99a7a9449aa84174"));
    }

    #[test]
    fn rpc_url_list_parsing() {
        let urls = parse_rpc_urls("https://polygon-rpc.com, https://rpc.ankr.com/polygon ,").unwrap();
        assert_eq!(urls.len(), 2);
        assert!(parse_rpc_urls("").is_err());
        assert!(parse_rpc_urls("ftp://nope").is_err());
    }

    #[test]
    fn title_filter_strips_inline_comment() {
        assert_eq!(parse_title_filter("bitcoin # only BTC markets"), Some("bitcoin".to_string()));
        assert_eq!(parse_title_filter("   "), None);
        assert_eq!(parse_title_filter("# all commented out"), None);
    }

    #[test]
    fn paper_match_requires_paper_mode() {
        assert!(parse_sizing_policy("PAPER_MATCH", false).is_err());
        assert_eq!(
            parse_sizing_policy("paper_match", true).unwrap(),
            SizingPolicy::PaperMatch
        );
        assert_eq!(parse_sizing_policy("", false).unwrap(), SizingPolicy::Proportional);
    }
}
