use alloy::primitives::{keccak256, U256};
use chrono::Utc;
use serde_json::Value;

use crate::interfaces::{DecodedTrade, Side};

/// Share tokens and USDC both use 6 decimals on Polygon.
const UNIT: f64 = 1_000_000.0;

/// Extracts a trade from a transaction receipt by correlating ERC-1155
/// share transfers and USDC transfers against the target's addresses.
///
/// Detection inspects transfer participants rather than the top-level
/// transaction sender, so relayed meta-transactions are caught too.
/// Event signatures are computed once at construction.
pub struct ChainDecoder {
    sig_transfer_single: String,
    sig_transfer_batch: String,
    sig_erc20_transfer: String,
    usdc_contract: String,
}

struct AssetFlow {
    id: String,
    total: U256,
    side: Side,
}

impl ChainDecoder {
    pub fn new(usdc_contract: &str) -> Self {
        ChainDecoder {
            sig_transfer_single: topic_hash(
                b"TransferSingle(address,address,address,uint256,uint256)",
            ),
            sig_transfer_batch: topic_hash(
                b"TransferBatch(address,address,address,uint256[],uint256[])",
            ),
            sig_erc20_transfer: topic_hash(b"Transfer(address,address,uint256)"),
            usdc_contract: usdc_contract.to_lowercase(),
        }
    }

    /// Returns `None` when no qualifying transfer involves the target or
    /// its proxy. Logs from unrelated contracts in the same transaction
    /// are ignored by signature mismatch.
    pub fn decode(
        &self,
        receipt: &Value,
        target_address: &str,
        proxy_address: Option<&str>,
    ) -> Option<DecodedTrade> {
        let tx_hash = receipt.get("transactionHash")?.as_str()?.to_string();
        let target = target_address.to_lowercase();
        let proxy = proxy_address.map(|p| p.to_lowercase());

        let mut flows: Vec<AssetFlow> = Vec::new();
        let mut total_usdc = U256::ZERO;

        for log in receipt.get("logs")?.as_array()? {
            let topics: Vec<&str> = log
                .get("topics")
                .and_then(|t| t.as_array())
                .map(|t| t.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();
            let Some(&topic0) = topics.first() else {
                continue;
            };
            let data = log.get("data").and_then(|d| d.as_str()).unwrap_or("0x");

            if topic0.eq_ignore_ascii_case(&self.sig_transfer_single) && topics.len() >= 4 {
                let from = topic_address(topics[2]);
                let to = topic_address(topics[3]);
                if let (Some(id), Some(value)) = (data_word(data, 0), data_word(data, 1)) {
                    record_flow(&mut flows, &id.to_string(), value, &from, &to, &target, proxy.as_deref());
                }
            } else if topic0.eq_ignore_ascii_case(&self.sig_transfer_batch) && topics.len() >= 4 {
                let from = topic_address(topics[2]);
                let to = topic_address(topics[3]);
                for (id, value) in decode_batch(data) {
                    record_flow(&mut flows, &id.to_string(), value, &from, &to, &target, proxy.as_deref());
                }
            } else if topic0.eq_ignore_ascii_case(&self.sig_erc20_transfer) && topics.len() >= 3 {
                let address = log
                    .get("address")
                    .and_then(|a| a.as_str())
                    .unwrap_or_default()
                    .to_lowercase();
                if address != self.usdc_contract {
                    continue;
                }
                let from = topic_address(topics[1]);
                let to = topic_address(topics[2]);
                if involves(&from, &target, proxy.as_deref()) || involves(&to, &target, proxy.as_deref()) {
                    if let Some(value) = data_word(data, 0) {
                        total_usdc += value;
                    }
                }
            }
        }

        // Largest net share movement wins; ties break to first-seen,
        // so only a strictly greater total displaces the candidate.
        let mut best: Option<&AssetFlow> = None;
        for flow in &flows {
            if best.map(|b| flow.total > b.total).unwrap_or(true) {
                best = Some(flow);
            }
        }
        let best = best?;
        if best.total.is_zero() {
            return None;
        }

        let size = best.total.saturating_to::<u128>() as f64 / UNIT;
        let usdc = total_usdc.saturating_to::<u128>() as f64 / UNIT;
        let mut price = if size > 0.0 { usdc / size } else { 0.0 };
        // Outside [0, 1] means we mis-attributed a transfer; force 0
        // instead of aborting so the record stays auditable.
        if !(0.0..=1.0).contains(&price) {
            price = 0.0;
        }

        Some(DecodedTrade {
            transaction_hash: tx_hash,
            side: best.side,
            asset: best.id.clone(),
            size,
            usdc_size: usdc,
            price,
            timestamp: Utc::now().timestamp(),
        })
    }
}

fn record_flow(
    flows: &mut Vec<AssetFlow>,
    id: &str,
    value: U256,
    from: &str,
    to: &str,
    target: &str,
    proxy: Option<&str>,
) {
    let side = if involves(to, target, proxy) {
        Side::Buy
    } else if involves(from, target, proxy) {
        Side::Sell
    } else {
        return;
    };

    match flows.iter_mut().find(|f| f.id == id) {
        Some(flow) => {
            flow.total += value;
            flow.side = side;
        }
        None => flows.push(AssetFlow {
            id: id.to_string(),
            total: value,
            side,
        }),
    }
}

fn involves(address: &str, target: &str, proxy: Option<&str>) -> bool {
    address == target || proxy.map(|p| address == p).unwrap_or(false)
}

fn topic_hash(signature: &[u8]) -> String {
    format!("0x{}", hex::encode(keccak256(signature)))
}

/// Indexed address topics are left-padded to 32 bytes.
fn topic_address(topic: &str) -> String {
    let stripped = topic.trim_start_matches("0x");
    if stripped.len() < 40 {
        return String::new();
    }
    format!("0x{}", &stripped[stripped.len() - 40..]).to_lowercase()
}

/// Reads the `index`-th 32-byte word of a log's data field.
fn data_word(data: &str, index: usize) -> Option<U256> {
    let stripped = data.trim_start_matches("0x");
    let start = index * 64;
    let end = start + 64;
    if stripped.len() < end {
        return None;
    }
    U256::from_str_radix(&stripped[start..end], 16).ok()
}

/// Decodes the two dynamic uint256 arrays of a TransferBatch payload
/// (ids, values), zipped. Malformed data yields an empty vec.
fn decode_batch(data: &str) -> Vec<(U256, U256)> {
    let Some(ids_offset) = data_word(data, 0) else {
        return Vec::new();
    };
    let Some(values_offset) = data_word(data, 1) else {
        return Vec::new();
    };
    let ids = decode_array(data, ids_offset.saturating_to::<usize>());
    let values = decode_array(data, values_offset.saturating_to::<usize>());
    ids.into_iter().zip(values).collect()
}

fn decode_array(data: &str, byte_offset: usize) -> Vec<U256> {
    let word_offset = byte_offset / 32;
    let Some(len) = data_word(data, word_offset) else {
        return Vec::new();
    };
    let len = len.saturating_to::<usize>().min(1024);
    (0..len)
        .filter_map(|i| data_word(data, word_offset + 1 + i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const USDC: &str = "0x2791bca1f2de4661ed88a30c99a7a9449aa84174";
    const TARGET: &str = "0x1111111111111111111111111111111111111111";
    const PROXY: &str = "0x2222222222222222222222222222222222222222";
    const OTHER: &str = "0x3333333333333333333333333333333333333333";

    fn addr_topic(addr: &str) -> String {
        format!("0x{:0>64}", addr.trim_start_matches("0x"))
    }

    fn word(value: u128) -> String {
        format!("{value:064x}")
    }

    fn single_log(decoder: &ChainDecoder, from: &str, to: &str, id: u128, value: u128) -> Value {
        json!({
            "address": "0x4d97dcd97ec945f40cf65f87097ace5ea0476045",
            "topics": [
                decoder.sig_transfer_single.clone(),
                addr_topic(OTHER),
                addr_topic(from),
                addr_topic(to),
            ],
            "data": format!("0x{}{}", word(id), word(value)),
        })
    }

    fn usdc_log(decoder: &ChainDecoder, from: &str, to: &str, value: u128) -> Value {
        json!({
            "address": USDC,
            "topics": [
                decoder.sig_erc20_transfer.clone(),
                addr_topic(from),
                addr_topic(to),
            ],
            "data": format!("0x{}", word(value)),
        })
    }

    fn receipt(logs: Vec<Value>) -> Value {
        json!({ "transactionHash": "0xfeed", "logs": logs })
    }

    #[test]
    fn buy_with_implied_price() {
        let decoder = ChainDecoder::new(USDC);
        // Target receives 10 shares and pays 4 USDC: price 0.40.
        let rcpt = receipt(vec![
            single_log(&decoder, OTHER, TARGET, 7, 10_000_000),
            usdc_log(&decoder, TARGET, OTHER, 4_000_000),
        ]);
        let trade = decoder.decode(&rcpt, TARGET, Some(PROXY)).unwrap();
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.asset, "7");
        assert!((trade.size - 10.0).abs() < 1e-9);
        assert!((trade.price - 0.40).abs() < 1e-9);
        assert_eq!(trade.transaction_hash, "0xfeed");
    }

    #[test]
    fn sell_detected_via_proxy_participant() {
        let decoder = ChainDecoder::new(USDC);
        let rcpt = receipt(vec![
            single_log(&decoder, PROXY, OTHER, 9, 5_000_000),
            usdc_log(&decoder, OTHER, PROXY, 3_000_000),
        ]);
        let trade = decoder.decode(&rcpt, TARGET, Some(PROXY)).unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert!((trade.price - 0.60).abs() < 1e-9);
    }

    #[test]
    fn price_outside_unit_interval_is_forced_to_zero() {
        let decoder = ChainDecoder::new(USDC);
        // 1 share against 5 USDC: implied price 5.0 is a decode error.
        let rcpt = receipt(vec![
            single_log(&decoder, OTHER, TARGET, 7, 1_000_000),
            usdc_log(&decoder, TARGET, OTHER, 5_000_000),
        ]);
        let trade = decoder.decode(&rcpt, TARGET, None).unwrap();
        assert_eq!(trade.price, 0.0);
    }

    #[test]
    fn largest_movement_picks_the_traded_asset() {
        let decoder = ChainDecoder::new(USDC);
        let rcpt = receipt(vec![
            single_log(&decoder, OTHER, TARGET, 1, 2_000_000),
            single_log(&decoder, OTHER, TARGET, 2, 9_000_000),
        ]);
        let trade = decoder.decode(&rcpt, TARGET, None).unwrap();
        assert_eq!(trade.asset, "2");
    }

    #[test]
    fn unrelated_transfers_yield_none() {
        let decoder = ChainDecoder::new(USDC);
        let rcpt = receipt(vec![single_log(&decoder, OTHER, PROXY, 7, 1_000_000)]);
        assert!(decoder.decode(&rcpt, TARGET, None).is_none());
    }

    #[test]
    fn batch_transfer_accumulates_per_id() {
        let decoder = ChainDecoder::new(USDC);
        // ids [7, 8], values [3, 4] shares, both to the target.
        let data = format!(
            "0x{}{}{}{}{}{}{}{}",
            word(0x40),
            word(0xa0),
            word(2),
            word(7),
            word(8),
            word(2),
            word(3_000_000),
            word(4_000_000),
        );
        let batch = json!({
            "address": "0x4d97dcd97ec945f40cf65f87097ace5ea0476045",
            "topics": [
                decoder.sig_transfer_batch.clone(),
                addr_topic(OTHER),
                addr_topic(OTHER),
                addr_topic(TARGET),
            ],
            "data": data,
        });
        let trade = decoder.decode(&receipt(vec![batch]), TARGET, None).unwrap();
        assert_eq!(trade.asset, "8");
        assert!((trade.size - 4.0).abs() < 1e-9);
    }
}
