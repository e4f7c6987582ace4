use std::collections::HashMap;

use crate::interfaces::{DiscoveryRecord, WorkItem};

/// Merges pending records that share (asset, side, outcome) into one
/// work item per group. Records are folded oldest-first; the merged
/// price is the volume-weighted average of the constituents.
pub fn aggregate(mut records: Vec<DiscoveryRecord>) -> Vec<WorkItem> {
    records.sort_by_key(|r| r.timestamp);

    let mut items: Vec<WorkItem> = Vec::new();
    let mut index: HashMap<(String, &'static str, String), usize> = HashMap::new();

    for record in records {
        let key = (
            record.asset.clone(),
            record.side.as_str(),
            record.outcome.to_lowercase(),
        );
        match index.get(&key) {
            Some(&i) => {
                let item = &mut items[i];
                item.size += record.size;
                item.usdc_size += record.usdc_size;
                item.timestamp = item.timestamp.max(record.timestamp);
                if item.title.is_empty() {
                    item.title = record.title;
                }
                if item.condition_id.is_empty() {
                    item.condition_id = record.condition_id;
                }
                item.record_hashes.push(record.transaction_hash);
            }
            None => {
                index.insert(key, items.len());
                items.push(WorkItem {
                    asset: record.asset,
                    side: record.side,
                    outcome: record.outcome,
                    condition_id: record.condition_id,
                    title: record.title,
                    size: record.size,
                    usdc_size: record.usdc_size,
                    price: record.price,
                    timestamp: record.timestamp,
                    record_hashes: vec![record.transaction_hash],
                });
            }
        }
    }

    for item in &mut items {
        if item.size > 0.0 {
            item.price = item.usdc_size / item.size;
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{Side, TradeOrigin};

    fn record(hash: &str, asset: &str, side: Side, size: f64, usdc: f64, ts: i64) -> DiscoveryRecord {
        DiscoveryRecord {
            transaction_hash: hash.to_string(),
            condition_id: "0xcond".to_string(),
            asset: asset.to_string(),
            side,
            outcome: "Yes".to_string(),
            size,
            usdc_size: usdc,
            price: if size > 0.0 { usdc / size } else { 0.0 },
            title: "Will it rain?".to_string(),
            timestamp: ts,
            origin: TradeOrigin::Rest,
            copy: true,
            attempts: 0,
            dispatched: false,
        }
    }

    #[test]
    fn merges_same_group_with_vwap() {
        let items = aggregate(vec![
            record("0xa", "tok1", Side::Buy, 10.0, 4.0, 100),
            record("0xb", "tok1", Side::Buy, 5.0, 3.5, 200),
        ]);
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert!((item.size - 15.0).abs() < 1e-9);
        assert!((item.usdc_size - 7.5).abs() < 1e-9);
        assert!((item.price - 0.5).abs() < 1e-9);
        assert_eq!(item.timestamp, 200);
        assert_eq!(item.record_hashes, vec!["0xa", "0xb"]);
    }

    #[test]
    fn different_sides_stay_separate() {
        let items = aggregate(vec![
            record("0xa", "tok1", Side::Buy, 10.0, 4.0, 100),
            record("0xb", "tok1", Side::Sell, 10.0, 4.0, 150),
        ]);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn single_record_passes_through() {
        let items = aggregate(vec![record("0xa", "tok1", Side::Buy, 10.0, 4.0, 100)]);
        assert_eq!(items.len(), 1);
        assert!((items[0].price - 0.4).abs() < 1e-9);
        assert_eq!(items[0].record_hashes, vec!["0xa"]);
    }

    #[test]
    fn folds_oldest_first_regardless_of_input_order() {
        let mut older = record("0xold", "tok1", Side::Buy, 10.0, 4.0, 100);
        older.title = "Will it rain?".to_string();
        let mut newer = record("0xnew", "tok1", Side::Buy, 5.0, 3.5, 200);
        newer.title = String::new();
        let items = aggregate(vec![newer, older]);
        assert_eq!(items[0].record_hashes, vec!["0xold", "0xnew"]);
        assert_eq!(items[0].title, "Will it rain?");
    }
}
