use anyhow::Result;
use colored::Colorize;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOptions, IndexOptions, UpdateOptions};
use mongodb::{Client, Collection, Database, IndexModel};

use crate::interfaces::{DiscoveryRecord, PaperPosition, PaperStats};

const DISCOVERY_COLLECTION: &str = "discovery_records";
const POSITION_COLLECTION: &str = "paper_positions";
const STATS_COLLECTION: &str = "paper_stats";
const STATS_KEY: &str = "singleton";

pub async fn connect_db(mongo_uri: &str) -> Result<Database> {
    let client = Client::with_uri_str(mongo_uri).await?;
    let db = client.database("polymarket_mirror");
    println!("{} MongoDB connected", "✓".green());
    Ok(db)
}

/// Typed access to the three collections. Discovery records are keyed by
/// transactionHash, positions by (conditionId, outcome), stats is a
/// singleton document.
#[derive(Clone)]
pub struct Store {
    records: Collection<DiscoveryRecord>,
    positions: Collection<PaperPosition>,
    stats: Collection<mongodb::bson::Document>,
}

impl Store {
    pub fn new(db: &Database) -> Self {
        Store {
            records: db.collection(DISCOVERY_COLLECTION),
            positions: db.collection(POSITION_COLLECTION),
            stats: db.collection(STATS_COLLECTION),
        }
    }

    /// Unique keys backing the idempotent upserts. Run once at startup.
    pub async fn ensure_indexes(&self) -> Result<()> {
        self.records
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "transactionHash": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;
        self.positions
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "conditionId": 1, "outcome": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn record_by_hash(&self, transaction_hash: &str) -> Result<Option<DiscoveryRecord>> {
        let record = self
            .records
            .find_one(doc! { "transactionHash": transaction_hash }, None)
            .await?;
        Ok(record)
    }

    /// Atomic hash-keyed upsert: when two producers observe the same
    /// fill concurrently, only one document is created. Returns whether
    /// this call created it.
    pub async fn insert_record(&self, record: &DiscoveryRecord) -> Result<bool> {
        let (filter, update) = record_upsert(record)?;
        let result = self
            .records
            .update_one(
                filter,
                update,
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(result.upserted_id.is_some())
    }

    /// Records still eligible for execution: marked for copying, not yet
    /// dispatched, and below the retry limit. Oldest first so aggregation
    /// sees arrival order.
    pub async fn pending_records(&self, retry_limit: u32) -> Result<Vec<DiscoveryRecord>> {
        let filter = doc! {
            "copy": true,
            "dispatched": false,
            "attempts": { "$lt": retry_limit as i64 },
        };
        let options = FindOptions::builder()
            .sort(doc! { "timestamp": 1 })
            .build();
        let cursor = self.records.find(filter, options).await?;
        let records = cursor.try_collect().await?;
        Ok(records)
    }

    pub async fn mark_dispatched(&self, transaction_hashes: &[String]) -> Result<()> {
        if transaction_hashes.is_empty() {
            return Ok(());
        }
        self.records
            .update_many(
                doc! { "transactionHash": { "$in": transaction_hashes } },
                doc! { "$set": { "dispatched": true } },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn bump_attempts(&self, transaction_hashes: &[String]) -> Result<()> {
        if transaction_hashes.is_empty() {
            return Ok(());
        }
        self.records
            .update_many(
                doc! { "transactionHash": { "$in": transaction_hashes } },
                doc! { "$inc": { "attempts": 1 } },
                None,
            )
            .await?;
        Ok(())
    }

    /// Terminal skip: the record will never be retried again.
    pub async fn mark_skipped(&self, transaction_hashes: &[String], retry_limit: u32) -> Result<()> {
        if transaction_hashes.is_empty() {
            return Ok(());
        }
        self.records
            .update_many(
                doc! { "transactionHash": { "$in": transaction_hashes } },
                doc! { "$set": { "dispatched": true, "attempts": retry_limit as i64 } },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn find_position(
        &self,
        condition_id: &str,
        outcome: &str,
    ) -> Result<Option<PaperPosition>> {
        let position = self
            .positions
            .find_one(
                doc! { "conditionId": condition_id, "outcome": outcome },
                None,
            )
            .await?;
        Ok(position)
    }

    pub async fn upsert_position(&self, position: &PaperPosition) -> Result<()> {
        let replacement = mongodb::bson::to_document(position)?;
        self.positions
            .update_one(
                doc! { "conditionId": &position.condition_id, "outcome": &position.outcome },
                doc! { "$set": replacement },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    pub async fn open_positions(&self) -> Result<Vec<PaperPosition>> {
        let cursor = self
            .positions
            .find(doc! { "isClosed": false }, None)
            .await?;
        let positions = cursor.try_collect().await?;
        Ok(positions)
    }

    pub async fn load_stats(&self) -> Result<PaperStats> {
        let document = self.stats.find_one(doc! { "_id": STATS_KEY }, None).await?;
        match document {
            Some(mut d) => {
                d.remove("_id");
                Ok(mongodb::bson::from_document(d)?)
            }
            None => Ok(PaperStats::default()),
        }
    }

    pub async fn save_stats(&self, stats: &PaperStats) -> Result<()> {
        let document = mongodb::bson::to_document(stats)?;
        self.stats
            .update_one(
                doc! { "_id": STATS_KEY },
                doc! { "$set": document },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    /// Wipes all three collections. Used by the history-reset tool only.
    pub async fn reset_all(&self) -> Result<(u64, u64, u64)> {
        let records = self.records.delete_many(doc! {}, None).await?.deleted_count;
        let positions = self.positions.delete_many(doc! {}, None).await?.deleted_count;
        let stats = self.stats.delete_many(doc! {}, None).await?.deleted_count;
        Ok((records, positions, stats))
    }
}

/// Filter and update for the hash-keyed record upsert. `$setOnInsert`
/// leaves an existing document untouched, so a lost check-then-act race
/// between the REST and chain producers still yields a single record.
fn record_upsert(record: &DiscoveryRecord) -> Result<(Document, Document)> {
    let document = mongodb::bson::to_document(record)?;
    Ok((
        doc! { "transactionHash": &record.transaction_hash },
        doc! { "$setOnInsert": document },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{Side, TradeOrigin};

    fn record() -> DiscoveryRecord {
        DiscoveryRecord {
            transaction_hash: "0xabc".to_string(),
            condition_id: "0xcond".to_string(),
            asset: "tok1".to_string(),
            side: Side::Buy,
            outcome: "Yes".to_string(),
            size: 10.0,
            usdc_size: 4.0,
            price: 0.4,
            title: "Will it rain?".to_string(),
            timestamp: 100,
            origin: TradeOrigin::Rest,
            copy: true,
            attempts: 0,
            dispatched: false,
        }
    }

    #[test]
    fn record_upsert_is_keyed_by_hash_and_insert_only() {
        let (filter, update) = record_upsert(&record()).unwrap();
        assert_eq!(filter.get_str("transactionHash").unwrap(), "0xabc");
        assert_eq!(filter.len(), 1);

        // The whole document rides under $setOnInsert so a concurrent
        // duplicate writer cannot overwrite executor bookkeeping.
        let set_on_insert = update.get_document("$setOnInsert").unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(set_on_insert.get_str("transactionHash").unwrap(), "0xabc");
        assert_eq!(set_on_insert.get_f64("usdcSize").unwrap(), 4.0);
        assert_eq!(set_on_insert.get_bool("dispatched").unwrap(), false);
    }
}
