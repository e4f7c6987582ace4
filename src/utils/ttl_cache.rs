use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time-boxed seen-set used to deduplicate blocks and transaction hashes
/// when racing providers deliver overlapping notifications. Losing an
/// entry on restart is safe; the persistent store is the real dedup.
pub struct TtlCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records `key` and reports whether it was absent (or expired).
    /// Returns false when the key was already seen within the TTL.
    pub fn insert_if_absent(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
        match entries.get(key) {
            Some(_) => false,
            None => {
                entries.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forgets `key` so a later `insert_if_absent` claims it again.
    /// Used when processing a claimed entry fails and must be retried.
    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_wins_second_is_rejected() {
        let cache = TtlCache::new(Duration::from_secs(60));
        assert!(cache.insert_if_absent("0xabc"));
        assert!(!cache.insert_if_absent("0xabc"));
        assert!(cache.insert_if_absent("0xdef"));
    }

    #[test]
    fn removed_entry_can_be_claimed_again() {
        let cache = TtlCache::new(Duration::from_secs(60));
        assert!(cache.insert_if_absent("0xabc"));
        cache.remove("0xabc");
        assert!(cache.insert_if_absent("0xabc"));
    }

    #[test]
    fn expired_entries_are_pruned_and_reinsertable() {
        let cache = TtlCache::new(Duration::from_millis(5));
        assert!(cache.insert_if_absent("block-100"));
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.insert_if_absent("block-100"));
        assert_eq!(cache.len(), 1);
    }
}
