use std::{collections::HashMap, time::Duration};

use parking_lot::RwLock;

use crate::core::{crypto::MsSinceEpoch, guard::TtlCache};

/// Counters that expire on their own, keyed by string.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (u64, MsSinceEpoch)>>,
}

impl TtlCache for MemoryCache {
    fn get(&self, key: &str, now: MsSinceEpoch) -> Option<u64> {
        self.entries
            .read()
            .get(key)
            .filter(|(_, expires)| now < *expires)
            .map(|(value, _)| *value)
    }

    fn put(&self, key: &str, value: u64, ttl: Duration, now: MsSinceEpoch) {
        let mut entries = self.entries.write();
        entries.retain(|_, (_, expires)| now < *expires);
        entries.insert(key.to_string(), (value, now.after(ttl)));
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::core::{crypto::MsSinceEpoch, guard::TtlCache};

    use super::MemoryCache;

    #[test]
    pub fn test_entries_expire() {
        let cache = MemoryCache::default();
        cache.put("k", 3, Duration::from_secs(10), MsSinceEpoch::from_seconds(0));
        assert_eq!(cache.get("k", MsSinceEpoch::from_seconds(9)), Some(3));
        assert_eq!(cache.get("k", MsSinceEpoch::from_seconds(10)), None);

        cache.put("k", 4, Duration::from_secs(10), MsSinceEpoch::from_seconds(5));
        cache.remove("k");
        assert_eq!(cache.get("k", MsSinceEpoch::from_seconds(6)), None);
    }
}
