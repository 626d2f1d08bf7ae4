//! Key/value store with distance-weighted expiry.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::common::Id;

/// Default expiry, in units, of a key at distance 0 from the local Id.
pub const DEFAULT_MAX_EXPIRY: u64 = 48;
/// Default expiry unit.
pub const DEFAULT_EXPIRY_UNIT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredEntry {
    value: String,
    expires_at: SystemTime,
}

/// Values stored at this node, keyed by Ids.
///
/// Expired entries are evicted when read, there is no background sweep.
#[derive(Debug, Clone)]
pub struct Store {
    id: Id,
    max_expiry: u64,
    expiry_unit: Duration,
    entries: HashMap<Id, StoredEntry>,
}

impl Store {
    pub fn new(id: Id) -> Self {
        Store {
            id,
            max_expiry: DEFAULT_MAX_EXPIRY,
            expiry_unit: DEFAULT_EXPIRY_UNIT,
            entries: HashMap::new(),
        }
    }

    // === Options ===

    pub fn with_max_expiry(mut self, max_expiry: u64) -> Self {
        self.max_expiry = max_expiry;
        self
    }

    pub fn with_expiry_unit(mut self, expiry_unit: Duration) -> Self {
        self.expiry_unit = expiry_unit;
        self
    }

    // === Public Methods ===

    /// Insert or refresh a value, returns `true` if the key already held this exact value.
    ///
    /// Expiry is recomputed either way.
    pub fn put(&mut self, key: Id, value: String) -> bool {
        let units = self.calculate_expiry(&key);
        let expires_at = SystemTime::now() + self.unit_duration(units);

        let existed = self
            .entries
            .get(&key)
            .map(|entry| entry.value == value)
            .unwrap_or(false);

        self.entries.insert(key, StoredEntry { value, expires_at });

        existed
    }

    /// Returns the value for `key` if it hasn't expired, evicting it otherwise.
    pub fn get(&mut self, key: &Id) -> Option<String> {
        let entry = self.entries.get(key)?;

        if entry.expires_at > SystemTime::now() {
            return Some(entry.value.clone());
        }

        self.entries.remove(key);
        None
    }

    /// Number of expiry units a key is retained for.
    ///
    /// `max_expiry - distance / bits * max_expiry + 1`, at least 1: keys closer
    /// to the local Id are kept longer.
    pub fn calculate_expiry(&self, key: &Id) -> u64 {
        calculate_expiry(&self.id, key, self.max_expiry)
    }

    /// Number of entries, including expired ones not read yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Id> {
        self.entries.keys()
    }

    /// Iterate over entries that haven't expired, with their expiry time.
    pub fn live_entries(&self) -> impl Iterator<Item = (&Id, &str, SystemTime)> {
        let now = SystemTime::now();

        self.entries
            .iter()
            .filter(move |(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| (key, entry.value.as_str(), entry.expires_at))
    }

    /// Insert an entry with a known expiry time, used to restore snapshots.
    pub(crate) fn restore(&mut self, key: Id, value: String, expires_at: SystemTime) {
        self.entries.insert(key, StoredEntry { value, expires_at });
    }

    // === Private Methods ===

    fn unit_duration(&self, units: u64) -> Duration {
        self.expiry_unit
            .saturating_mul(units.min(u32::MAX as u64) as u32)
    }
}

/// See [Store::calculate_expiry].
pub fn calculate_expiry(local: &Id, key: &Id, max_expiry: u64) -> u64 {
    let bits = local.bits().max(key.bits()) as f64;
    let distance = local.distance(key) as f64;
    let max_expiry = max_expiry as f64;

    let expiry = max_expiry - (distance / bits * max_expiry) + 1.0;

    (expiry as u64).max(1)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::thread;

    use super::*;

    fn id(s: &str) -> Id {
        Id::from_str(s).unwrap()
    }

    #[test]
    fn put_then_get() {
        let mut store = Store::new(Id::random(4));
        let key = Id::random(4);

        assert!(!store.put(key.clone(), "ECHO".to_string()));
        assert_eq!(store.get(&key), Some("ECHO".to_string()));
        assert_eq!(store.get(&Id::random(4)), None);
    }

    #[test]
    fn put_reports_identical_values() {
        let mut store = Store::new(Id::random(4));
        let key = Id::random(4);

        assert!(!store.put(key.clone(), "ECHO".to_string()));
        assert!(store.put(key.clone(), "ECHO".to_string()));
        assert_eq!(store.len(), 1);

        // A different value overwrites.
        assert!(!store.put(key.clone(), "OTHER".to_string()));
        assert_eq!(store.get(&key), Some("OTHER".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expiry_by_distance() {
        let store = Store::new(id("00"));

        assert_eq!(store.calculate_expiry(&id("00")), 49);
        assert_eq!(store.calculate_expiry(&id("01")), 43);
        assert_eq!(store.calculate_expiry(&id("0f")), 25);
        assert_eq!(store.calculate_expiry(&id("80")), 1);

        let store = Store::new(id("00")).with_max_expiry(0);
        assert_eq!(store.calculate_expiry(&id("80")), 1);
    }

    #[test]
    fn expiry_is_monotonic() {
        let local = Id::random(4);
        let mut previous = u64::MAX;

        for bit in 0..32 {
            // Flip a single bit, from the least to the most significant.
            let mut bytes = local.as_bytes().to_vec();
            bytes[3 - bit / 8] ^= 1 << (bit % 8);
            let key = Id::from_bytes(bytes).unwrap();

            let expiry = calculate_expiry(&local, &key, DEFAULT_MAX_EXPIRY);

            assert!(expiry <= previous);
            assert!(expiry >= 1);
            previous = expiry;
        }
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        // Farthest key: a single unit.
        let mut store = Store::new(id("00")).with_expiry_unit(Duration::from_millis(20));
        let key = id("80");

        store.put(key.clone(), "ECHO".to_string());
        assert_eq!(store.get(&key), Some("ECHO".to_string()));

        thread::sleep(Duration::from_millis(40));

        assert_eq!(store.live_entries().count(), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn repeat_put_refreshes_expiry() {
        let mut store = Store::new(id("00")).with_expiry_unit(Duration::from_millis(60));
        let key = id("80");

        store.put(key.clone(), "ECHO".to_string());
        thread::sleep(Duration::from_millis(40));
        assert!(store.put(key.clone(), "ECHO".to_string()));
        thread::sleep(Duration::from_millis(40));

        assert_eq!(store.get(&key), Some("ECHO".to_string()));
    }
}
