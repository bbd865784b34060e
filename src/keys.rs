use std::collections::HashSet;

use chrono::{DateTime, Utc};

/// Items expire from the store 30 days after they are written.
pub const TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// 10^13 ms is roughly the year 2286, so every realistic timestamp stays positive.
const REVERSE_BASE_MS: i64 = 10_000_000_000_000;

/// Per-run memory of assigned `(category, key)` pairs.
///
/// One set belongs to one write call; it is never shared between runs, so
/// identical products scraped from unrelated pages do not push each other
/// onto suffixed keys.
#[derive(Debug, Default)]
pub struct SeenSet {
    keys: HashSet<(String, String)>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, category: &str, key: &str) -> bool {
        self.keys.contains(&(category.to_string(), key.to_string()))
    }

    /// Claim `base` under `category`, or the first free `base#1`, `base#2`, ...
    pub fn next_key(&mut self, category: &str, base: &str) -> String {
        let mut key = base.to_string();
        let mut counter = 1u32;
        while self.contains(category, &key) {
            key = format!("{}#{}", base, counter);
            counter += 1;
        }
        self.keys.insert((category.to_string(), key.clone()));
        key
    }
}

/// Expiry instant in epoch seconds.
pub fn ttl(now: DateTime<Utc>) -> i64 {
    now.timestamp() + TTL_SECS
}

/// `10^13 - epoch_millis`, zero padded to 13 digits so that lexicographic
/// order on the result is newest-first.
pub fn reverse_sort_value(timestamp: DateTime<Utc>) -> String {
    let value = (REVERSE_BASE_MS - timestamp.timestamp_millis()).clamp(0, REVERSE_BASE_MS);
    format!("{:013}", value)
}

/// Partition key for raw scrapes written on `date`.
pub fn partition_key(date: DateTime<Utc>) -> String {
    format!("STAGE#RAW#{}", date.format("%Y-%m-%d"))
}

/// Sort key before deduplication: `HH:MM:SSZ#<dashed name>`.
pub fn base_sort_key(timestamp: DateTime<Utc>, dashed_name: &str) -> String {
    format!("{}#{}", timestamp.format("%H:%M:%SZ"), dashed_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, h, m, s).unwrap()
    }

    #[test]
    fn duplicates_get_incrementing_suffixes() {
        let mut seen = SeenSet::new();
        assert_eq!(seen.next_key("STAGE#RAW#2024-03-09", "10:00:00Z#Beans"), "10:00:00Z#Beans");
        assert_eq!(seen.next_key("STAGE#RAW#2024-03-09", "10:00:00Z#Beans"), "10:00:00Z#Beans#1");
        assert_eq!(seen.next_key("STAGE#RAW#2024-03-09", "10:00:00Z#Beans"), "10:00:00Z#Beans#2");
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn categories_are_independent() {
        let mut seen = SeenSet::new();
        assert_eq!(seen.next_key("a", "k"), "k");
        assert_eq!(seen.next_key("b", "k"), "k");
    }

    #[test]
    fn suffix_skips_keys_already_claimed_literally() {
        let mut seen = SeenSet::new();
        seen.next_key("c", "k#1");
        seen.next_key("c", "k");
        assert_eq!(seen.next_key("c", "k"), "k#2");
    }

    #[test]
    fn never_emits_the_same_pair_twice() {
        let mut seen = SeenSet::new();
        let mut emitted = HashSet::new();
        let inputs = ["x", "x", "x#1", "y", "x", "x#1", "y", "x#2"];
        for (i, base) in inputs.iter().cycle().take(200).enumerate() {
            let category = if i % 3 == 0 { "p" } else { "q" };
            let key = seen.next_key(category, base);
            assert!(emitted.insert((category, key)));
        }
    }

    #[test]
    fn ttl_is_thirty_days_out() {
        let now = at(0, 0, 0);
        assert_eq!(ttl(now) - now.timestamp(), 2_592_000);
    }

    #[test]
    fn reverse_sort_value_orders_newest_first() {
        let base = at(12, 0, 0);
        let mut previous = reverse_sort_value(base);
        assert_eq!(previous.len(), 13);
        for step in 1..50 {
            let later = base + Duration::milliseconds(step * 997);
            let value = reverse_sort_value(later);
            assert!(value < previous, "{} should sort before {}", value, previous);
            previous = value;
        }
    }

    #[test]
    fn reverse_sort_value_known_instant() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(reverse_sort_value(ts), "8299999999877");
    }

    #[test]
    fn key_parts() {
        assert_eq!(partition_key(at(23, 59, 1)), "STAGE#RAW#2024-03-09");
        assert_eq!(base_sort_key(at(7, 5, 3), "Black-Beans"), "07:05:03Z#Black-Beans");
    }
}
