//! This module contains the structure that accumulates usage entries
//! locally before they are flushed to the billing backend.
//!
//! Entries are grouped per subscription item. Aggregation is a plain sum,
//! so insertion order does not matter for billing, but it is preserved
//! so batches can be inspected.
//!

use std::collections::HashMap;

/// One recorded unit of API consumption.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UsageEntry {
    pub customer_id: String,
    pub quantity: u64,
    pub endpoint: Option<String>,
    pub captured_at_millis: i64,
}

/// What a flush observed when it started: how many entries it covers
/// and their summed quantity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingFlush {
    pub entry_count: usize,
    pub quantity: u64,
}

#[derive(Default)]
pub struct BatchStore {
    batches: HashMap<String, Vec<UsageEntry>>,
}

impl BatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry to the batch of `key`, creating the batch if
    /// needed. Returns the batch length after the append.
    pub fn append(&mut self, key: &str, entry: UsageEntry) -> usize {
        let batch = self.batches.entry(key.to_string()).or_default();
        batch.push(entry);
        batch.len()
    }

    /// Sums the batch of `key` without removing anything.
    ///
    /// Returns `None` when the key is absent or its batch is empty.
    pub fn snapshot(&self, key: &str) -> Option<PendingFlush> {
        let batch = self.batches.get(key).filter(|b| !b.is_empty())?;
        let quantity = batch
            .iter()
            .fold(0u64, |acc, entry| acc.saturating_add(entry.quantity));
        Some(PendingFlush {
            entry_count: batch.len(),
            quantity,
        })
    }

    /// Drops the first `entry_count` entries of `key`, the ones covered by
    /// a successful flush. Entries appended after the snapshot stay.
    pub fn acknowledge(&mut self, key: &str, entry_count: usize) {
        if let Some(batch) = self.batches.get_mut(key) {
            let covered = entry_count.min(batch.len());
            batch.drain(..covered);
            if batch.is_empty() {
                self.batches.remove(key);
            }
        }
    }

    /// Keys that currently hold at least one entry.
    pub fn keys(&self) -> Vec<String> {
        self.batches
            .iter()
            .filter(|(_, batch)| !batch.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn entries(&self, key: &str) -> &[UsageEntry] {
        self.batches.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self, key: &str) -> usize {
        self.entries(key).len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchStore, PendingFlush, UsageEntry};

    fn entry(customer_id: &str, quantity: u64) -> UsageEntry {
        UsageEntry {
            customer_id: customer_id.to_string(),
            quantity,
            endpoint: None,
            captured_at_millis: 1_696_803_325_000,
        }
    }

    #[test]
    fn empty_store() {
        let store = BatchStore::new();
        assert!(store.is_empty());
        assert_eq!(store.snapshot("si_1"), None);
        assert!(store.keys().is_empty());
        assert_eq!(store.len("si_1"), 0);
    }

    #[test]
    fn test_multiple_keys() {
        let mut store = BatchStore::new();
        assert_eq!(store.append("si_1", entry("cus_a", 1)), 1);
        assert_eq!(store.append("si_1", entry("cus_a", 4)), 2);
        assert_eq!(store.append("si_2", entry("cus_b", 7)), 1);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["si_1".to_string(), "si_2".to_string()]);

        assert_eq!(
            store.snapshot("si_1"),
            Some(PendingFlush {
                entry_count: 2,
                quantity: 5
            })
        );
        assert_eq!(
            store.snapshot("si_2"),
            Some(PendingFlush {
                entry_count: 1,
                quantity: 7
            })
        );
        // Snapshots never mutate.
        assert_eq!(store.len("si_1"), 2);
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let mut store = BatchStore::new();
        store.append("si_1", entry("cus_a", 1));
        store.append("si_1", entry("cus_b", 2));
        store.append("si_1", entry("cus_c", 3));

        let customers: Vec<&str> = store
            .entries("si_1")
            .iter()
            .map(|e| e.customer_id.as_str())
            .collect();
        assert_eq!(customers, vec!["cus_a", "cus_b", "cus_c"]);
    }

    #[test]
    fn test_acknowledge_keeps_late_entries() {
        let mut store = BatchStore::new();
        store.append("si_1", entry("cus_a", 1));
        store.append("si_1", entry("cus_a", 2));
        let pending = store.snapshot("si_1").unwrap();

        // Appended while the flush was in flight.
        store.append("si_1", entry("cus_a", 10));
        store.acknowledge("si_1", pending.entry_count);

        assert_eq!(store.entries("si_1"), &[entry("cus_a", 10)]);
        assert_eq!(store.snapshot("si_1").unwrap().quantity, 10);
    }

    #[test]
    fn test_acknowledge_everything_removes_key() {
        let mut store = BatchStore::new();
        store.append("si_1", entry("cus_a", 1));
        store.acknowledge("si_1", 1);

        assert!(store.is_empty());
        assert!(store.keys().is_empty());
        // Unknown keys are ignored.
        store.acknowledge("si_404", 3);
    }

    #[test]
    fn test_aggregate_saturates() {
        let mut store = BatchStore::new();
        store.append("si_1", entry("cus_a", u64::MAX));
        store.append("si_1", entry("cus_a", 5));
        assert_eq!(store.snapshot("si_1").unwrap().quantity, u64::MAX);
    }
}
