//! Materialized key-value view of the committed log.

use std::collections::BTreeMap;

use crate::log::{Log, LogEntry};

/// Key-value map fed only by committed log entries.
///
/// Every node keeps its own copy. Reads never touch the log; they see whatever
/// this node has committed so far.
#[derive(Debug, Default, Clone)]
pub struct Dictionary {
    data: BTreeMap<i64, String>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a committed entry, overwriting any previous value for its key.
    pub fn apply(&mut self, entry: &LogEntry) {
        debug_assert!(entry.committed, "applying uncommitted entry {}", entry.index);
        self.data.insert(entry.key, entry.value.clone());
    }

    /// Recomputes the map from scratch. Later committed entries win.
    pub fn rebuild(&mut self, log: &Log) {
        self.data.clear();
        for entry in log.committed() {
            self.data.insert(entry.key, entry.value.clone());
        }
    }

    pub fn get(&self, key: i64) -> Option<&str> {
        self.data.get(&key).map(String::as_str)
    }

    pub fn snapshot(&self) -> BTreeMap<i64, String> {
        self.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_keeps_highest_committed_value_per_key() {
        let mut log = Log::new();
        log.append(1, "first".into());
        log.append(1, "second".into());
        log.append(1, "pending".into());
        log.append(2, "other".into());
        log.commit(0);
        log.commit(1);
        log.commit(3);

        let mut dict = Dictionary::new();
        dict.rebuild(&log);

        assert_eq!(dict.get(1), Some("second"));
        assert_eq!(dict.get(2), Some("other"));
        assert_eq!(dict.snapshot().len(), 2);
    }

    #[test]
    fn missing_key_reads_none() {
        let dict = Dictionary::new();
        assert!(dict.snapshot().is_empty());
        assert_eq!(dict.get(42), None);
    }
}
