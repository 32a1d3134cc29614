//! Append-only write log.
//!
//! Position `i` always holds the entry with `index == i`. Entries are appended
//! uncommitted and flip to committed exactly once. The only operation allowed to
//! drop committed entries is [`Log::reconcile`] against a leader's log.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub key: i64,
    pub value: String,
    pub committed: bool,
}

impl LogEntry {
    /// Same write at the same position, ignoring the commit flag.
    pub fn same_write(&self, other: &LogEntry) -> bool {
        self.index == other.index && self.key == other.key && self.value == other.value
    }
}

/// What happened when a follower was handed a replicated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Appended,
    /// Already present with identical content.
    Duplicate,
    /// An uncommitted divergent suffix was truncated to make room.
    Replaced,
    /// The entry lies beyond the end of the log.
    Gap,
    /// The slot holds a different committed entry; only reconciliation can fix it.
    Conflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kept: usize,
    pub discarded: usize,
    pub adopted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn committed(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|entry| entry.committed)
    }

    pub fn committed_count(&self) -> usize {
        self.committed().count()
    }

    /// Leader-side append of a fresh, uncommitted write.
    pub fn append(&mut self, key: i64, value: String) -> LogEntry {
        let entry = LogEntry {
            index: self.next_index(),
            key,
            value,
            committed: false,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Follower-side placement of an entry received from the leader.
    pub fn accept(&mut self, entry: LogEntry) -> AcceptOutcome {
        let position = entry.index as usize;
        if position > self.entries.len() {
            return AcceptOutcome::Gap;
        }
        if position == self.entries.len() {
            self.entries.push(LogEntry {
                committed: false,
                ..entry
            });
            return AcceptOutcome::Appended;
        }

        let existing = &self.entries[position];
        if existing.same_write(&entry) {
            return AcceptOutcome::Duplicate;
        }
        if self.entries[position..].iter().any(|e| e.committed) {
            return AcceptOutcome::Conflict;
        }
        self.entries.truncate(position);
        self.entries.push(LogEntry {
            committed: false,
            ..entry
        });
        AcceptOutcome::Replaced
    }

    /// Marks the entry committed. Returns the entry on the false→true transition.
    pub fn commit(&mut self, index: u64) -> Option<&LogEntry> {
        let entry = self.entries.get_mut(index as usize)?;
        if entry.committed {
            return None;
        }
        entry.committed = true;
        Some(entry)
    }

    /// True when no committed entry for the same key has a higher index.
    pub fn is_latest_committed(&self, index: u64) -> bool {
        let Some(entry) = self.get(index) else {
            return false;
        };
        entry.committed
            && !self.entries[index as usize + 1..]
                .iter()
                .any(|later| later.committed && later.key == entry.key)
    }

    /// Adopts `leader` as authoritative.
    ///
    /// Keeps the longest prefix on which both logs agree, discards the local
    /// suffix past it and splices in the leader's entries. Commit flags on kept
    /// entries are merged with the leader's.
    ///
    /// A leader log that is a prefix of ours is an older snapshot, not a
    /// conflict: committed entries past its end stay, only the uncommitted
    /// tail is dropped.
    pub fn reconcile(&mut self, leader: Vec<LogEntry>) -> ReconcileReport {
        let mut common = self.entries.len().min(leader.len());
        while common > 0
            && !self.entries[..common]
                .iter()
                .zip(&leader[..common])
                .all(|(local, theirs)| local.same_write(theirs))
        {
            common -= 1;
        }

        let mut kept = common;
        if common == leader.len() {
            kept += self.entries[common..]
                .iter()
                .take_while(|entry| entry.committed)
                .count();
        }

        let discarded = self.entries.len() - kept;
        self.entries.truncate(kept);
        for (local, theirs) in self.entries.iter_mut().zip(&leader) {
            local.committed |= theirs.committed;
        }
        let adopted = leader.len() - common;
        self.entries.extend(leader.into_iter().skip(common));

        ReconcileReport {
            kept,
            discarded,
            adopted,
        }
    }
}
