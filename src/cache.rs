//! Bounded map from ledger offset to decoded transaction (spec.md §4.4).

use std::collections::HashMap;

use crate::transaction::Transaction;

/// Approximate per-byte cost multiplier applied to a cached entry's on-disk
/// length when accounting against the cache's byte budget (spec.md §11).
pub const MEMORY_FACTOR: usize = 3;

/// A transaction as read from a known ledger offset, possibly without its
/// payload decoded yet.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedEntry {
    pub offset: u64,
    pub length: u64,
    /// `false` for a header-only decode; `true` once the payload has been
    /// fetched and verified.
    pub complete: bool,
    pub transaction: Transaction,
    /// Bytes skipped by the error-correction window before this entry's
    /// signature was located (0 for a clean scan).
    pub error_correction_offset: u64,
}

/// Caches [`DecodedEntry`] values by ledger offset under a byte budget,
/// evicting in stack-pop order: the most recently inserted tracked offset is
/// the first dropped once the budget is exceeded (spec.md §9, preserved
/// intentionally rather than switched to LRU).
pub struct EntryCache {
    entries: HashMap<u64, DecodedEntry>,
    insertion_stack: Vec<u64>,
    budget_bytes: usize,
    used_bytes: usize,
}

impl EntryCache {
    pub fn new(budget_bytes: usize) -> Self {
        EntryCache {
            entries: HashMap::new(),
            insertion_stack: Vec::new(),
            budget_bytes,
            used_bytes: 0,
        }
    }

    pub fn get(&self, offset: u64) -> Option<&DecodedEntry> {
        self.entries.get(&offset)
    }

    /// Returns the cached entry only if it already satisfies `need_data`
    /// (a header-only entry does not satisfy a caller that needs the
    /// payload).
    pub fn get_satisfying(&self, offset: u64, need_data: bool) -> Option<&DecodedEntry> {
        self.entries
            .get(&offset)
            .filter(|entry| !need_data || entry.complete)
    }

    /// Inserts or replaces the entry at `entry.offset`. A `complete=true`
    /// entry overwrites any existing `complete=false` entry at the same
    /// offset.
    pub fn insert(&mut self, entry: DecodedEntry) {
        if let Some(old) = self.entries.remove(&entry.offset) {
            self.used_bytes -= cost(&old);
        }
        self.used_bytes += cost(&entry);
        self.insertion_stack.push(entry.offset);
        self.entries.insert(entry.offset, entry);
        self.evict();
    }

    fn evict(&mut self) {
        while self.used_bytes > self.budget_bytes {
            let Some(offset) = self.insertion_stack.pop() else {
                break;
            };
            if let Some(removed) = self.entries.remove(&offset) {
                self.used_bytes -= cost(&removed);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_stack.clear();
        self.used_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cost(entry: &DecodedEntry) -> usize {
    entry.length as usize * MEMORY_FACTOR
}
