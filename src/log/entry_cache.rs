//! Ring buffer of the most recently appended entries, indexed by log index.
//! Consensus lookups are heavily biased toward the log tail, and a ring gives
//! O(1) head eviction after a snapshot and O(1) tail truncation after a
//! conflicting append, matching the durable log's own truncations.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::entry::LogEntry;

use super::error::LogError;

pub const ENTRY_CACHE_INIT_SIZE: usize = 512;

pub struct EntryCache {
    ptrs: Vec<Option<Arc<LogEntry>>>,
    start: usize,
    len: usize,
    // log index of the logical first cached entry, 0 when empty
    start_idx: u64,
}

impl EntryCache {
    pub fn new(initial_size: usize) -> Self {
        EntryCache {
            ptrs: vec![None; initial_size],
            start: 0,
            len: 0,
            start_idx: 0,
        }
    }

    /// Caches the entry appended at `idx`, taking one strong reference.
    /// Appends must stay contiguous with the cached tail.
    pub fn append(&mut self, entry: Arc<LogEntry>, idx: u64) {
        if self.start_idx == 0 {
            self.start_idx = idx;
        }
        assert_eq!(
            self.start_idx + self.len as u64,
            idx,
            "non-contiguous cache append"
        );

        if self.len == self.ptrs.len() {
            self.grow();
        }

        let size = self.ptrs.len();
        self.ptrs[(self.start + self.len) % size] = Some(entry);
        self.len += 1;
    }

    // Doubles the physical array. The wrapped prefix [0, start) moves to
    // [old_size, old_size + start) so the ring stays logically contiguous.
    fn grow(&mut self) {
        let old_size = self.ptrs.len();
        self.ptrs.resize(old_size * 2, None);
        for i in 0..self.start {
            self.ptrs[old_size + i] = self.ptrs[i].take();
        }
    }

    /// Returns a fresh strong reference, or None on a miss.
    pub fn get(&self, idx: u64) -> Option<Arc<LogEntry>> {
        if idx < self.start_idx {
            return None;
        }

        let relidx = (idx - self.start_idx) as usize;
        if relidx >= self.len {
            return None;
        }

        self.ptrs[(self.start + relidx) % self.ptrs.len()].clone()
    }

    /// Evicts entries from the front until the cache starts at `first_idx`
    /// or runs empty. Returns the number of entries released.
    pub fn delete_head(&mut self, first_idx: u64) -> Result<u64> {
        if first_idx < self.start_idx {
            bail!(LogError::IndexOutOfRange);
        }

        let mut deleted = 0;
        while first_idx > self.start_idx && self.len > 0 {
            self.start_idx += 1;
            self.ptrs[self.start] = None;
            self.start = (self.start + 1) % self.ptrs.len();
            self.len -= 1;
            deleted += 1;
        }

        if self.len == 0 {
            self.start_idx = 0;
        }

        Ok(deleted)
    }

    /// Releases entries at logical positions `[from_idx, start_idx + len)`.
    /// Returns the number of entries released.
    pub fn delete_tail(&mut self, from_idx: u64) -> Result<u64> {
        if from_idx >= self.start_idx + self.len as u64 || from_idx < self.start_idx {
            bail!(LogError::IndexOutOfRange);
        }

        let size = self.ptrs.len();
        let mut deleted = 0;
        for i in from_idx..self.start_idx + self.len as u64 {
            let relidx = (i - self.start_idx) as usize;
            self.ptrs[(self.start + relidx) % size] = None;
            deleted += 1;
        }
        self.len -= deleted as usize;

        if self.len == 0 {
            self.start_idx = 0;
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> Arc<LogEntry> {
        Arc::new(LogEntry::new(1, id, 0, vec![id as u8]))
    }

    #[test]
    fn test_append_get() {
        let mut cache = EntryCache::new(4);
        for idx in 1..=3 {
            cache.append(entry(idx), idx);
        }

        for idx in 1..=3 {
            assert_eq!(cache.get(idx).unwrap().id, idx);
        }
        assert!(cache.get(0).is_none());
        assert!(cache.get(4).is_none());
    }

    #[test]
    fn test_hold_release_accounting() {
        let mut cache = EntryCache::new(4);
        let e = entry(1);
        cache.append(e.clone(), 1);
        assert_eq!(Arc::strong_count(&e), 2);

        let held = cache.get(1).unwrap();
        assert_eq!(Arc::strong_count(&e), 3);
        drop(held);

        cache.delete_head(2).unwrap();
        assert_eq!(Arc::strong_count(&e), 1);
    }

    #[test]
    fn test_wraparound_without_growth() {
        let mut cache = EntryCache::new(4);
        for idx in 1..=4 {
            cache.append(entry(idx), idx);
        }

        assert_eq!(cache.delete_head(3).unwrap(), 2);
        assert_eq!(cache.start_idx, 3);
        assert_eq!(cache.len, 2);
        assert_eq!(cache.start, 2);

        cache.append(entry(5), 5);
        cache.append(entry(6), 6);
        assert_eq!(cache.ptrs.len(), 4);

        // index 5 wrapped to physical slot (2 + 2) % 4 = 0
        assert_eq!(cache.ptrs[0].as_ref().unwrap().id, 5);
        for idx in 3..=6 {
            assert_eq!(cache.get(idx).unwrap().id, idx);
        }
    }

    #[test]
    fn test_growth_preserves_order() {
        let mut cache = EntryCache::new(2);
        cache.append(entry(1), 1);
        cache.append(entry(2), 2);
        cache.delete_head(2).unwrap();

        cache.append(entry(3), 3);
        cache.append(entry(4), 4);
        cache.append(entry(5), 5);

        assert_eq!(cache.ptrs.len(), 4);
        for idx in 2..=5 {
            assert_eq!(cache.get(idx).unwrap().id, idx);
        }
    }

    #[test]
    fn test_ring_invariant() {
        let mut cache = EntryCache::new(4);
        for idx in 1..=6 {
            cache.append(entry(idx), idx);
        }

        assert!(cache.len <= cache.ptrs.len());
        for i in 0..cache.len {
            let slot = &cache.ptrs[(cache.start + i) % cache.ptrs.len()];
            assert_eq!(
                slot.as_ref().unwrap().id,
                cache.get(cache.start_idx + i as u64).unwrap().id
            );
        }
    }

    #[test]
    fn test_delete_head_idempotent() {
        let mut cache = EntryCache::new(4);
        for idx in 1..=4 {
            cache.append(entry(idx), idx);
        }

        assert_eq!(cache.delete_head(3).unwrap(), 2);
        assert_eq!(cache.delete_head(3).unwrap(), 0);
        assert_eq!(cache.start_idx, 3);
        assert_eq!(cache.len, 2);
    }

    #[test]
    fn test_delete_head_below_start_fails() {
        let mut cache = EntryCache::new(4);
        cache.append(entry(5), 5);
        assert!(cache.delete_head(4).is_err());
    }

    #[test]
    fn test_delete_head_past_tail_empties() {
        let mut cache = EntryCache::new(4);
        for idx in 1..=3 {
            cache.append(entry(idx), idx);
        }

        assert_eq!(cache.delete_head(10).unwrap(), 3);
        assert_eq!(cache.len, 0);
        assert_eq!(cache.start_idx, 0);

        // the cache restarts anywhere once empty
        cache.append(entry(42), 42);
        assert_eq!(cache.get(42).unwrap().id, 42);
    }

    #[test]
    fn test_delete_tail() {
        let mut cache = EntryCache::new(4);
        for idx in 1..=4 {
            cache.append(entry(idx), idx);
        }

        assert_eq!(cache.delete_tail(3).unwrap(), 2);
        assert_eq!(cache.len, 2);
        assert!(cache.get(3).is_none());
        assert_eq!(cache.get(2).unwrap().id, 2);

        assert!(cache.delete_tail(5).is_err());
        assert!(cache.delete_tail(0).is_err());

        assert_eq!(cache.delete_tail(1).unwrap(), 2);
        assert_eq!(cache.len, 0);
        assert_eq!(cache.start_idx, 0);
    }

    #[test]
    #[should_panic(expected = "non-contiguous cache append")]
    fn test_non_contiguous_append_panics() {
        let mut cache = EntryCache::new(4);
        cache.append(entry(1), 1);
        cache.append(entry(3), 3);
    }
}
