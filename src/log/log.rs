//! Assembled log store: the durable file pair plus the entry cache, exposed
//! to the consensus engine through [`LogTrait`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error};

use crate::entry::LogEntry;

use super::entry_cache::{EntryCache, ENTRY_CACHE_INIT_SIZE};
use super::log_file::LogFile;
use super::{EntryVisitor, LogTrait};

pub struct Log {
    file: LogFile,
    cache: EntryCache,
}

impl Log {
    pub fn new(file: LogFile) -> Self {
        Log {
            file,
            cache: EntryCache::new(ENTRY_CACHE_INIT_SIZE),
        }
    }

    pub fn log_file(&mut self) -> &mut LogFile {
        &mut self.file
    }

    async fn lookup(&mut self, idx: u64) -> Option<Arc<LogEntry>> {
        if let Some(entry) = self.cache.get(idx) {
            return Some(entry);
        }

        self.file.get(idx).await.unwrap_or_else(|e| {
            error!("failed to read entry {} from log file, err: {e}", idx);
            None
        })
    }
}

#[async_trait]
impl LogTrait for Log {
    async fn reset(&mut self, index: u64, term: u64) -> Result<()> {
        debug!("reset(index={}, term={})", index, term);

        self.file.reset(index, term).await?;
        self.cache = EntryCache::new(ENTRY_CACHE_INIT_SIZE);

        Ok(())
    }

    async fn append(&mut self, entry: Arc<LogEntry>) -> Result<()> {
        debug!(
            "append(id={}, term={}) -> index {}",
            entry.id,
            entry.term,
            self.file.current_index() + 1
        );

        self.file.append(&entry).await?;
        self.cache.append(entry, self.file.current_index());

        Ok(())
    }

    async fn poll(&mut self, first_idx: u64) -> Result<()> {
        debug!("poll(first_idx={})", first_idx);

        let _ = self.cache.delete_head(first_idx);

        Ok(())
    }

    async fn pop(
        &mut self,
        from_idx: u64,
        callback: Option<&mut EntryVisitor<'_>>,
    ) -> Result<()> {
        debug!("pop(from_idx={})", from_idx);

        let _ = self.cache.delete_tail(from_idx);
        match callback {
            Some(cb) => self.file.delete_suffix(from_idx, cb).await,
            None => self.file.delete_suffix(from_idx, |_, _| Ok(())).await,
        }
    }

    async fn get(&mut self, idx: u64) -> Option<Arc<LogEntry>> {
        if let Some(entry) = self.cache.get(idx) {
            debug!(
                "get(idx={}) -> (cache) id={}, term={}",
                idx, entry.id, entry.term
            );
            return Some(entry);
        }

        let entry = self.file.get(idx).await.unwrap_or_else(|e| {
            error!("failed to read entry {} from log file, err: {e}", idx);
            None
        });
        debug!(
            "get(idx={}) -> (file) id={:?}",
            idx,
            entry.as_ref().map(|e| e.id)
        );
        entry
    }

    async fn get_batch(&mut self, idx: u64, max_entries: usize) -> Vec<Arc<LogEntry>> {
        let mut entries = Vec::new();
        let mut i = idx;
        while entries.len() < max_entries {
            let Some(entry) = self.lookup(i).await else {
                break;
            };
            entries.push(entry);
            i += 1;
        }

        debug!(
            "get_batch(idx={}, max_entries={}) -> {}",
            idx,
            max_entries,
            entries.len()
        );
        entries
    }

    fn first_index(&self) -> u64 {
        self.file.first_index()
    }

    fn current_index(&self) -> u64 {
        self.file.current_index()
    }

    fn count(&self) -> u64 {
        self.file.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn entry(term: u64, id: u64, data: &str) -> Arc<LogEntry> {
        Arc::new(LogEntry::new(term, id, 0, data.as_bytes().to_vec()))
    }

    async fn new_log(path: &Path) -> Log {
        let file = LogFile::create(path, "db0", 0, 100).await.unwrap();
        let mut log = Log::new(file);
        log.append(entry(1, 1, "a")).await.unwrap();
        log.append(entry(1, 2, "bb")).await.unwrap();
        log.append(entry(2, 3, "ccc")).await.unwrap();
        log
    }

    #[tokio::test]
    async fn test_append_and_cached_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log(&dir.path().join("raft.log")).await;

        assert_eq!(log.first_index(), 100);
        assert_eq!(log.current_index(), 103);
        assert_eq!(log.count(), 3);

        let e = log.get(102).await.unwrap();
        assert_eq!(e.id, 2);
        assert!(log.get(104).await.is_none());

        // term/vote persistence goes through the underlying file
        log.log_file().set_vote(3).await.unwrap();
        assert_eq!(log.log_file().vote(), 3);
    }

    #[tokio::test]
    async fn test_get_falls_back_to_file_after_poll() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log(&dir.path().join("raft.log")).await;

        // snapshot installed up to 103: the cache empties but the durable
        // log still serves every index
        log.poll(104).await.unwrap();
        let e = log.get(101).await.unwrap();
        assert_eq!(e.id, 1);
        assert_eq!(e.data.as_ref(), b"a");
    }

    #[tokio::test]
    async fn test_cold_cache_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");
        drop(new_log(&path).await);

        let mut file = LogFile::open(&path).await.unwrap();
        file.load_entries(|_, _| Ok(())).await.unwrap();
        let mut log = Log::new(file);

        assert_eq!(log.get(103).await.unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_pop_trims_cache_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log(&dir.path().join("raft.log")).await;

        let mut seen = vec![];
        let mut cb = |e: &Arc<LogEntry>, idx: u64| -> Result<()> {
            seen.push((e.id, idx));
            Ok(())
        };
        log.pop(102, Some(&mut cb)).await.unwrap();

        assert_eq!(seen, vec![(2, 102), (3, 103)]);
        assert_eq!(log.current_index(), 101);
        assert_eq!(log.count(), 1);
        assert!(log.get(102).await.is_none());
        assert_eq!(log.get(101).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_get_batch_stops_at_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log(&dir.path().join("raft.log")).await;

        let batch = log.get_batch(101, 10).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].id, 1);
        assert_eq!(batch[2].id, 3);

        assert_eq!(log.get_batch(102, 1).await.len(), 1);
        assert!(log.get_batch(104, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_recreates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log(&dir.path().join("raft.log")).await;

        log.reset(200, 2).await.unwrap();
        assert_eq!(log.first_index(), 200);
        assert_eq!(log.current_index(), 200);
        assert_eq!(log.count(), 0);
        assert!(log.get(101).await.is_none());

        log.append(entry(2, 7, "x")).await.unwrap();
        assert_eq!(log.get(201).await.unwrap().id, 7);
    }

    #[tokio::test]
    async fn test_trait_object_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = LogFile::create(dir.path().join("raft.log"), "db0", 0, 0)
            .await
            .unwrap();
        let mut log: Box<dyn LogTrait> = Box::new(Log::new(file));

        log.append(entry(1, 1, "a")).await.unwrap();
        assert_eq!(log.current_index(), 1);
        assert_eq!(log.get(1).await.unwrap().id, 1);
    }
}
