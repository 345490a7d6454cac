//! The replicated log subsystem: a durable RESP-framed log file with a
//! rebuildable offset index, an in-memory ring cache of recent entries, and
//! the operation table the consensus engine drives them through.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::entry::LogEntry;

pub mod entry_cache;
pub mod error;
pub mod framing;
#[allow(clippy::module_inception)]
mod log;
mod log_file;

pub use entry_cache::{EntryCache, ENTRY_CACHE_INIT_SIZE};
pub use error::LogError;
pub use log::Log;
pub use log_file::{LogFile, DBID_LEN, RAFTLOG_VERSION};

/// Visitor invoked for each entry during scans and suffix deletion.
pub type EntryVisitor<'a> = dyn FnMut(&Arc<LogEntry>, u64) -> Result<()> + Send + 'a;

/// The operation table the consensus engine consumes, bound once at
/// construction. Entries are shared handles: each `get` hands out a fresh
/// strong reference the caller drops when done.
#[async_trait]
pub trait LogTrait: Send {
    /// Truncates everything and restarts the log at a new snapshot boundary.
    async fn reset(&mut self, index: u64, term: u64) -> Result<()>;

    /// Durably appends one entry and caches it at the new index.
    async fn append(&mut self, entry: Arc<LogEntry>) -> Result<()>;

    /// Evicts cached entries below `first_idx` after a snapshot; the durable
    /// log's first index only moves through `reset`.
    async fn poll(&mut self, first_idx: u64) -> Result<()>;

    /// Deletes entries from `from_idx` onward, cache first so a failed file
    /// truncation never leaves stale cached suffixes.
    async fn pop(&mut self, from_idx: u64, callback: Option<&mut EntryVisitor<'_>>)
        -> Result<()>;

    async fn get(&mut self, idx: u64) -> Option<Arc<LogEntry>>;

    /// Up to `max_entries` consecutive entries starting at `idx`, stopping at
    /// the first miss.
    async fn get_batch(&mut self, idx: u64, max_entries: usize) -> Vec<Arc<LogEntry>>;

    fn first_index(&self) -> u64;
    fn current_index(&self) -> u64;
    fn count(&self) -> u64;
}
