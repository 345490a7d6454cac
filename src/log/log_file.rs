//! Durable log file pair: an append-only RESP-framed log and a fixed-stride
//! offset index keyed by log index. The offset index is derived state; it is
//! rebuilt from a full scan on every open and is never required to be synced.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::config::CONFIG;
use crate::entry::LogEntry;

use super::error::LogError;
use super::framing::{self, RawRecord, RecordWriter};

pub const RAFTLOG_VERSION: u64 = 1;
pub const DBID_LEN: usize = 32;

const HEADER_TAG: &[u8] = b"RAFTLOG";
const ENTRY_TAG: &[u8] = b"ENTRY";

const LOG_FILE_NAME: &str = "raft.log";

const OFFSET_SLOT_SIZE: u64 = std::mem::size_of::<u64>() as u64;

// Fixed widths of the zero-padded header numerics. The header's byte length
// must not change across in-place rewrites.
const VERSION_PAD: usize = 4;
const TERM_PAD: usize = 20;
const VOTE_PAD: usize = 11;

pub struct LogFile {
    file: File,
    rfile: BufReader<File>,
    idxfile: File,
    path: PathBuf,

    // next append offset, tracked so record start offsets are captured
    // before the first byte of a record is written
    write_pos: u64,

    dbid: String,
    snapshot_last_term: u64,
    snapshot_last_idx: u64,
    index: u64,
    num_entries: u64,
    term: u64,
    vote: i64,

    no_fsync: bool,
}

fn idx_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".idx");
    PathBuf::from(p)
}

async fn write_end(file: &mut File, no_fsync: bool) -> Result<()> {
    file.flush()
        .await
        .map_err(|_| anyhow!(LogError::FailedToWrite))?;
    if no_fsync {
        return Ok(());
    }
    file.sync_all()
        .await
        .map_err(|_| anyhow!(LogError::FailedToSync))?;

    Ok(())
}

fn parse_entry(record: &RawRecord) -> Result<LogEntry> {
    if record.elements.len() != 5 {
        error!(
            "log entry: invalid number of elements: {}",
            record.elements.len()
        );
        bail!(LogError::BadEntry);
    }

    let term = framing::parse_u64(&record.elements[1])?;
    let id = framing::parse_u64(&record.elements[2])?;
    let kind = u32::try_from(framing::parse_u64(&record.elements[3])?)
        .map_err(|_| anyhow!(LogError::BadEntry))?;

    Ok(LogEntry {
        term,
        id,
        kind,
        data: record.elements[4].clone(),
    })
}

impl LogFile {
    async fn prepare_log(path: &Path) -> Result<(File, BufReader<File>, File)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .await
            .map_err(|e| {
                error!("failed to open log file: {:?}, err: {:?}", path, e);
                anyhow!(LogError::FailedToOpen)
            })?;

        let rfile = OpenOptions::new().read(true).open(path).await.map_err(|e| {
            error!("failed to open log file: {:?}, err: {:?}", path, e);
            anyhow!(LogError::FailedToOpen)
        })?;

        // the offset index is rebuilt on open, so it is always truncated
        let idxfile = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(idx_path(path))
            .await
            .map_err(|e| {
                error!("failed to open offset index: {:?}, err: {:?}", path, e);
                anyhow!(LogError::FailedToOpen)
            })?;

        Ok((file, BufReader::new(rfile), idxfile))
    }

    /// Creates a fresh log: truncates both files and writes a header with the
    /// given snapshot boundary. The node bootstraps at `term = 1`, no vote.
    pub async fn create(
        path: impl AsRef<Path>,
        dbid: &str,
        term: u64,
        index: u64,
    ) -> Result<LogFile> {
        ensure!(dbid.len() <= DBID_LEN, LogError::BadHeader);

        let (file, rfile, idxfile) = Self::prepare_log(path.as_ref()).await?;
        let mut log = LogFile {
            file,
            rfile,
            idxfile,
            path: path.as_ref().to_path_buf(),
            write_pos: 0,
            dbid: dbid.to_string(),
            snapshot_last_term: term,
            snapshot_last_idx: index,
            index,
            num_entries: 0,
            term: 1,
            vote: -1,
            no_fsync: CONFIG.read().no_fsync,
        };

        log.file
            .set_len(0)
            .await
            .map_err(|_| anyhow!(LogError::FailedToTruncate))?;
        log.write_header()
            .await
            .inspect_err(|e| error!("failed to create log: {:?}, err: {e}", path.as_ref()))?;

        Ok(log)
    }

    /// Log path inside the configured `log_dir`.
    fn log_path_from_config() -> Result<PathBuf> {
        let conf = CONFIG.read();
        let log_dir = conf
            .log_dir
            .as_ref()
            .ok_or_else(|| anyhow!("log_dir is not configured"))?;

        Ok(PathBuf::from(log_dir).join(LOG_FILE_NAME))
    }

    /// Creates the log in the configured `log_dir` with the configured
    /// `dbid`.
    pub async fn create_from_config(term: u64, index: u64) -> Result<LogFile> {
        let path = Self::log_path_from_config()?;
        let dbid = CONFIG.read().dbid.clone().unwrap_or_default();

        Self::create(path, &dbid, term, index).await
    }

    /// Opens the log in the configured `log_dir`.
    pub async fn open_from_config() -> Result<LogFile> {
        Self::open(Self::log_path_from_config()?).await
    }

    /// Opens an existing log and loads its header. Entries are not scanned;
    /// call [`LogFile::load_entries`] to rebuild the offset index.
    pub async fn open(path: impl AsRef<Path>) -> Result<LogFile> {
        let (file, rfile, idxfile) = Self::prepare_log(path.as_ref()).await?;
        let mut log = LogFile {
            file,
            rfile,
            idxfile,
            path: path.as_ref().to_path_buf(),
            write_pos: 0,
            dbid: String::new(),
            snapshot_last_term: 0,
            snapshot_last_idx: 0,
            index: 0,
            num_entries: 0,
            term: 1,
            vote: -1,
            no_fsync: CONFIG.read().no_fsync,
        };

        log.rfile
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|_| anyhow!(LogError::FailedToSeek))?;
        let record = framing::read_record(&mut log.rfile)
            .await?
            .ok_or_else(|| anyhow!(LogError::BadHeader))
            .inspect_err(|_| error!("failed to read log header: {:?}", path.as_ref()))?;
        log.handle_header(&record)?;

        log.write_pos = log
            .file
            .metadata()
            .await
            .map_err(|_| anyhow!(LogError::FailedToRead))?
            .len();

        Ok(log)
    }

    fn encode_header(&self) -> Bytes {
        let mut w = RecordWriter::begin(7);
        w.push_blob(HEADER_TAG);
        w.push_u64_padded(RAFTLOG_VERSION, VERSION_PAD);
        w.push_blob(self.dbid.as_bytes());
        w.push_u64_padded(self.snapshot_last_term, TERM_PAD);
        w.push_u64_padded(self.snapshot_last_idx, TERM_PAD);
        w.push_u64_padded(self.term, TERM_PAD);
        w.push_i64_padded(self.vote, VOTE_PAD);

        w.finish()
    }

    // Writes the header through the append handle. Only valid right after a
    // truncate, when the end of file is byte zero.
    async fn write_header(&mut self) -> Result<()> {
        let buf = self.encode_header();
        self.file
            .write_all(&buf)
            .await
            .map_err(|_| anyhow!(LogError::FailedToWrite))?;
        write_end(&mut self.file, self.no_fsync).await?;
        self.write_pos = buf.len() as u64;

        Ok(())
    }

    fn handle_header(&mut self, record: &RawRecord) -> Result<()> {
        if record.elements.len() != 7 || record.elements[0].as_ref() != HEADER_TAG {
            error!("invalid log header");
            bail!(LogError::BadHeader);
        }

        let version = framing::parse_u64(&record.elements[1])?;
        if version != RAFTLOG_VERSION {
            error!("unsupported log version: {}", version);
            bail!(LogError::BadHeader);
        }

        let dbid = std::str::from_utf8(&record.elements[2])
            .map_err(|_| anyhow!(LogError::BadHeader))?;
        if dbid.len() > DBID_LEN {
            error!("invalid log dbid: {}", dbid);
            bail!(LogError::BadHeader);
        }
        self.dbid = dbid.to_string();

        self.snapshot_last_term = framing::parse_u64(&record.elements[3])?;
        self.snapshot_last_idx = framing::parse_u64(&record.elements[4])?;
        self.index = self.snapshot_last_idx;
        self.term = framing::parse_u64(&record.elements[5])?;
        self.vote = framing::parse_i64(&record.elements[6])?;

        Ok(())
    }

    /// Truncates the log at a new snapshot boundary and rewrites the header.
    /// A term moving backwards clears the recorded vote.
    pub async fn reset(&mut self, index: u64, term: u64) -> Result<()> {
        self.index = index;
        self.snapshot_last_idx = index;
        self.snapshot_last_term = term;
        if self.term > term {
            self.term = term;
            self.vote = -1;
        }

        self.file
            .set_len(0)
            .await
            .map_err(|_| anyhow!(LogError::FailedToTruncate))?;
        self.idxfile
            .set_len(0)
            .await
            .map_err(|_| anyhow!(LogError::FailedToTruncate))?;
        self.write_header().await?;
        self.num_entries = 0;

        Ok(())
    }

    /// Scans every entry record, rebuilding the offset index file and handing
    /// each decoded entry to the visitor. Returns the number of entries; a
    /// record with the wrong shape, or a visitor error, fails the scan.
    pub async fn load_entries<F>(&mut self, mut callback: F) -> Result<u64>
    where
        F: FnMut(&Arc<LogEntry>, u64) -> Result<()>,
    {
        info!("start loading log entries at: {:?} ...", self.path);

        self.rfile
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|_| anyhow!(LogError::FailedToSeek))?;

        self.term = 1;
        self.index = 0;

        let header = framing::read_record(&mut self.rfile)
            .await?
            .ok_or_else(|| anyhow!(LogError::BadHeader))
            .inspect_err(|_| error!("failed to read log header: {:?}", self.path))?;
        self.handle_header(&header)?;

        let mut pos = header.bytes_read;
        let mut count = 0u64;

        loop {
            let offset = pos;
            let record = match framing::read_record(&mut self.rfile).await? {
                Some(r) if !r.elements.is_empty() => r,
                _ => break,
            };

            if !record.tag_is(ENTRY_TAG) {
                error!("invalid log record tag at offset {}", offset);
                bail!(LogError::BadEntry);
            }

            let entry = Arc::new(parse_entry(&record)?);
            self.update_index(self.index + 1, offset).await?;
            self.index += 1;
            count += 1;

            callback(&entry, self.index)?;

            pos += record.bytes_read;
        }

        self.num_entries = count;
        self.write_pos = pos;

        debug!("loaded {} log entries", count);

        Ok(count)
    }

    async fn update_index(&mut self, index: u64, offset: u64) -> Result<()> {
        let relidx = index - self.snapshot_last_idx;
        self.idxfile
            .seek(SeekFrom::Start(OFFSET_SLOT_SIZE * relidx))
            .await
            .map_err(|_| anyhow!(LogError::FailedToSeek))?;
        self.idxfile
            .write_all(&offset.to_ne_bytes())
            .await
            .map_err(|_| anyhow!(LogError::FailedToWrite))?;

        Ok(())
    }

    /// Appends one entry record without syncing. The in-memory index moves
    /// only after the offset index write succeeds.
    pub async fn write_entry(&mut self, entry: &LogEntry) -> Result<()> {
        let mut w = RecordWriter::begin(5);
        w.push_blob(ENTRY_TAG);
        w.push_u64(entry.term);
        w.push_u64(entry.id);
        w.push_u64(u64::from(entry.kind));
        w.push_blob(&entry.data);
        let buf = w.finish();

        // record start offset, captured before the first byte goes out
        let offset = self.write_pos;
        self.file
            .write_all(&buf)
            .await
            .map_err(|_| anyhow!(LogError::FailedToWrite))?;
        self.write_pos += buf.len() as u64;

        self.update_index(self.index + 1, offset).await?;
        self.index += 1;

        Ok(())
    }

    /// Flush, and fsync unless `no_fsync` is configured.
    pub async fn sync(&mut self) -> Result<()> {
        write_end(&mut self.file, self.no_fsync).await
    }

    /// Durable append: the entry is on stable storage once this returns.
    pub async fn append(&mut self, entry: &LogEntry) -> Result<()> {
        self.write_entry(entry).await?;
        self.sync().await?;
        self.num_entries += 1;

        Ok(())
    }

    // Positions the read handle at the entry's record via the offset index.
    // Ok(None) when idx falls outside (snapshot_last_idx, index].
    async fn seek_entry(&mut self, idx: u64) -> Result<Option<u64>> {
        if idx <= self.snapshot_last_idx || idx > self.snapshot_last_idx + self.num_entries {
            return Ok(None);
        }

        let relidx = idx - self.snapshot_last_idx;
        self.idxfile
            .seek(SeekFrom::Start(OFFSET_SLOT_SIZE * relidx))
            .await
            .map_err(|_| anyhow!(LogError::FailedToSeek))?;
        let mut buf = [0u8; 8];
        self.idxfile
            .read_exact(&mut buf)
            .await
            .map_err(|_| anyhow!(LogError::FailedToRead))?;
        let offset = u64::from_ne_bytes(buf);

        self.rfile
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|_| anyhow!(LogError::FailedToSeek))?;

        Ok(Some(offset))
    }

    /// Random access by log index. Ok(None) for an out-of-range index.
    pub async fn get(&mut self, idx: u64) -> Result<Option<Arc<LogEntry>>> {
        if self.seek_entry(idx).await?.is_none() {
            return Ok(None);
        }

        let record = framing::read_record(&mut self.rfile)
            .await?
            .ok_or_else(|| anyhow!(LogError::TruncatedRecord))?;
        let entry = parse_entry(&record)?;

        Ok(Some(Arc::new(entry)))
    }

    /// Deletes every entry from `from_idx` onward: the visitor sees each
    /// doomed entry, then the file is truncated at the suffix start offset.
    pub async fn delete_suffix<F>(&mut self, from_idx: u64, mut callback: F) -> Result<()>
    where
        F: FnMut(&Arc<LogEntry>, u64) -> Result<()>,
    {
        let offset = self
            .seek_entry(from_idx)
            .await?
            .ok_or_else(|| anyhow!(LogError::IndexOutOfRange))?;

        let mut scan_err = None;
        let mut idx = from_idx;
        loop {
            let record = match framing::read_record(&mut self.rfile).await {
                Ok(Some(r)) if !r.elements.is_empty() => r,
                // everything past this point is truncated below
                _ => break,
            };

            if !record.tag_is(ENTRY_TAG) {
                continue;
            }

            match parse_entry(&record) {
                Ok(entry) => {
                    let entry = Arc::new(entry);
                    if let Err(e) = callback(&entry, idx) {
                        scan_err = Some(e);
                        break;
                    }
                    idx += 1;
                }
                Err(e) => {
                    scan_err = Some(e);
                    break;
                }
            }
        }

        self.file
            .set_len(offset)
            .await
            .map_err(|_| anyhow!(LogError::FailedToTruncate))?;

        let removed = self.index - from_idx + 1;
        self.num_entries -= removed;
        self.index = from_idx - 1;
        self.write_pos = offset;

        match scan_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Durably records the vote by rewriting the header in place.
    pub async fn set_vote(&mut self, vote: i64) -> Result<()> {
        debug!("set_vote(vote={})", vote);
        self.vote = vote;
        self.update_log_header().await
    }

    /// Durably records the observed term and the vote cast in it.
    pub async fn set_term(&mut self, term: u64, vote: i64) -> Result<()> {
        debug!("set_term(term={}, vote={})", term, vote);
        self.term = term;
        self.vote = vote;
        self.update_log_header().await
    }

    // Rewrites the fixed-width header prelude at byte zero through a second
    // handle, then reopens the append handle. The log is the durability
    // anchor of the consensus protocol; losing it here is unrecoverable.
    async fn update_log_header(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .unwrap_or_else(|e| panic!("failed to update log header: {:?}: {}", self.path, e));

        let buf = self.encode_header();
        file.write_all(&buf)
            .await
            .map_err(|_| anyhow!(LogError::FailedToWrite))?;
        write_end(&mut file, self.no_fsync).await?;
        drop(file);

        self.file = OpenOptions::new()
            .append(true)
            .read(true)
            .open(&self.path)
            .await
            .unwrap_or_else(|e| panic!("failed to reopen log file: {:?}: {}", self.path, e));

        Ok(())
    }

    pub fn first_index(&self) -> u64 {
        self.snapshot_last_idx
    }

    pub fn current_index(&self) -> u64 {
        self.index
    }

    pub fn count(&self) -> u64 {
        self.num_entries
    }

    pub fn snapshot_last_term(&self) -> u64 {
        self.snapshot_last_term
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn vote(&self) -> i64 {
        self.vote
    }

    pub fn dbid(&self) -> &str {
        &self.dbid
    }
}
