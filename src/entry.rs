use bytes::Bytes;

/// A single replicated log entry: an opaque payload plus the metadata the
/// consensus engine attaches to it. The log index is not part of the entry;
/// it is assigned by position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Election term the entry was produced in.
    pub term: u64,
    /// Application-assigned identifier, not necessarily unique.
    pub id: u64,
    /// Entry category tag, opaque to the log.
    pub kind: u32,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(term: u64, id: u64, kind: u32, data: impl Into<Bytes>) -> Self {
        LogEntry {
            term,
            id,
            kind,
            data: data.into(),
        }
    }
}
