use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LogError {
    #[error("failed to open log file")]
    FailedToOpen,
    #[error("failed to read log file")]
    FailedToRead,
    #[error("failed to write log file")]
    FailedToWrite,
    #[error("failed to seek log file")]
    FailedToSeek,
    #[error("failed to sync log file")]
    FailedToSync,
    #[error("failed to truncate log file")]
    FailedToTruncate,

    #[error("unexpected record type byte")]
    BadRecordType,
    #[error("truncated record")]
    TruncatedRecord,
    #[error("invalid decimal field")]
    BadNumber,

    #[error("invalid log header")]
    BadHeader,
    #[error("invalid log entry")]
    BadEntry,

    #[error("index out of range")]
    IndexOutOfRange,
}
