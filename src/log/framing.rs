//! Length-prefixed, line-framed record encoding shared by the log header and
//! entry records. A record is an array marker `*<N>\r\n` followed by `N` bulk
//! elements `$<L>\r\n<bytes>\r\n`. Numeric fields travel as decimal strings;
//! header numerics are zero-padded to a fixed width so the header can be
//! rewritten in place without shifting file contents.

use anyhow::{anyhow, bail, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::error::LogError;

pub const ARRAY_MARKER: u8 = b'*';
pub const BLOB_MARKER: u8 = b'$';

/// Assembles one record in memory so it reaches the file in a single write.
pub struct RecordWriter {
    buf: BytesMut,
}

impl RecordWriter {
    pub fn begin(num_elements: usize) -> Self {
        let mut buf = BytesMut::new();
        buf.put_slice(format!("*{num_elements}\r\n").as_bytes());

        RecordWriter { buf }
    }

    pub fn push_blob(&mut self, data: &[u8]) {
        self.buf.put_slice(format!("${}\r\n", data.len()).as_bytes());
        self.buf.put_slice(data);
        self.buf.put_slice(b"\r\n");
    }

    /// Unpadded decimal, used for entry fields.
    pub fn push_u64(&mut self, value: u64) {
        self.push_blob(value.to_string().as_bytes());
    }

    /// Zero-padded decimal of fixed width, used for header fields.
    pub fn push_u64_padded(&mut self, value: u64, width: usize) {
        self.push_blob(format!("{value:0width$}").as_bytes());
    }

    /// Signed variant; the sign counts toward the width.
    pub fn push_i64_padded(&mut self, value: i64, width: usize) {
        self.push_blob(format!("{value:0width$}").as_bytes());
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// One decoded record: the raw elements plus the bytes it occupied on disk.
pub struct RawRecord {
    pub elements: Vec<Bytes>,
    pub bytes_read: u64,
}

impl RawRecord {
    /// Record type tags are compared case-insensitively on read.
    pub fn tag_is(&self, tag: &[u8]) -> bool {
        self.elements
            .first()
            .map(|e| e.eq_ignore_ascii_case(tag))
            .unwrap_or(false)
    }
}

// Reads one `<marker><decimal>\r\n` line. Ok(None) on EOF before the first
// byte; anything else malformed is a framing error.
async fn read_length<R>(reader: &mut R, marker: u8) -> Result<Option<(u64, u64)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|_| anyhow!(LogError::FailedToRead))?;
    if n == 0 {
        return Ok(None);
    }

    if line[0] != marker {
        bail!(LogError::BadRecordType);
    }
    if line[line.len() - 1] != b'\n' {
        bail!(LogError::TruncatedRecord);
    }

    let digits = line[1..]
        .split(|&b| b == b'\r' || b == b'\n')
        .next()
        .unwrap_or(&[]);
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        bail!(LogError::BadNumber);
    }

    let value = std::str::from_utf8(digits)
        .expect("ascii digits")
        .parse::<u64>()
        .map_err(|_| anyhow!(LogError::BadNumber))?;

    Ok(Some((value, n as u64)))
}

/// Reads one full record. Ok(None) means clean EOF at a record boundary; a
/// record that ends mid-way is a framing error.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<RawRecord>>
where
    R: AsyncBufRead + Unpin,
{
    let Some((num_elements, mut bytes_read)) = read_length(reader, ARRAY_MARKER).await? else {
        return Ok(None);
    };

    let mut elements = Vec::with_capacity(num_elements as usize);
    for _ in 0..num_elements {
        let (len, n) = read_length(reader, BLOB_MARKER)
            .await?
            .ok_or_else(|| anyhow!(LogError::TruncatedRecord))?;
        bytes_read += n;

        let mut buf = vec![0u8; len as usize + 2];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|_| anyhow!(LogError::TruncatedRecord))?;
        if &buf[len as usize..] != b"\r\n" {
            bail!(LogError::TruncatedRecord);
        }
        buf.truncate(len as usize);
        bytes_read += len + 2;

        elements.push(Bytes::from(buf));
    }

    Ok(Some(RawRecord {
        elements,
        bytes_read,
    }))
}

/// Parses a fully consumed unsigned decimal; leading zeros are fine (padded
/// header fields), trailing garbage is not.
pub fn parse_u64(buf: &[u8]) -> Result<u64> {
    if buf.is_empty() || !buf.iter().all(|b| b.is_ascii_digit()) {
        bail!(LogError::BadNumber);
    }

    std::str::from_utf8(buf)
        .expect("ascii digits")
        .parse::<u64>()
        .map_err(|_| anyhow!(LogError::BadNumber))
}

pub fn parse_i64(buf: &[u8]) -> Result<i64> {
    let digits = buf.strip_prefix(b"-").unwrap_or(buf);
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        bail!(LogError::BadNumber);
    }

    std::str::from_utf8(buf)
        .expect("ascii digits")
        .parse::<i64>()
        .map_err(|_| anyhow!(LogError::BadNumber))
}
