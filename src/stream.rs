//! Log-stream client adapter and wire format for WAL records.
//!
//! Write-ahead-log traffic is carried by an ordered, append-only stream
//! (Kinesis-compatible). This module defines the record framing shared by
//! the stream writer and the tailer, the [`LogStream`] façade the rest of
//! the crate consumes, and an in-memory implementation used by tests.
//!
//! ## Record format
//!
//! ```text
//! [crc32: 4B][op: 1B][epoch_len: 2B][epoch][path_len: 2B][path]
//! [arg: 8B][payload_len: 4B][payload]
//! ```
//!
//! `arg` is the file offset for Append records and the final file size for
//! Close records. The CRC covers everything after the CRC field.

use crate::{CloudError, CloudResult};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stream records are capped at 1 MiB.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Records returned per read batch.
pub const READ_BATCH_RECORDS: usize = 100;

/// Byte budget per read batch.
pub const READ_BATCH_BYTES: usize = 1024 * 1024;

const OP_APPEND: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_CLOSE: u8 = 3;

/// The operation a WAL record describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    /// Append `payload` to the file at `offset`.
    Append { offset: u64, payload: Bytes },
    /// Remove the file.
    Delete,
    /// The file is complete at `file_size` bytes.
    Close { file_size: u64 },
}

impl LogOp {
    pub fn kind(&self) -> &'static str {
        match self {
            LogOp::Append { .. } => "append",
            LogOp::Delete => "delete",
            LogOp::Close { .. } => "close",
        }
    }
}

/// A single entry in the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Epoch of the writer that produced the record.
    pub epoch: String,
    /// Engine-visible path of the log file.
    pub path: String,
    pub op: LogOp,
}

impl LogRecord {
    pub fn append(epoch: &str, path: &str, offset: u64, payload: Bytes) -> Self {
        Self {
            epoch: epoch.to_string(),
            path: path.to_string(),
            op: LogOp::Append { offset, payload },
        }
    }

    pub fn delete(epoch: &str, path: &str) -> Self {
        Self {
            epoch: epoch.to_string(),
            path: path.to_string(),
            op: LogOp::Delete,
        }
    }

    pub fn close(epoch: &str, path: &str, file_size: u64) -> Self {
        Self {
            epoch: epoch.to_string(),
            path: path.to_string(),
            op: LogOp::Close { file_size },
        }
    }

    /// Serialize into the wire frame.
    pub fn encode(&self) -> CloudResult<Bytes> {
        let (op, arg, payload) = match &self.op {
            LogOp::Append { offset, payload } => (OP_APPEND, *offset, payload.as_ref()),
            LogOp::Delete => (OP_DELETE, 0, &[][..]),
            LogOp::Close { file_size } => (OP_CLOSE, *file_size, &[][..]),
        };

        let mut buf = BytesMut::with_capacity(21 + self.epoch.len() + self.path.len() + payload.len());
        buf.put_u32(0); // CRC placeholder
        buf.put_u8(op);
        buf.put_u16(self.epoch.len() as u16);
        buf.put_slice(self.epoch.as_bytes());
        buf.put_u16(self.path.len() as u16);
        buf.put_slice(self.path.as_bytes());
        buf.put_u64(arg);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        if buf.len() > MAX_RECORD_BYTES {
            return Err(CloudError::Permanent(format!(
                "log record for {} is {} bytes, limit {}",
                self.path,
                buf.len(),
                MAX_RECORD_BYTES
            )));
        }

        let crc = crc32(&buf[4..]);
        buf[0..4].copy_from_slice(&crc.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Deserialize a wire frame. Any malformation is `Corruption`.
    pub fn decode(data: &[u8]) -> CloudResult<LogRecord> {
        // Minimum frame: crc(4) + op(1) + epoch_len(2) + path_len(2) + arg(8) + payload_len(4)
        if data.len() < 21 {
            return Err(CloudError::Corruption("log record too small".to_string()));
        }
        let stored_crc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if stored_crc != crc32(&data[4..]) {
            return Err(CloudError::Corruption("log record CRC mismatch".to_string()));
        }

        let mut buf = &data[4..];
        let op = buf.get_u8();
        let epoch_len = buf.get_u16() as usize;
        if buf.remaining() < epoch_len + 2 {
            return Err(CloudError::Corruption("log record epoch truncated".to_string()));
        }
        let epoch = String::from_utf8(buf.copy_to_bytes(epoch_len).to_vec())
            .map_err(|_| CloudError::Corruption("log record epoch not utf-8".to_string()))?;
        let path_len = buf.get_u16() as usize;
        if buf.remaining() < path_len + 12 {
            return Err(CloudError::Corruption("log record path truncated".to_string()));
        }
        let path = String::from_utf8(buf.copy_to_bytes(path_len).to_vec())
            .map_err(|_| CloudError::Corruption("log record path not utf-8".to_string()))?;
        let arg = buf.get_u64();
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() != payload_len {
            return Err(CloudError::Corruption("log record payload truncated".to_string()));
        }
        let payload = buf.copy_to_bytes(payload_len);

        let op = match op {
            OP_APPEND => LogOp::Append { offset: arg, payload },
            OP_DELETE => LogOp::Delete,
            OP_CLOSE => LogOp::Close { file_size: arg },
            other => {
                return Err(CloudError::Corruption(format!("unknown log op {other}")));
            }
        };
        Ok(LogRecord { epoch, path, op })
    }
}

/// Façade over an ordered append-only log service.
///
/// Implementations must be internally thread-safe; the stream writer and
/// the tailer share one instance.
#[async_trait]
pub trait LogStream: Send + Sync {
    /// Create the stream and wait until it is active. Idempotent.
    async fn create(&self, shards: u32) -> CloudResult<()>;

    /// Append one record, returning its assigned `(shard, seqno)`.
    async fn append(&self, record: Bytes) -> CloudResult<(u32, u64)>;

    /// Read records at or after `seqno`. Finite at the current tail;
    /// resumable from any stored seqno. Bounded by the batch caps.
    async fn read_from(&self, shard: u32, seqno: u64) -> CloudResult<Vec<(u64, Bytes)>>;

    /// The seqno the next append will be assigned.
    async fn latest_seqno(&self, shard: u32) -> CloudResult<u64>;
}

/// Single-shard in-memory stream for tests.
pub struct MemoryLogStream {
    records: Mutex<Vec<Bytes>>,
    created: AtomicBool,
}

impl MemoryLogStream {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            created: AtomicBool::new(false),
        }
    }

    fn check_created(&self) -> CloudResult<()> {
        if self.created.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CloudError::NotFound("stream does not exist".to_string()))
        }
    }
}

impl Default for MemoryLogStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStream for MemoryLogStream {
    async fn create(&self, _shards: u32) -> CloudResult<()> {
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn append(&self, record: Bytes) -> CloudResult<(u32, u64)> {
        self.check_created()?;
        if record.len() > MAX_RECORD_BYTES {
            return Err(CloudError::Permanent(format!(
                "record of {} bytes exceeds stream limit",
                record.len()
            )));
        }
        let mut records = self.records.lock();
        records.push(record);
        Ok((0, (records.len() - 1) as u64))
    }

    async fn read_from(&self, shard: u32, seqno: u64) -> CloudResult<Vec<(u64, Bytes)>> {
        self.check_created()?;
        if shard != 0 {
            return Err(CloudError::Permanent(format!("no such shard {shard}")));
        }
        let records = self.records.lock();
        let mut out = Vec::new();
        let mut bytes = 0;
        for (i, rec) in records.iter().enumerate().skip(seqno as usize) {
            if out.len() >= READ_BATCH_RECORDS || bytes + rec.len() > READ_BATCH_BYTES {
                break;
            }
            bytes += rec.len();
            out.push((i as u64, rec.clone()));
        }
        Ok(out)
    }

    async fn latest_seqno(&self, _shard: u32) -> CloudResult<u64> {
        self.check_created()?;
        Ok(self.records.lock().len() as u64)
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let records = [
            LogRecord::append("ep-1", "000011.log", 128, Bytes::from_static(b"payload")),
            LogRecord::delete("ep-1", "000011.log"),
            LogRecord::close("ep-2", "000012.log", 4096),
        ];
        for record in records {
            let encoded = record.encode().unwrap();
            let decoded = LogRecord::decode(&encoded).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_decode_detects_corruption() {
        let record = LogRecord::append("e", "000011.log", 0, Bytes::from_static(b"data"));
        let mut bytes = record.encode().unwrap().to_vec();
        bytes[10] ^= 0xFF;
        let err = LogRecord::decode(&bytes).unwrap_err();
        assert!(matches!(err, CloudError::Corruption(_)));

        assert!(matches!(
            LogRecord::decode(b"tiny").unwrap_err(),
            CloudError::Corruption(_)
        ));
    }

    #[test]
    fn test_oversize_record_rejected() {
        let record = LogRecord::append(
            "e",
            "000011.log",
            0,
            Bytes::from(vec![0u8; MAX_RECORD_BYTES]),
        );
        assert!(matches!(
            record.encode().unwrap_err(),
            CloudError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_memory_stream_append_read() {
        let stream = MemoryLogStream::new();
        assert!(stream.append(Bytes::from_static(b"x")).await.is_err());

        stream.create(1).await.unwrap();
        stream.create(1).await.unwrap(); // idempotent

        let (shard, s0) = stream.append(Bytes::from_static(b"a")).await.unwrap();
        let (_, s1) = stream.append(Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(shard, 0);
        assert_eq!((s0, s1), (0, 1));

        let all = stream.read_from(0, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(&all[1].1[..], b"b");

        // Resume from a stored seqno.
        let tail = stream.read_from(0, 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, 1);

        // Finite at the current tail.
        assert!(stream.read_from(0, 2).await.unwrap().is_empty());
        assert_eq!(stream.latest_seqno(0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_memory_stream_batch_cap() {
        let stream = MemoryLogStream::new();
        stream.create(1).await.unwrap();
        for _ in 0..(READ_BATCH_RECORDS + 20) {
            stream.append(Bytes::from_static(b"r")).await.unwrap();
        }
        let batch = stream.read_from(0, 0).await.unwrap();
        assert_eq!(batch.len(), READ_BATCH_RECORDS);
        let next = stream.read_from(0, batch.last().unwrap().0 + 1).await.unwrap();
        assert_eq!(next.len(), 20);
    }
}
