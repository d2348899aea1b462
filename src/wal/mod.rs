//! Durable Batch Log - Record Format, Writer, Reader
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "TAWL" (4 bytes)        │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! │ - sequence: u64 LE               │
//! ├──────────────────────────────────┤
//! │ Record 0                         │
//! │ - data_length: u32 LE            │
//! │ - received_at: u64 LE (ms)       │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - data: bincode(key, body)       │
//! ├──────────────────────────────────┤
//! │ Record 1 ...                     │
//! └──────────────────────────────────┘
//! ```
//!
//! One record per buffered message. A record cut short at the end of the file
//! (crash mid-append) is dropped. A complete record with a bad checksum is
//! corruption and fails recovery; only the final record of a file gets the
//! benefit of the doubt, since a torn write can leave it full-length.

pub mod store;

use crate::clock::Timestamp;
use crate::error::LogError;
use crate::message::Message;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use store::{LogFileReader, LogFileWriter};

pub use store::{InMemoryLogStore, LocalLogStore, LogStore};

pub const LOG_MAGIC: [u8; 4] = *b"TAWL";
pub const LOG_VERSION: u8 = 1;
pub const LOG_HEADER_SIZE: usize = 16;
/// data_length(4) + received_at(8) + checksum(4)
pub const LOG_RECORD_OVERHEAD: usize = 16;

#[derive(Serialize, Deserialize)]
struct RecordPayload {
    key: String,
    body: Vec<u8>,
}

/// One message as stored in the log
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub data: Vec<u8>,
    pub received_at: u64,
    pub checksum: u32,
}

impl LogRecord {
    pub fn from_message(message: &Message) -> Result<Self, LogError> {
        let payload = RecordPayload {
            key: message.key.clone(),
            body: message.body.to_vec(),
        };
        let data = bincode::serialize(&payload)
            .map_err(|e| LogError::Corruption(format!("serialize: {}", e)))?;
        let checksum = crc32fast::hash(&data);

        Ok(LogRecord {
            data,
            received_at: message.received_at.as_millis(),
            checksum,
        })
    }

    pub fn to_message(&self) -> Result<Message, LogError> {
        let payload: RecordPayload = bincode::deserialize(&self.data)
            .map_err(|e| LogError::Corruption(format!("deserialize: {}", e)))?;
        Ok(Message::recovered(
            payload.key,
            Bytes::from(payload.body),
            Timestamp::from_millis(self.received_at),
        ))
    }

    pub fn validate(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        let data_len = u32::try_from(self.data.len())
            .map_err(|_| LogError::Corruption(format!("record of {} bytes", self.data.len())))?;
        let mut buf = Vec::with_capacity(LOG_RECORD_OVERHEAD + self.data.len());

        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&self.received_at.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&self.data);

        debug_assert_eq!(buf.len(), LOG_RECORD_OVERHEAD + self.data.len());
        Ok(buf)
    }

    /// Decode one record from the front of `data`.
    ///
    /// Returns `Ok(None)` if the bytes run out before the record is complete.
    /// A checksum mismatch is returned as `Err`; the caller decides whether it
    /// is a torn tail or corruption.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>, LogError> {
        if data.len() < LOG_RECORD_OVERHEAD {
            return Ok(None);
        }

        let data_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let received_at = u64::from_le_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        let checksum = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);

        let total_size = match LOG_RECORD_OVERHEAD.checked_add(data_len) {
            Some(total) if total <= data.len() => total,
            _ => return Ok(None),
        };

        let record = LogRecord {
            data: data[LOG_RECORD_OVERHEAD..total_size].to_vec(),
            received_at,
            checksum,
        };
        if !record.validate() {
            return Err(LogError::Corruption(format!(
                "checksum mismatch in record received at {}",
                received_at
            )));
        }

        Ok(Some((record, total_size)))
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Writes header + records to one log file
pub struct LogWriter<W: LogFileWriter> {
    writer: W,
    sequence: u64,
    record_count: u64,
}

impl<W: LogFileWriter> LogWriter<W> {
    /// Create a writer, writing the header immediately
    pub fn new(mut writer: W, sequence: u64) -> Result<Self, LogError> {
        let mut header = [0u8; LOG_HEADER_SIZE];
        header[0..4].copy_from_slice(&LOG_MAGIC);
        header[4] = LOG_VERSION;
        header[8..16].copy_from_slice(&sequence.to_le_bytes());

        writer.append(&header)?;
        writer.sync()?;

        Ok(LogWriter {
            writer,
            sequence,
            record_count: 0,
        })
    }

    /// Append a record (does NOT fsync)
    pub fn append(&mut self, record: &LogRecord) -> Result<u64, LogError> {
        let encoded = record.encode()?;
        let offset = self.writer.append(&encoded)?;
        self.record_count = self.record_count.saturating_add(1);
        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<(), LogError> {
        self.writer.sync()
    }

    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Records read back from one log file
#[derive(Debug, Default)]
pub struct RecoveredLog {
    pub sequence: u64,
    pub records: Vec<LogRecord>,
    /// Bytes dropped from the end of the file (crash mid-append)
    pub torn_tail_bytes: usize,
}

pub struct LogReader {
    data: Vec<u8>,
    sequence: u64,
}

impl LogReader {
    /// Open a log file for reading. Validates the header.
    ///
    /// A file shorter than a header holds no records (crash while creating it)
    /// and reads back as empty.
    pub fn open<R: LogFileReader>(mut reader: R) -> Result<Self, LogError> {
        let data = reader.read_all()?;

        if data.len() < LOG_HEADER_SIZE {
            return Ok(LogReader {
                data: Vec::new(),
                sequence: 0,
            });
        }

        if data[0..4] != LOG_MAGIC {
            return Err(LogError::Corruption(format!(
                "invalid log magic: {:?}",
                &data[0..4]
            )));
        }

        let version = data[4];
        if version != LOG_VERSION {
            return Err(LogError::Corruption(format!(
                "unsupported log version: {}",
                version
            )));
        }

        let sequence = u64::from_le_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);

        Ok(LogReader { data, sequence })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Read every record, tolerating a torn final record.
    pub fn records(&self) -> Result<RecoveredLog, LogError> {
        let mut recovered = RecoveredLog {
            sequence: self.sequence,
            ..RecoveredLog::default()
        };
        if self.data.is_empty() {
            return Ok(recovered);
        }

        let mut offset = LOG_HEADER_SIZE;
        while offset < self.data.len() {
            let rest = &self.data[offset..];
            match LogRecord::decode(rest) {
                Ok(Some((record, consumed))) => {
                    recovered.records.push(record);
                    offset += consumed;
                }
                Ok(None) => {
                    recovered.torn_tail_bytes = rest.len();
                    break;
                }
                Err(e) => {
                    let declared =
                        u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                    if LOG_RECORD_OVERHEAD + declared == rest.len() {
                        recovered.torn_tail_bytes = rest.len();
                        break;
                    }
                    return Err(e);
                }
            }
        }

        Ok(recovered)
    }
}
