//! WAL log record format.
//!
//! Records are laid out back to back in the log file with no header, footer,
//! or index. Each record is a one-byte tag followed by its payload:
//!
//! | Kind | Payload |
//! |---|---|
//! | ABORT / COMMIT / BEGIN | `txn_id` (u64) |
//! | UPDATE | `txn_id`, `page_id`, `length`, `offset` (4 x u64), before image, after image |
//! | CHECKPOINT / BEGIN_FUZZY / END_FUZZY | none |
//!
//! Multi-byte integers use host byte order: the format is self-consistent on
//! a single host but not portable across endianness. Tag value 0 means "no
//! record here" and terminates any scan, which is what makes the tag-last
//! append protocol atomic: a torn append leaves a zero tag and the record
//! stays invisible.

use bytes::{BufMut, Bytes, BytesMut};
use quarry_common::{BlockFile, QuarryError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Size of the record tag in bytes.
pub const TAG_LEN: u64 = 1;

/// Encoded size of an ABORT, COMMIT, or BEGIN record.
pub const TXN_RECORD_LEN: u64 = TAG_LEN + 8;

/// Encoded size of an UPDATE record header (tag plus four u64 fields),
/// excluding the two images.
pub const UPDATE_HEADER_LEN: u64 = TAG_LEN + 4 * 8;

/// Kinds of log records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum RecordKind {
    /// Reserved: an uninitialized byte, never written as a tag.
    Invalid = 0,
    /// Transaction abort.
    Abort = 1,
    /// Transaction commit.
    Commit = 2,
    /// Page update with before/after images.
    Update = 3,
    /// Transaction begin.
    Begin = 4,
    /// Sharp checkpoint marker.
    Checkpoint = 5,
    /// Fuzzy checkpoint begin marker.
    BeginFuzzyCheckpoint = 6,
    /// Fuzzy checkpoint end marker.
    EndFuzzyCheckpoint = 7,
}

impl RecordKind {
    /// Every kind that can appear in the log, in tag order.
    pub const ALL: [RecordKind; 7] = [
        RecordKind::Abort,
        RecordKind::Commit,
        RecordKind::Update,
        RecordKind::Begin,
        RecordKind::Checkpoint,
        RecordKind::BeginFuzzyCheckpoint,
        RecordKind::EndFuzzyCheckpoint,
    ];
}

impl TryFrom<u8> for RecordKind {
    type Error = QuarryError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RecordKind::Invalid),
            1 => Ok(RecordKind::Abort),
            2 => Ok(RecordKind::Commit),
            3 => Ok(RecordKind::Update),
            4 => Ok(RecordKind::Begin),
            5 => Ok(RecordKind::Checkpoint),
            6 => Ok(RecordKind::BeginFuzzyCheckpoint),
            7 => Ok(RecordKind::EndFuzzyCheckpoint),
            _ => Err(QuarryError::WalCorrupted {
                offset: 0,
                reason: format!("unknown record tag {}", value),
            }),
        }
    }
}

/// A decoded UPDATE record.
///
/// `length` is the byte length of both images; `offset` is the byte offset
/// of the updated range within the page.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub txn_id: u64,
    pub page_id: u64,
    pub length: u64,
    pub offset: u64,
    pub before_img: Bytes,
    pub after_img: Bytes,
}

impl UpdateRecord {
    /// Encodes the record payload (everything after the tag byte).
    pub fn payload(&self) -> Bytes {
        encode_update_payload(
            self.txn_id,
            self.page_id,
            self.length,
            self.offset,
            &self.before_img,
            &self.after_img,
        )
    }

    /// Returns the encoded size of this record including the tag.
    pub fn encoded_len(&self) -> u64 {
        UPDATE_HEADER_LEN + 2 * self.length
    }
}

/// Encodes the payload of an UPDATE record.
pub fn encode_update_payload(
    txn_id: u64,
    page_id: u64,
    length: u64,
    offset: u64,
    before_img: &[u8],
    after_img: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + before_img.len() + after_img.len());
    buf.put_u64_ne(txn_id);
    buf.put_u64_ne(page_id);
    buf.put_u64_ne(length);
    buf.put_u64_ne(offset);
    buf.put_slice(before_img);
    buf.put_slice(after_img);
    buf.freeze()
}

/// A log record as seen by a scan.
#[derive(Debug, Clone)]
pub enum LogRecord {
    Abort { txn_id: u64 },
    Commit { txn_id: u64 },
    Update(UpdateRecord),
    Begin { txn_id: u64 },
    Checkpoint,
    BeginFuzzyCheckpoint,
    EndFuzzyCheckpoint,
}

impl LogRecord {
    /// Returns the kind tag of this record.
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Abort { .. } => RecordKind::Abort,
            LogRecord::Commit { .. } => RecordKind::Commit,
            LogRecord::Update(_) => RecordKind::Update,
            LogRecord::Begin { .. } => RecordKind::Begin,
            LogRecord::Checkpoint => RecordKind::Checkpoint,
            LogRecord::BeginFuzzyCheckpoint => RecordKind::BeginFuzzyCheckpoint,
            LogRecord::EndFuzzyCheckpoint => RecordKind::EndFuzzyCheckpoint,
        }
    }
}

fn read_u64(file: &mut dyn BlockFile, offset: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    file.read_block(offset, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Decodes the record starting at `offset`, returning it together with the
/// offset just past it.
///
/// Returns `Ok(None)` when the scan is over: at `end`, at a zero tag (no
/// record written there), at an unknown tag (corruption is treated as
/// end-of-log), or when a record would extend past `end`.
pub fn decode_record(
    file: &mut dyn BlockFile,
    offset: u64,
    end: u64,
) -> Result<Option<(LogRecord, u64)>> {
    if offset >= end {
        return Ok(None);
    }

    let mut tag = [0u8; 1];
    file.read_block(offset, &mut tag)?;
    let kind = match RecordKind::try_from(tag[0]) {
        Ok(RecordKind::Invalid) => return Ok(None),
        Ok(kind) => kind,
        Err(_) => {
            warn!(offset, tag = tag[0], "unknown record tag, treating as end of log");
            return Ok(None);
        }
    };

    match kind {
        RecordKind::Checkpoint => Ok(Some((LogRecord::Checkpoint, offset + TAG_LEN))),
        RecordKind::BeginFuzzyCheckpoint => {
            Ok(Some((LogRecord::BeginFuzzyCheckpoint, offset + TAG_LEN)))
        }
        RecordKind::EndFuzzyCheckpoint => {
            Ok(Some((LogRecord::EndFuzzyCheckpoint, offset + TAG_LEN)))
        }
        RecordKind::Abort | RecordKind::Commit | RecordKind::Begin => {
            if offset + TXN_RECORD_LEN > end {
                warn!(offset, "truncated record, treating as end of log");
                return Ok(None);
            }
            let txn_id = read_u64(file, offset + TAG_LEN)?;
            let record = match kind {
                RecordKind::Abort => LogRecord::Abort { txn_id },
                RecordKind::Commit => LogRecord::Commit { txn_id },
                _ => LogRecord::Begin { txn_id },
            };
            Ok(Some((record, offset + TXN_RECORD_LEN)))
        }
        RecordKind::Update => {
            if offset + UPDATE_HEADER_LEN > end {
                warn!(offset, "truncated record, treating as end of log");
                return Ok(None);
            }
            let txn_id = read_u64(file, offset + TAG_LEN)?;
            let page_id = read_u64(file, offset + TAG_LEN + 8)?;
            let length = read_u64(file, offset + TAG_LEN + 16)?;
            let page_offset = read_u64(file, offset + TAG_LEN + 24)?;

            let next = offset + UPDATE_HEADER_LEN + 2 * length;
            if next > end {
                warn!(offset, "truncated record, treating as end of log");
                return Ok(None);
            }

            let mut before_img = vec![0u8; length as usize];
            file.read_block(offset + UPDATE_HEADER_LEN, &mut before_img)?;
            let mut after_img = vec![0u8; length as usize];
            file.read_block(offset + UPDATE_HEADER_LEN + length, &mut after_img)?;

            let record = UpdateRecord {
                txn_id,
                page_id,
                length,
                offset: page_offset,
                before_img: before_img.into(),
                after_img: after_img.into(),
            };
            Ok(Some((LogRecord::Update(record), next)))
        }
        RecordKind::Invalid => unreachable!("handled above"),
    }
}
