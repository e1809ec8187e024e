//! UNDO record encoding.
//!
//! Records are packed forward on a page and decoded backwards:
//!
//! ```text
//! [payload words ..] [prev_lsn_hi, prev_lsn_lo]? [header]
//!
//! header = (record_type | NEXT_LSN?) << 16 | record_len
//! ```
//!
//! `record_len` counts every word of the record including the header.
//! When `NEXT_LSN` is set the record preceding this one in the log has
//! the LSN `lsn - 1`, otherwise the two words before the header hold the
//! predecessor's LSN. Every record after the first part of a composite
//! entry shares the LSN of the entry and therefore stores it explicitly.

use super::{Lsn, join_lsn, split_lsn};

/// Flag marking the predecessor of a record as having the LSN `lsn - 1`.
pub const NEXT_LSN_FLAG: u16 = 0x8000;
/// The maximum number of words a single record can span.
pub const MAX_RECORD_WORDS: usize = u16::MAX as usize;

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
/// The type of UNDO record.
pub enum UndoRecordType {
    /// The first checkpoint marker written by a new logfile group.
    LcpFirst = 1,
    /// A checkpoint start marker, payload `[lcp_id]`.
    Lcp = 2,
    /// Undo a tuple allocation.
    TupAlloc = 3,
    /// Undo a tuple update.
    TupUpdate = 4,
    /// Undo a tuple free.
    TupFree = 5,
    /// Undo a table create.
    TupCreate = 6,
    /// Undo a table drop.
    TupDrop = 7,
    /// Undo an extent allocation.
    TupAllocExtent = 8,
    /// Undo an extent free.
    TupFreeExtent = 9,
    /// The first part of a multi part update.
    TupFirstUpdatePart = 10,
    /// A continuation part of a multi part update.
    TupUpdatePart = 11,
    /// A continuation part of a multi part free.
    TupFreePart = 12,
    /// A local checkpoint first marker, payload `[lcp_id, local_lcp_id]`.
    LocalLcpFirst = 13,
    /// A local checkpoint marker, payload `[lcp_id, local_lcp_id]`.
    LocalLcp = 14,
    /// Padding filling the remainder of a page.
    Noop = 0x7FFE,
    /// Marks the end of the log, execution never passes it.
    End = 0x7FFF,
}

impl UndoRecordType {
    /// Get the [UndoRecordType] from its encoded value.
    pub fn from_u16(value: u16) -> Option<Self> {
        let record_type = match value {
            1 => Self::LcpFirst,
            2 => Self::Lcp,
            3 => Self::TupAlloc,
            4 => Self::TupUpdate,
            5 => Self::TupFree,
            6 => Self::TupCreate,
            7 => Self::TupDrop,
            8 => Self::TupAllocExtent,
            9 => Self::TupFreeExtent,
            10 => Self::TupFirstUpdatePart,
            11 => Self::TupUpdatePart,
            12 => Self::TupFreePart,
            13 => Self::LocalLcpFirst,
            14 => Self::LocalLcp,
            0x7FFE => Self::Noop,
            0x7FFF => Self::End,
            _ => return None,
        };
        Some(record_type)
    }

    /// Returns if the record marks the start of a checkpoint.
    pub fn is_lcp_marker(&self) -> bool {
        matches!(
            self,
            Self::LcpFirst | Self::Lcp | Self::LocalLcpFirst | Self::LocalLcp
        )
    }

    /// Returns if the record changes disk data and must be applied on restart.
    pub fn is_data_record(&self) -> bool {
        !self.is_lcp_marker() && !matches!(self, Self::Noop | Self::End)
    }
}

#[derive(Debug, Copy, Clone)]
/// A single part of an UNDO entry to be appended to the log.
pub struct UndoEntry<'a> {
    /// The record type.
    pub record_type: UndoRecordType,
    /// The record payload.
    pub payload: &'a [u32],
}

impl<'a> UndoEntry<'a> {
    /// Creates a new [UndoEntry].
    pub const fn new(record_type: UndoRecordType, payload: &'a [u32]) -> Self {
        Self {
            record_type,
            payload,
        }
    }
}

#[inline]
/// Pack a record header word.
pub fn pack_header(record_type: UndoRecordType, next_lsn: bool, len: usize) -> u32 {
    debug_assert!(len > 0 && len <= MAX_RECORD_WORDS);
    let mut type_bits = record_type as u16;
    if next_lsn {
        type_bits |= NEXT_LSN_FLAG;
    }
    ((type_bits as u32) << 16) | len as u32
}

#[inline]
/// Unpack a record header word into its raw type, next LSN flag and length.
pub fn unpack_header(header: u32) -> (u16, bool, usize) {
    let type_bits = (header >> 16) as u16;
    let len = (header & 0xFFFF) as usize;
    (type_bits & !NEXT_LSN_FLAG, type_bits & NEXT_LSN_FLAG != 0, len)
}

/// The number of log words required to store the composite entry.
pub fn entry_words(parts: &[UndoEntry]) -> usize {
    let payload: usize = parts.iter().map(|part| part.payload.len() + 1).sum();
    payload + 2 * parts.len().saturating_sub(1)
}

/// Encode the parts of an entry sharing the LSN `lsn` into `out`.
///
/// `out` must be exactly [entry_words] long.
pub fn encode_entry(lsn: Lsn, parts: &[UndoEntry], out: &mut [u32]) {
    debug_assert_eq!(out.len(), entry_words(parts));

    let (lsn_hi, lsn_lo) = split_lsn(lsn);
    let mut cursor = 0;
    for (idx, part) in parts.iter().enumerate() {
        let payload_len = part.payload.len();
        out[cursor..cursor + payload_len].copy_from_slice(part.payload);
        cursor += payload_len;

        if idx == 0 {
            out[cursor] = pack_header(part.record_type, true, payload_len + 1);
            cursor += 1;
        } else {
            out[cursor] = lsn_hi;
            out[cursor + 1] = lsn_lo;
            out[cursor + 2] = pack_header(part.record_type, false, payload_len + 3);
            cursor += 3;
        }
    }
}

/// Encode a NOOP padding record spanning `len` words into `out`.
pub fn encode_noop(out: &mut [u32]) {
    let len = out.len();
    debug_assert!(len > 0);
    out[..len - 1].fill(0);
    out[len - 1] = pack_header(UndoRecordType::Noop, false, len);
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
/// A record could not be decoded from the page.
pub enum RecordDecodeError {
    #[error("record length {len} at word {position} is out of bounds")]
    /// The record length runs outside of the page.
    InvalidLength {
        /// The end position of the record.
        position: usize,
        /// The decoded record length.
        len: usize,
    },
    #[error("unknown record type: {0}")]
    /// The record type is not known.
    UnknownType(u16),
    #[error("predecessor LSN {prev} is newer than the record LSN {lsn}")]
    /// The explicit predecessor LSN breaks the log ordering.
    LsnOrdering {
        /// The LSN of the record.
        lsn: Lsn,
        /// The predecessor LSN stored in the record.
        prev: Lsn,
    },
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// A record decoded from a page.
pub struct DecodedRecord {
    /// The LSN of the record.
    pub lsn: Lsn,
    /// The record type.
    pub record_type: UndoRecordType,
    /// The word range of the payload on the page.
    pub payload: std::ops::Range<usize>,
}

/// Iterates the records of a page from the newest to the oldest.
pub struct RecordCursor<'a> {
    words: &'a [u32],
    position: usize,
    current_lsn: Lsn,
}

impl<'a> RecordCursor<'a> {
    /// Create a new cursor over the record words of a page with the page LSN `lsn`.
    pub fn new(words: &'a [u32], lsn: Lsn) -> Self {
        Self {
            words,
            position: words.len(),
            current_lsn: lsn,
        }
    }

    /// The LSN the next decoded record is expected to have.
    ///
    /// Once the page is exhausted this is the LSN expected on the previous page.
    pub fn expected_lsn(&self) -> Lsn {
        self.current_lsn
    }

    /// The word position of the cursor.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns the payload words of a decoded record.
    pub fn payload(&self, record: &DecodedRecord) -> &'a [u32] {
        &self.words[record.payload.clone()]
    }

    /// Decode the next record moving backwards.
    pub fn next_back(&mut self) -> Option<Result<DecodedRecord, RecordDecodeError>> {
        if self.position == 0 {
            return None;
        }
        Some(self.decode_next())
    }

    fn decode_next(&mut self) -> Result<DecodedRecord, RecordDecodeError> {
        let end = self.position;
        let (type_bits, next_lsn, len) = unpack_header(self.words[end - 1]);
        if len == 0 || len > end {
            return Err(RecordDecodeError::InvalidLength { position: end, len });
        }

        let record_type = UndoRecordType::from_u16(type_bits)
            .ok_or(RecordDecodeError::UnknownType(type_bits))?;
        let start = end - len;
        let lsn = self.current_lsn;

        if record_type == UndoRecordType::Noop {
            self.position = start;
            return Ok(DecodedRecord {
                lsn,
                record_type,
                payload: start..start,
            });
        }

        let payload = if next_lsn {
            self.current_lsn = lsn.saturating_sub(1);
            start..end - 1
        } else {
            if len < 3 {
                return Err(RecordDecodeError::InvalidLength { position: end, len });
            }
            let prev = join_lsn(self.words[end - 3], self.words[end - 2]);
            if prev > lsn {
                return Err(RecordDecodeError::LsnOrdering { lsn, prev });
            }
            self.current_lsn = prev;
            start..end - 3
        };

        self.position = start;
        Ok(DecodedRecord {
            lsn,
            record_type,
            payload,
        })
    }
}
