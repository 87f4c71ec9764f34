//! Record decoding for raw change-notification reads
//!
//! One read returns back-to-back variable-length records. Each record is a
//! fixed header (watch id, flag mask, cookie, name length) followed by the
//! NUL-padded name of the changed entry. There is no record count, so the
//! decoder walks a cursor until the valid prefix is exhausted.

use crate::event::{Event, EventKind};

/// Size of the fixed record header in bytes
pub const RECORD_HEADER_SIZE: usize = 16;

/// Longest entry name the kernel reports
pub const MAX_NAME_LEN: usize = 255;

/// Entry was modified
pub const FLAG_MODIFY: u32 = 0x0000_0002;
/// Entry was created in the watched directory
pub const FLAG_CREATE: u32 = 0x0000_0100;
/// Entry was deleted from the watched directory
pub const FLAG_DELETE: u32 = 0x0000_0200;
/// Event queue overflowed and records were lost
pub const FLAG_Q_OVERFLOW: u32 = 0x0000_4000;
/// Watch was removed
pub const FLAG_IGNORED: u32 = 0x0000_8000;
/// Subject of the record is a directory
pub const FLAG_ISDIR: u32 = 0x4000_0000;

/// Events decoded from a single read
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    /// Events in the order the backend emitted them
    pub events: Vec<Event>,
    /// A trailing record ran past the valid length and was dropped
    pub truncated: bool,
    /// The backend reported that its queue overflowed
    pub overflowed: bool,
}

/// One record borrowed from the read buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawRecord<'a> {
    mask: u32,
    name: &'a [u8],
}

/// Cursor over the valid prefix of a read buffer
struct RecordCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

/// A record header or name region extends past the valid length
#[derive(Debug)]
struct Truncated {
    offset: usize,
}

impl<'a> RecordCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn next_record(&mut self) -> Result<Option<RawRecord<'a>>, Truncated> {
        if self.offset >= self.bytes.len() {
            return Ok(None);
        }

        let start = self.offset;
        let truncated = move || Truncated { offset: start };

        // Header: i32 wd, u32 mask, u32 cookie, u32 len
        let mask = read_u32(self.bytes, start + 4).ok_or_else(truncated)?;
        let name_len = read_u32(self.bytes, start + 12).ok_or_else(truncated)? as usize;

        let name_start = start + RECORD_HEADER_SIZE;
        let name_end = name_start.checked_add(name_len).ok_or_else(truncated)?;
        let name = self.bytes.get(name_start..name_end).ok_or_else(truncated)?;

        self.offset = name_end;
        Ok(Some(RawRecord { mask, name }))
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let field = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_ne_bytes(field.try_into().ok()?))
}

/// Map record flags to an event kind
///
/// Modify wins over create, create wins over delete.
pub fn kind_for(mask: u32) -> EventKind {
    if mask & FLAG_MODIFY != 0 {
        EventKind::Modified
    } else if mask & FLAG_CREATE != 0 {
        EventKind::Created
    } else if mask & FLAG_DELETE != 0 {
        EventKind::Deleted
    } else {
        EventKind::Unknown
    }
}

/// Decode the valid prefix of one read into events
///
/// Never fails: a record that runs past the end of `bytes` stops decoding
/// and the events decoded so far are returned with `truncated` set.
pub fn decode(bytes: &[u8]) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    let mut cursor = RecordCursor::new(bytes);

    loop {
        let record = match cursor.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(Truncated { offset }) => {
                tracing::trace!(
                    "Record at offset {} exceeds valid length {}",
                    offset,
                    bytes.len()
                );
                batch.truncated = true;
                break;
            }
        };

        // Nameless records carry no content change
        if record.name.is_empty() {
            if record.mask & FLAG_Q_OVERFLOW != 0 {
                batch.overflowed = true;
            }
            continue;
        }

        let name_bytes = match record.name.iter().position(|&b| b == 0) {
            Some(end) => &record.name[..end],
            None => record.name,
        };
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        batch.events.push(Event::new(
            name,
            record.mask & FLAG_ISDIR != 0,
            kind_for(record.mask),
        ));
    }

    batch
}

/// Encode one record the way the kernel lays it out
///
/// The name is NUL-terminated and padded to a multiple of the header size.
/// An empty name produces a header-only record.
pub fn encode_record(mask: u32, name: &str) -> Vec<u8> {
    let name_len = if name.is_empty() {
        0
    } else {
        (name.len() + 1).div_ceil(RECORD_HEADER_SIZE) * RECORD_HEADER_SIZE
    };

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + name_len);
    record.extend_from_slice(&1i32.to_ne_bytes());
    record.extend_from_slice(&mask.to_ne_bytes());
    record.extend_from_slice(&0u32.to_ne_bytes());
    record.extend_from_slice(&(name_len as u32).to_ne_bytes());
    record.extend_from_slice(name.as_bytes());
    record.resize(RECORD_HEADER_SIZE + name_len, 0);
    record
}
