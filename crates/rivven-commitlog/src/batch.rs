//! Record batch framing
//!
//! A segment stores opaque frames. The log only needs a codec that can
//! report a frame's length, stamp the assigned base offset into it, and
//! (for recovery) find frame boundaries again when replaying a data file.
//!
//! # Frame layout
//!
//! ```text
//! ┌─────────────┬─────────────┬──────────────┬─────────┬─────────────────┐
//! │ base_offset │ payload_len │ record_count │  crc32  │     payload     │
//! │   u64 BE    │   u32 BE    │    u32 BE    │ u32 BE  │ payload_len B   │
//! └─────────────┴─────────────┴──────────────┴─────────┴─────────────────┘
//! ```
//!
//! The CRC covers `record_count` and `payload`, not the offset, so stamping
//! never invalidates it. The payload is a sequence of `len u32 BE | bytes`
//! records.

use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;

/// Size of the fixed `RecordBatch` header
pub const BATCH_HEADER_SIZE: usize = 20;

/// Largest payload one frame can carry, record length prefixes included
pub const MAX_PAYLOAD_BYTES: usize = u32::MAX as usize;

const RECORD_LEN_PREFIX: u64 = 4;

const OFFSET_RANGE: std::ops::Range<usize> = 0..8;
const LEN_RANGE: std::ops::Range<usize> = 8..12;
const COUNT_RANGE: std::ops::Range<usize> = 12..16;
const CRC_RANGE: std::ops::Range<usize> = 16..20;

/// Boundary information for one frame found in a data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Offset stamped into the frame
    pub base_offset: u64,
    /// Number of offsets the frame consumes
    pub record_count: u64,
    /// Total frame length in bytes, header included
    pub len: usize,
}

/// Codec seam between the commit log and the batch format written to disk
pub trait MessageSet: Sized {
    /// Serialized frame; its length is the number of bytes the append writes
    fn as_bytes(&self) -> &[u8];

    /// Number of logical offsets the batch consumes (at least 1)
    fn record_count(&self) -> u64;

    /// Stamp the assigned base offset into the serialized bytes in place
    fn put_offset(&mut self, offset: u64);

    /// Inspect the start of `buf` for a complete frame.
    ///
    /// Returns `Ok(None)` when `buf` holds an incomplete frame and an error
    /// when the bytes cannot be a valid frame.
    fn decode_frame(buf: &[u8]) -> Result<Option<Frame>>;

    /// Decode exactly one frame
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Default batch codec used by [`crate::CommitLog`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    buf: BytesMut,
}

impl RecordBatch {
    /// Batch holding a single record.
    ///
    /// # Panics
    ///
    /// Panics if `value` plus its 4-byte length prefix exceeds
    /// [`MAX_PAYLOAD_BYTES`]. [`RecordBatch::from_records`] reports the same
    /// condition as an error.
    pub fn new(value: impl AsRef<[u8]>) -> Self {
        match Self::encode(std::slice::from_ref(&value)) {
            Ok(batch) => batch,
            Err(e) => panic!("{}", e),
        }
    }

    /// Batch holding several records; fails on an empty iterator or when the
    /// payload does not fit a frame
    pub fn from_records<I, T>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let records: Vec<T> = records.into_iter().collect();
        if records.is_empty() {
            return Err(Error::InvalidBatch("batch has no records".to_string()));
        }
        Self::encode(&records)
    }

    fn encode<T: AsRef<[u8]>>(records: &[T]) -> Result<Self> {
        let payload_len = payload_len(records.iter().map(|r| r.as_ref().len()))?;
        let mut buf = BytesMut::with_capacity(BATCH_HEADER_SIZE + payload_len as usize);

        buf.put_u64(0);
        buf.put_u32(payload_len);
        // Each record adds at least its prefix to payload_len, which fits u32
        buf.put_u32(records.len() as u32);
        buf.put_u32(0);
        for record in records {
            let record = record.as_ref();
            buf.put_u32(record.len() as u32);
            buf.put_slice(record);
        }

        let crc = checksum(&buf[COUNT_RANGE.start..CRC_RANGE.start], &buf[BATCH_HEADER_SIZE..]);
        buf[CRC_RANGE].copy_from_slice(&crc.to_be_bytes());

        Ok(Self { buf })
    }

    /// Offset stamped into the batch (0 until appended)
    pub fn base_offset(&self) -> u64 {
        read_u64(&self.buf[OFFSET_RANGE])
    }

    /// Offset of the last record in the batch
    pub fn last_offset(&self) -> u64 {
        self.base_offset() + self.record_count() - 1
    }

    /// Raw payload, all records with their length prefixes
    pub fn payload(&self) -> &[u8] {
        &self.buf[BATCH_HEADER_SIZE..]
    }

    /// Iterate the records of the batch
    pub fn records(&self) -> Records<'_> {
        Records {
            remaining: self.payload(),
        }
    }

    /// Total encoded size in bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Always false; a batch carries its header
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl MessageSet for RecordBatch {
    fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn record_count(&self) -> u64 {
        read_u32(&self.buf[COUNT_RANGE]) as u64
    }

    fn put_offset(&mut self, offset: u64) {
        self.buf[OFFSET_RANGE].copy_from_slice(&offset.to_be_bytes());
    }

    fn decode_frame(buf: &[u8]) -> Result<Option<Frame>> {
        if buf.len() < BATCH_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = read_u32(&buf[LEN_RANGE]) as usize;
        let len = BATCH_HEADER_SIZE + payload_len;
        if buf.len() < len {
            return Ok(None);
        }

        let record_count = read_u32(&buf[COUNT_RANGE]) as u64;
        if record_count == 0 {
            return Err(Error::InvalidBatch("record count is zero".to_string()));
        }

        let stored_crc = read_u32(&buf[CRC_RANGE]);
        let computed_crc = checksum(
            &buf[COUNT_RANGE.start..CRC_RANGE.start],
            &buf[BATCH_HEADER_SIZE..len],
        );
        if stored_crc != computed_crc {
            return Err(Error::InvalidBatch(format!(
                "CRC mismatch (stored {:#010x}, computed {:#010x})",
                stored_crc, computed_crc
            )));
        }

        Ok(Some(Frame {
            base_offset: read_u64(&buf[OFFSET_RANGE]),
            record_count,
            len,
        }))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        match Self::decode_frame(bytes)? {
            Some(frame) if frame.len == bytes.len() => Ok(Self {
                buf: BytesMut::from(bytes),
            }),
            Some(frame) => Err(Error::InvalidBatch(format!(
                "expected {} bytes, got {}",
                frame.len,
                bytes.len()
            ))),
            None => Err(Error::InvalidBatch(format!(
                "incomplete frame of {} bytes",
                bytes.len()
            ))),
        }
    }
}

/// Iterator over the records of a [`RecordBatch`]
#[derive(Debug, Clone)]
pub struct Records<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.len() < 4 {
            return None;
        }
        let len = read_u32(&self.remaining[..4]) as usize;
        if self.remaining.len() < 4 + len {
            return None;
        }
        let (record, rest) = self.remaining[4..].split_at(len);
        self.remaining = rest;
        Some(record)
    }
}

/// Payload size for records of the given lengths, or an error when it does
/// not fit the 32-bit length field
fn payload_len(record_lens: impl IntoIterator<Item = usize>) -> Result<u32> {
    let too_large = || Error::InvalidBatch(format!("payload exceeds {} bytes", MAX_PAYLOAD_BYTES));

    let mut total: u64 = 0;
    for len in record_lens {
        total = (len as u64)
            .checked_add(RECORD_LEN_PREFIX)
            .and_then(|record| total.checked_add(record))
            .filter(|&total| total <= MAX_PAYLOAD_BYTES as u64)
            .ok_or_else(too_large)?;
    }
    u32::try_from(total).map_err(|_| too_large())
}

fn checksum(count: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(count);
    hasher.update(payload);
    hasher.finalize()
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_be_bytes(raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}
