use crate::batch::MessageSet;
use crate::config::SyncMode;
use crate::index::{Index, IndexEntry};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub(crate) const LOG_SUFFIX: &str = "log";
pub(crate) const INDEX_SUFFIX: &str = "index";

/// Largest number of offsets one segment can hold (relative offsets are u32)
const MAX_RELATIVE_OFFSET: u64 = u32::MAX as u64;

#[derive(Debug)]
struct Reader {
    file: Option<File>,
    cursor: u64,
}

/// Represents a segment of the log on disk
/// A segment consists of a .log file (data) and a .index file (dense offset index)
///
/// `position` and `next_offset` only move after both the data and the index
/// entry are written, so a concurrent observer never sees an offset whose
/// index entry is missing.
#[derive(Debug)]
pub struct Segment {
    base_offset: u64,
    max_bytes: u64,
    sync_mode: SyncMode,
    log_path: PathBuf,
    index_path: PathBuf,
    next_offset: AtomicU64,
    position: AtomicU64,
    writer: Mutex<Option<File>>,
    reader: Mutex<Reader>,
    index: Mutex<Index>,
}

/// Data file name for a segment starting at `base_offset`
pub fn log_file_name(base_offset: u64) -> String {
    format!("{:020}.{}", base_offset, LOG_SUFFIX)
}

/// Index file name for a segment starting at `base_offset`
pub fn index_file_name(base_offset: u64) -> String {
    format!("{:020}.{}", base_offset, INDEX_SUFFIX)
}

/// Parse the base offset out of a segment file stem like `00000000000000000042`
pub(crate) fn parse_base_offset(stem: &str) -> Option<u64> {
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

impl Segment {
    /// Create a brand new segment. Fails if its files already exist.
    ///
    /// A data file created here is removed again when the rest of the
    /// segment cannot be set up, so a later attempt at the same base offset
    /// starts clean.
    pub fn create(dir: &Path, base_offset: u64, max_bytes: u64, sync_mode: SyncMode) -> Result<Self> {
        let log_path = dir.join(log_file_name(base_offset));
        let index_path = dir.join(index_file_name(base_offset));

        let writer = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&log_path)
            .map_err(|e| Error::io("create segment", &log_path, e))?;

        let opened = File::open(&log_path)
            .map_err(|e| Error::io("open segment", &log_path, e))
            .and_then(|reader| Ok((reader, Index::create(&index_path, base_offset, sync_mode)?)));
        let (reader, index) = match opened {
            Ok(files) => files,
            Err(e) => {
                drop(writer);
                if let Err(remove_err) = fs::remove_file(&log_path) {
                    warn!(
                        "Failed to remove {:?} after a failed segment create: {}",
                        log_path, remove_err
                    );
                }
                return Err(e);
            }
        };

        debug!("Created segment {:?}", log_path);

        Ok(Self::assemble(
            base_offset,
            max_bytes,
            sync_mode,
            log_path,
            index_path,
            0,
            writer,
            reader,
            index,
        ))
    }

    /// Open an existing segment. Call [`Segment::recover`] before appending.
    pub fn open(dir: &Path, base_offset: u64, max_bytes: u64, sync_mode: SyncMode) -> Result<Self> {
        let log_path = dir.join(log_file_name(base_offset));
        let index_path = dir.join(index_file_name(base_offset));

        let writer = OpenOptions::new()
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::io("open segment", &log_path, e))?;
        let position = writer
            .metadata()
            .map_err(|e| Error::io("stat segment", &log_path, e))?
            .len();
        let reader = File::open(&log_path).map_err(|e| Error::io("open segment", &log_path, e))?;
        let index = Index::open(&index_path, base_offset, sync_mode)?;

        Ok(Self::assemble(
            base_offset,
            max_bytes,
            sync_mode,
            log_path,
            index_path,
            position,
            writer,
            reader,
            index,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        base_offset: u64,
        max_bytes: u64,
        sync_mode: SyncMode,
        log_path: PathBuf,
        index_path: PathBuf,
        position: u64,
        writer: File,
        reader: File,
        index: Index,
    ) -> Self {
        Self {
            base_offset,
            max_bytes,
            sync_mode,
            log_path,
            index_path,
            next_offset: AtomicU64::new(base_offset),
            position: AtomicU64::new(position),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Reader {
                file: Some(reader),
                cursor: 0,
            }),
            index: Mutex::new(index),
        }
    }

    /// Reconcile the index with the data file and resume `next_offset`.
    ///
    /// Index entries pointing past the end of the data file are dropped.
    /// The data file is then replayed from the last surviving entry; every
    /// complete frame carrying the expected offset gets its index entry
    /// rebuilt. A torn or corrupt tail is truncated. Returns the number of
    /// index entries rebuilt.
    pub fn recover<M: MessageSet>(&self) -> Result<usize> {
        let mut writer = self.writer.lock();
        let file = writer.as_mut().ok_or(Error::Closed)?;
        let mut index = self.index.lock();
        let data_len = self.position.load(Ordering::Acquire);

        let keep = index
            .entries()
            .take_while(|entry| entry.position < data_len)
            .count();
        if keep < index.len() {
            warn!(
                "Index {:?} has {} entries past the end of {:?}, dropping them",
                self.index_path,
                index.len() - keep,
                self.log_path
            );
            index.truncate_to(keep)?;
        }

        let (start, mut next_offset) = match index.last_entry() {
            Some(entry) => (entry.position, entry.offset),
            None => (0, self.base_offset),
        };

        let tail = self.read_range(start, data_len)?;
        let mut consumed = 0usize;
        let mut rebuilt = 0usize;
        let mut torn: Option<String> = None;

        while consumed < tail.len() {
            match M::decode_frame(&tail[consumed..]) {
                Ok(Some(frame)) if frame.base_offset == next_offset => {
                    let position = start + consumed as u64;
                    let indexed = index
                        .last_entry()
                        .is_some_and(|entry| entry.offset >= frame.base_offset);
                    if !indexed {
                        index.write_entry(IndexEntry {
                            offset: frame.base_offset,
                            position,
                        })?;
                        rebuilt += 1;
                    }
                    next_offset = frame.base_offset + frame.record_count;
                    consumed += frame.len;
                }
                Ok(Some(frame)) => {
                    torn = Some(format!(
                        "expected offset {}, found {}",
                        next_offset, frame.base_offset
                    ));
                    break;
                }
                Ok(None) => {
                    torn = Some("incomplete frame".to_string());
                    break;
                }
                Err(e) => {
                    torn = Some(e.to_string());
                    break;
                }
            }
        }

        let valid_end = start + consumed as u64;
        if let Some(reason) = torn {
            warn!(
                "Truncating {:?} from {} to {} bytes: {}",
                self.log_path, data_len, valid_end, reason
            );
            file.set_len(valid_end)
                .map_err(|e| Error::io("truncate segment", &self.log_path, e))?;
            self.sync_mode
                .sync(file)
                .map_err(|e| Error::io("sync segment", &self.log_path, e))?;

            let keep = index
                .entries()
                .take_while(|entry| entry.position < valid_end)
                .count();
            if keep < index.len() {
                index.truncate_to(keep)?;
            }
        }

        self.position.store(valid_end, Ordering::Release);
        self.next_offset.store(next_offset, Ordering::Release);

        Ok(rebuilt)
    }

    /// Append a stamped batch at `offset`.
    ///
    /// Writes the data, then the index entry. If either write fails the data
    /// file is truncated back to where it was, so `position` and
    /// `next_offset` stay unchanged and the offset is free for reuse.
    /// When that truncate fails as well the writer is dropped and the segment
    /// reports closed; reopening the log repairs the tail.
    /// Returns the byte position the batch was written at.
    pub fn append(&self, offset: u64, bytes: &[u8], record_count: u64) -> Result<u64> {
        let mut writer = self.writer.lock();
        let file = writer.as_mut().ok_or(Error::Closed)?;

        let position = self.position.load(Ordering::Acquire);
        if offset != self.next_offset.load(Ordering::Acquire) {
            return Err(Error::InvalidOffset(offset));
        }

        let written = file
            .write_all(bytes)
            .and_then(|()| self.sync_mode.sync(file));
        let failed = match written {
            Ok(()) => self
                .index
                .lock()
                .write_entry(IndexEntry { offset, position })
                .err(),
            Err(e) => Some(Error::io("write segment", &self.log_path, e)),
        };

        if let Some(e) = failed {
            if !self.rollback(file, position) {
                *writer = None;
            }
            return Err(e);
        }

        self.position
            .store(position + bytes.len() as u64, Ordering::Release);
        self.next_offset
            .store(offset + record_count, Ordering::Release);

        Ok(position)
    }

    /// Truncate the data file back to `position`. Returns false when the
    /// file could not be cut and no longer matches `position`.
    fn rollback(&self, file: &mut File, position: u64) -> bool {
        match file.set_len(position) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Failed to roll back {:?} to {} bytes, closing segment: {}",
                    self.log_path, position, e
                );
                false
            }
        }
    }

    /// Sequential read from the segment's read cursor, never past committed data
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock();
        let end = self.position.load(Ordering::Acquire);
        let cursor = reader.cursor;
        if cursor >= end || buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min((end - cursor) as usize);
        let file = reader.file.as_mut().ok_or(Error::Closed)?;
        file.seek(SeekFrom::Start(cursor))
            .map_err(|e| Error::io("seek segment", &self.log_path, e))?;
        let n = file
            .read(&mut buf[..len])
            .map_err(|e| Error::io("read segment", &self.log_path, e))?;

        reader.cursor += n as u64;
        Ok(n)
    }

    /// Read up to `buf.len()` committed bytes starting at byte `position`
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock();
        let end = self.position.load(Ordering::Acquire);
        if position >= end || buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min((end - position) as usize);
        let file = reader.file.as_mut().ok_or(Error::Closed)?;
        file.seek(SeekFrom::Start(position))
            .map_err(|e| Error::io("seek segment", &self.log_path, e))?;
        file.read_exact(&mut buf[..len])
            .map_err(|e| Error::io("read segment", &self.log_path, e))?;

        Ok(len)
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; end.saturating_sub(start) as usize];
        let mut reader = self.reader.lock();
        let file = reader.file.as_mut().ok_or(Error::Closed)?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| Error::io("seek segment", &self.log_path, e))?;
        file.read_exact(&mut buf)
            .map_err(|e| Error::io("read segment", &self.log_path, e))?;
        Ok(buf)
    }

    /// Nearest index entry at or before `offset`
    pub fn lookup(&self, offset: u64) -> Option<IndexEntry> {
        self.index.lock().lookup(offset)
    }

    /// Index entry of the batch holding `offset` and the byte position where
    /// that batch ends
    pub fn batch_bounds(&self, offset: u64) -> Option<(IndexEntry, u64)> {
        let (entry, next) = self.index.lock().lookup_with_next(offset)?;
        let end = match next {
            Some(next) => next.position,
            None => self.position(),
        };
        Some((entry, end))
    }

    /// True when the segment must not take further appends
    pub fn is_full(&self) -> bool {
        self.position() >= self.max_bytes
            || self.next_offset() - self.base_offset >= MAX_RELATIVE_OFFSET
    }

    /// True when writing `len` more bytes would exceed `max_bytes`.
    /// An empty segment always takes one frame, however large.
    pub fn would_overflow(&self, len: u64) -> bool {
        let position = self.position();
        position > 0 && position.saturating_add(len) > self.max_bytes
    }

    /// Flush segment data and index to disk
    pub fn flush(&self) -> Result<()> {
        if let Some(file) = self.writer.lock().as_ref() {
            file.sync_data()
                .map_err(|e| Error::io("sync segment", &self.log_path, e))?;
        }
        self.index.lock().flush()
    }

    /// Sync and release all file handles. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if let Some(file) = self.writer.lock().take() {
            file.sync_all()
                .map_err(|e| Error::io("close segment", &self.log_path, e))?;
        }
        self.reader.lock().file = None;
        self.index.lock().close()
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Offset the next append to this segment will receive
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Committed size of the data file in bytes
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn index_len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}
