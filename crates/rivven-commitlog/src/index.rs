use crate::config::SyncMode;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// 4 bytes relative offset, 8 bytes position
pub const INDEX_ENTRY_SIZE: usize = 12;

/// Maps a logical offset to the byte position of its batch in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub position: u64,
}

/// Dense, append-only offset index of one segment.
///
/// Offsets are stored relative to the segment base offset. Every entry is
/// mirrored in memory so lookups are a binary search without file I/O.
#[derive(Debug)]
pub struct Index {
    base_offset: u64,
    path: PathBuf,
    file: Option<File>,
    entries: Vec<(u32, u64)>, // Relative offset -> Position
    sync_mode: SyncMode,
}

impl Index {
    /// Create a new, empty index file. Fails if the file already exists.
    pub fn create(path: impl Into<PathBuf>, base_offset: u64, sync_mode: SyncMode) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::io("create index", &path, e))?;

        Ok(Self {
            base_offset,
            path,
            file: Some(file),
            entries: Vec::new(),
            sync_mode,
        })
    }

    /// Open an existing index file, creating it when missing.
    ///
    /// A trailing partial entry, or an entry that does not increase the
    /// offset, cuts the index at that point and the file is truncated.
    pub fn open(path: impl Into<PathBuf>, base_offset: u64, sync_mode: SyncMode) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::io("open index", &path, e))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| Error::io("read index", &path, e))?;

        let mut entries: Vec<(u32, u64)> = Vec::with_capacity(raw.len() / INDEX_ENTRY_SIZE);
        for chunk in raw.chunks_exact(INDEX_ENTRY_SIZE) {
            let mut rel = [0u8; 4];
            let mut pos = [0u8; 8];
            rel.copy_from_slice(&chunk[0..4]);
            pos.copy_from_slice(&chunk[4..12]);
            let entry = (u32::from_be_bytes(rel), u64::from_be_bytes(pos));

            if let Some(&(last_rel, last_pos)) = entries.last() {
                if entry.0 <= last_rel || entry.1 <= last_pos {
                    warn!(
                        "Index {:?} is out of order after {} entries, cutting it",
                        path,
                        entries.len()
                    );
                    break;
                }
            }
            entries.push(entry);
        }

        let mut index = Self {
            base_offset,
            path,
            file: Some(file),
            entries,
            sync_mode,
        };

        let valid_len = index.entries.len() * INDEX_ENTRY_SIZE;
        if valid_len != raw.len() {
            warn!(
                "Truncating index {:?} from {} to {} bytes",
                index.path,
                raw.len(),
                valid_len
            );
            index.truncate_to(index.entries.len())?;
        }

        Ok(index)
    }

    /// Append an entry. Offsets must be strictly increasing and at or above
    /// the base offset; the relative offset must fit in 32 bits.
    pub fn write_entry(&mut self, entry: IndexEntry) -> Result<()> {
        let relative_offset = entry
            .offset
            .checked_sub(self.base_offset)
            .and_then(|rel| u32::try_from(rel).ok())
            .ok_or(Error::InvalidOffset(entry.offset))?;

        if let Some(&(last, _)) = self.entries.last() {
            if relative_offset <= last {
                return Err(Error::InvalidOffset(entry.offset));
            }
        }

        let file = self.file.as_mut().ok_or(Error::Closed)?;

        let mut buf = BytesMut::with_capacity(INDEX_ENTRY_SIZE);
        buf.put_u32(relative_offset);
        buf.put_u64(entry.position);

        let written = file
            .write_all(&buf)
            .and_then(|()| self.sync_mode.sync(file));
        if let Err(e) = written {
            self.discard_uncommitted();
            return Err(Error::io("write index", &self.path, e));
        }

        self.entries.push((relative_offset, entry.position));
        Ok(())
    }

    /// Cut the file back to the entries held in memory, dropping whatever
    /// part of a failed write made it to disk. If that fails too the handle
    /// is released, so no later entry lands behind the stray bytes.
    fn discard_uncommitted(&mut self) {
        let committed = (self.entries.len() * INDEX_ENTRY_SIZE) as u64;
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.set_len(committed) {
            warn!(
                "Failed to roll back partial index entry in {:?}, closing it: {}",
                self.path, e
            );
            self.file = None;
        }
    }

    /// Nearest entry at or before `offset`
    pub fn lookup(&self, offset: u64) -> Option<IndexEntry> {
        self.slot(offset).map(|i| self.entry_at(i))
    }

    /// Nearest entry at or before `offset` together with the entry following it
    pub fn lookup_with_next(&self, offset: u64) -> Option<(IndexEntry, Option<IndexEntry>)> {
        let i = self.slot(offset)?;
        let next = (i + 1 < self.entries.len()).then(|| self.entry_at(i + 1));
        Some((self.entry_at(i), next))
    }

    fn slot(&self, offset: u64) -> Option<usize> {
        let relative_offset = offset.checked_sub(self.base_offset)?;
        let relative_offset = u32::try_from(relative_offset).unwrap_or(u32::MAX);

        // Binary search for the closest index entry <= relative_offset
        self.entries
            .partition_point(|&(off, _)| off <= relative_offset)
            .checked_sub(1)
    }

    fn entry_at(&self, i: usize) -> IndexEntry {
        let (rel, position) = self.entries[i];
        IndexEntry {
            offset: self.base_offset + rel as u64,
            position,
        }
    }

    pub fn last_entry(&self) -> Option<IndexEntry> {
        self.entries
            .len()
            .checked_sub(1)
            .map(|i| self.entry_at(i))
    }

    pub fn entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.entries.len()).map(move |i| self.entry_at(i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep only the first `len` entries
    pub fn truncate_to(&mut self, len: usize) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::Closed)?;
        file.set_len((len * INDEX_ENTRY_SIZE) as u64)
            .map_err(|e| Error::io("truncate index", &self.path, e))?;
        self.entries.truncate(len);
        Ok(())
    }

    /// Flush index data to disk
    pub fn flush(&self) -> Result<()> {
        match &self.file {
            Some(file) => file
                .sync_data()
                .map_err(|e| Error::io("sync index", &self.path, e)),
            None => Ok(()),
        }
    }

    /// Sync and release the file handle. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| Error::io("close index", &self.path, e))?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
