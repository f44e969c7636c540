use crate::batch::{MessageSet, RecordBatch};
use crate::config::Options;
use crate::metrics::{LogMetrics, Timer};
use crate::segment::{parse_base_offset, Segment, LOG_SUFFIX};
use crate::{Error, Result};
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Append-only log split into size-bounded segments.
///
/// The segment list sits behind a reader/writer lock. The active segment is
/// also published through a lock-free slot so `append` and `newest_offset`
/// never wait on structural changes. Appends are serialized by their own
/// mutex, which makes concurrent writers safe. `open`, `close` and
/// `delete_all` take it as well; readers never do.
///
/// `M` is the batch codec. Recovery uses it to replay data files.
pub struct CommitLog<M: MessageSet = RecordBatch> {
    options: Options,
    path: PathBuf,
    name: String,
    segment_bytes: u64,
    segments: RwLock<Vec<Arc<Segment>>>,
    active: ArcSwapOption<Segment>,
    append_lock: Mutex<()>,
    _codec: PhantomData<fn() -> M>,
}

impl<M: MessageSet> std::fmt::Debug for CommitLog<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("segment_bytes", &self.segment_bytes)
            .field("segments", &self.segment_count())
            .finish()
    }
}

impl<M: MessageSet> CommitLog<M> {
    /// Validate options and derive the absolute path and display name.
    /// Does not touch the filesystem.
    pub fn new(options: Options) -> Result<Self> {
        if options.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("path is empty".to_string()));
        }

        let path = std::path::absolute(&options.path)
            .map_err(|e| Error::io("resolve log path", &options.path, e))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let segment_bytes = options.effective_segment_bytes();

        Ok(Self {
            options,
            path,
            name,
            segment_bytes,
            segments: RwLock::new(Vec::new()),
            active: ArcSwapOption::from(None),
            append_lock: Mutex::new(()),
            _codec: PhantomData,
        })
    }

    /// Ensure the log directory exists, creating parents as needed
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.path)
            .map_err(|e| Error::io("create log directory", &self.path, e))
    }

    /// Load the segments found in the log directory, or start a fresh log at
    /// offset 0 when there are none, and publish the newest as active.
    pub fn open(&self) -> Result<()> {
        // Lock order: append lock, then segments
        let _guard = self.append_lock.lock();
        let mut segments = self.segments.write();

        if let Some(active) = self.active.load_full() {
            if !active.is_closed() {
                return Err(Error::AlreadyOpen);
            }
        }

        let mut base_offsets = Vec::new();
        let entries = fs::read_dir(&self.path)
            .map_err(|e| Error::io("read log directory", &self.path, e))?;
        for entry in entries {
            let path = entry
                .map_err(|e| Error::io("read log directory", &self.path, e))?
                .path();
            if path.extension().is_some_and(|ext| ext == LOG_SUFFIX) {
                if let Some(base_offset) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(parse_base_offset)
                {
                    base_offsets.push(base_offset);
                }
            }
        }
        base_offsets.sort_unstable();

        let mut loaded: Vec<Arc<Segment>> = Vec::with_capacity(base_offsets.len().max(1));
        let mut rebuilt = 0usize;
        for base_offset in base_offsets {
            let segment = Segment::open(
                &self.path,
                base_offset,
                self.segment_bytes,
                self.options.sync_mode,
            )?;
            rebuilt += segment.recover::<M>()?;
            loaded.push(Arc::new(segment));
        }

        for pair in loaded.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.next_offset() > next.base_offset() {
                return Err(Error::corrupt(
                    prev.log_path(),
                    prev.position(),
                    format!(
                        "segment ends at offset {} but the next segment starts at {}",
                        prev.next_offset(),
                        next.base_offset()
                    ),
                ));
            }
            if prev.next_offset() < next.base_offset() {
                warn!(
                    "Log {} has an offset gap [{}, {})",
                    self.name,
                    prev.next_offset(),
                    next.base_offset()
                );
            }
        }

        if loaded.is_empty() {
            loaded.push(Arc::new(Segment::create(
                &self.path,
                0,
                self.segment_bytes,
                self.options.sync_mode,
            )?));
            info!("Created log {} at {:?}", self.name, self.path);
        } else {
            info!(
                "Recovered log {} with {} segment(s), offsets [{}, {}), {} index entries rebuilt",
                self.name,
                loaded.len(),
                loaded[0].base_offset(),
                loaded[loaded.len() - 1].next_offset(),
                rebuilt
            );
        }

        if rebuilt > 0 {
            LogMetrics::add_recovered_entries(rebuilt as u64);
        }
        LogMetrics::set_segment_count(loaded.len());

        self.active.store(loaded.last().cloned());
        *segments = loaded;

        Ok(())
    }

    /// Append a batch, stamping it with the next offset, and return that offset.
    ///
    /// On failure the error is [`Error::Append`] carrying the offset that was
    /// stamped into `batch`. The segment rolls back its data file, so that
    /// offset is handed out again by the next successful append.
    pub fn append(&self, batch: &mut M) -> Result<u64> {
        let timer = Timer::new();
        let _guard = self.append_lock.lock();

        let mut active = self.active_segment()?;
        if active.is_closed() {
            return Err(Error::Closed);
        }
        if batch.record_count() == 0 {
            return Err(Error::InvalidBatch("batch has no records".to_string()));
        }

        let len = batch.as_bytes().len() as u64;
        if active.is_full() || active.would_overflow(len) {
            active = self.split(&active)?;
        }

        let offset = active.next_offset();
        batch.put_offset(offset);

        match active.append(offset, batch.as_bytes(), batch.record_count()) {
            Ok(position) => {
                LogMetrics::increment_appends();
                LogMetrics::add_append_bytes(len);
                LogMetrics::record_append_latency_us(timer.elapsed_us());
                debug!(
                    "Appended offset {} at position {} of segment {} in log {}",
                    offset,
                    position,
                    active.base_offset(),
                    self.name
                );
                Ok(offset)
            }
            Err(e) => {
                LogMetrics::increment_append_errors();
                Err(Error::Append {
                    offset,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Roll to a new segment starting at the offset `current` would assign next
    fn split(&self, current: &Arc<Segment>) -> Result<Arc<Segment>> {
        // Flush current segment before rolling
        current.flush()?;

        let base_offset = current.next_offset();
        let segment = Arc::new(Segment::create(
            &self.path,
            base_offset,
            self.segment_bytes,
            self.options.sync_mode,
        )?);

        let count = {
            let mut segments = self.segments.write();
            segments.push(Arc::clone(&segment));
            segments.len()
        };
        self.active.store(Some(Arc::clone(&segment)));

        LogMetrics::increment_rotations();
        LogMetrics::set_segment_count(count);
        info!(
            "Rolled log {} to segment {} ({} segments)",
            self.name, base_offset, count
        );

        Ok(segment)
    }

    /// Read sequentially from the active segment into `buf`
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _segments = self.segments.write();
        self.active_segment()?.read(buf)
    }

    /// Copy bytes into `buf` starting at the batch that holds `offset`.
    /// Never reads past the end of that batch's segment.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let segments = self.segments.read();
        let segment = self.segment_for(&segments, offset)?;
        let (entry, _) = segment
            .batch_bounds(offset)
            .ok_or_else(|| self.out_of_range(&segments, offset))?;
        segment.read_at(entry.position, buf)
    }

    /// Decode the batch that holds `offset`
    pub fn read_batch(&self, offset: u64) -> Result<M> {
        let segments = self.segments.read();
        let segment = self.segment_for(&segments, offset)?;
        let (entry, end) = segment
            .batch_bounds(offset)
            .ok_or_else(|| self.out_of_range(&segments, offset))?;

        let mut buf = vec![0u8; (end - entry.position) as usize];
        let n = segment.read_at(entry.position, &mut buf)?;
        M::decode(&buf[..n])
    }

    fn segment_for<'a>(&self, segments: &'a [Arc<Segment>], offset: u64) -> Result<&'a Arc<Segment>> {
        let idx = segments
            .partition_point(|segment| segment.base_offset() <= offset)
            .checked_sub(1)
            .ok_or_else(|| self.out_of_range(segments, offset))?;
        let segment = &segments[idx];
        if offset >= segment.next_offset() {
            return Err(self.out_of_range(segments, offset));
        }
        Ok(segment)
    }

    fn out_of_range(&self, segments: &[Arc<Segment>], offset: u64) -> Error {
        Error::OffsetOutOfRange {
            offset,
            oldest: segments.first().map_or(0, |s| s.base_offset()),
            newest: self.newest_offset(),
        }
    }

    /// Offset the next append will receive; 0 before the log is opened
    pub fn newest_offset(&self) -> u64 {
        self.active
            .load_full()
            .map_or(0, |segment| segment.next_offset())
    }

    /// Base offset of the oldest segment; 0 before the log is opened
    pub fn oldest_offset(&self) -> u64 {
        self.segments
            .read()
            .first()
            .map_or(0, |segment| segment.base_offset())
    }

    fn active_segment(&self) -> Result<Arc<Segment>> {
        self.active.load_full().ok_or(Error::NotOpen)
    }

    /// Flush all segments to disk ensuring durability
    pub fn flush(&self) -> Result<()> {
        for segment in self.segments.read().iter() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Close every segment, stopping at the first error.
    /// Closing an already closed log does nothing.
    ///
    /// Waits for an in-flight append to finish, so no segment can be rolled
    /// after this returns.
    pub fn close(&self) -> Result<()> {
        let _guard = self.append_lock.lock();
        self.close_segments()
    }

    fn close_segments(&self) -> Result<()> {
        let segments = self.segments.write();
        for segment in segments.iter() {
            segment.close()?;
        }
        debug!("Closed log {} ({} segments)", self.name, segments.len());
        Ok(())
    }

    /// Close the log and remove its directory with every file in it.
    /// After this, `init` and `open` start a fresh log at offset 0.
    pub fn delete_all(&self) -> Result<()> {
        let _guard = self.append_lock.lock();
        self.close_segments()?;
        fs::remove_dir_all(&self.path)
            .map_err(|e| Error::io("delete log directory", &self.path, e))?;

        let mut segments = self.segments.write();
        segments.clear();
        self.active.store(None);
        LogMetrics::set_segment_count(0);

        info!("Deleted log {} at {:?}", self.name, self.path);
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Base offsets of all segments, oldest first
    pub fn segment_base_offsets(&self) -> Vec<u64> {
        self.segments
            .read()
            .iter()
            .map(|segment| segment.base_offset())
            .collect()
    }

    /// Base offset of the active segment
    pub fn active_base_offset(&self) -> Option<u64> {
        self.active.load_full().map(|segment| segment.base_offset())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Segment size threshold in effect
    pub fn segment_bytes(&self) -> u64 {
        self.segment_bytes
    }
}
