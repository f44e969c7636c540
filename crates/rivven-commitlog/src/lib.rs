//! Segmented, offset-indexed commit log
//!
//! One [`CommitLog`] owns one ordered log in one directory. Batches are
//! stamped with monotonically increasing offsets and written to size-bounded
//! segments; each segment keeps a dense index from offset to byte position so
//! reads by offset seek directly to the batch.
//!
//! ```text
//! log-dir/
//! ├── 00000000000000000000.log     data (record batch frames)
//! ├── 00000000000000000000.index   offset -> position
//! ├── 00000000000000000003.log
//! └── 00000000000000000003.index
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use rivven_commitlog::{CommitLog, Options, RecordBatch};
//!
//! # fn main() -> rivven_commitlog::Result<()> {
//! let log: CommitLog = CommitLog::new(Options::new("/var/lib/rivven/orders-0"))?;
//! log.init()?;
//! log.open()?;
//!
//! let offset = log.append(&mut RecordBatch::new(b"hello"))?;
//! let batch = log.read_batch(offset)?;
//! assert_eq!(batch.records().next(), Some(&b"hello"[..]));
//!
//! log.close()?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod index;
pub mod log;
pub mod metrics;
pub mod segment;

pub use batch::{Frame, MessageSet, RecordBatch, Records, BATCH_HEADER_SIZE, MAX_PAYLOAD_BYTES};
pub use config::{Options, SyncMode, DEFAULT_SEGMENT_BYTES};
pub use error::{Error, Result};
pub use index::{Index, IndexEntry, INDEX_ENTRY_SIZE};
pub use log::CommitLog;
pub use segment::Segment;
