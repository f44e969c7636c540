use rivven_commitlog::{
    CommitLog, Error, MessageSet, Options, RecordBatch, SyncMode, BATCH_HEADER_SIZE,
};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn options(dir: &Path, segment_bytes: u64) -> Options {
    Options::new(dir.join("partition-0"))
        .with_segment_bytes(segment_bytes)
        .with_sync_mode(SyncMode::None)
}

fn open_log(dir: &Path, segment_bytes: u64) -> CommitLog {
    let log = CommitLog::new(options(dir, segment_bytes)).unwrap();
    log.init().unwrap();
    log.open().unwrap();
    log
}

fn record(i: usize) -> RecordBatch {
    RecordBatch::new(format!("record-{:04}", i))
}

#[test]
fn test_offsets_are_contiguous_from_zero() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 1024 * 1024);

    for expected in 0..200u64 {
        let offset = log.append(&mut record(expected as usize)).unwrap();
        assert_eq!(offset, expected);
    }
    assert_eq!(log.newest_offset(), 200);
    assert_eq!(log.segment_count(), 1);
}

#[test]
fn test_rotation_has_no_gaps_or_overlaps() {
    let dir = TempDir::new().unwrap();
    let frame = record(0).len() as u64;
    // Room for exactly four frames per segment
    let log = open_log(dir.path(), frame * 4);

    let mut previous_segments = log.segment_count();
    for i in 0..25usize {
        let before = log.newest_offset();
        let offset = log.append(&mut record(i)).unwrap();
        assert_eq!(offset, before);

        let segments = log.segment_count();
        assert!(segments == previous_segments || segments == previous_segments + 1);
        if segments > previous_segments {
            // The new segment starts exactly at the offset it was created for
            assert_eq!(log.active_base_offset(), Some(offset));
        }
        previous_segments = segments;
    }

    let bases = log.segment_base_offsets();
    assert_eq!(bases, vec![0, 4, 8, 12, 16, 20, 24]);
    assert_eq!(log.oldest_offset(), 0);
    assert_eq!(log.newest_offset(), 25);
}

#[test]
fn test_appends_after_rotation_land_in_new_segment() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 100);
    let filler = || RecordBatch::new(vec![0u8; 30 - BATCH_HEADER_SIZE - 4]);

    for _ in 0..3 {
        log.append(&mut filler()).unwrap();
    }
    assert_eq!(log.active_base_offset(), Some(0));

    assert_eq!(log.append(&mut filler()).unwrap(), 3);
    assert_eq!(log.active_base_offset(), Some(3));
    assert_eq!(log.newest_offset(), 4);

    assert_eq!(log.append(&mut filler()).unwrap(), 4);
    let first_segment = log.path().join("00000000000000000000.log");
    let second_segment = log.path().join("00000000000000000003.log");
    assert_eq!(std::fs::metadata(first_segment).unwrap().len(), 90);
    assert_eq!(std::fs::metadata(second_segment).unwrap().len(), 60);
}

#[test]
fn test_oversized_batch_gets_its_own_segment() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 64);

    log.append(&mut RecordBatch::new(b"small")).unwrap();
    let big = vec![7u8; 500];
    assert_eq!(log.append(&mut RecordBatch::new(&big)).unwrap(), 1);
    assert_eq!(log.append(&mut RecordBatch::new(b"after")).unwrap(), 2);

    assert_eq!(log.segment_base_offsets(), vec![0, 1, 2]);
    let batch = log.read_batch(1).unwrap();
    assert_eq!(batch.records().next(), Some(&big[..]));
}

#[test]
fn test_read_batch_across_segments() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 128);

    for i in 0..40 {
        log.append(&mut record(i)).unwrap();
    }
    assert!(log.segment_count() > 1);

    for i in 0..40u64 {
        let batch = log.read_batch(i).unwrap();
        assert_eq!(batch.base_offset(), i);
        let expected = format!("record-{:04}", i);
        assert_eq!(batch.records().next(), Some(expected.as_bytes()));
    }

    assert!(matches!(
        log.read_batch(40),
        Err(Error::OffsetOutOfRange { offset: 40, .. })
    ));
}

#[test]
fn test_read_at_stops_at_segment_end() {
    let dir = TempDir::new().unwrap();
    let frame = record(0).len() as u64;
    let log = open_log(dir.path(), frame * 2);

    for i in 0..4 {
        log.append(&mut record(i)).unwrap();
    }

    // Offset 1 is the second and last batch of segment 0
    let mut buf = vec![0u8; 4096];
    let n = log.read_at(1, &mut buf).unwrap();
    assert_eq!(n as u64, frame);
    let batch = RecordBatch::decode(&buf[..n]).unwrap();
    assert_eq!(batch.base_offset(), 1);
}

#[test]
fn test_reopen_resumes_offsets() {
    let dir = TempDir::new().unwrap();
    {
        let log = open_log(dir.path(), 256);
        for i in 0..30 {
            log.append(&mut record(i)).unwrap();
        }
        log.close().unwrap();
    }

    let log = open_log(dir.path(), 256);
    assert_eq!(log.oldest_offset(), 0);
    assert_eq!(log.newest_offset(), 30);
    assert_eq!(log.append(&mut record(30)).unwrap(), 30);

    let batch = log.read_batch(17).unwrap();
    assert_eq!(batch.records().next(), Some(&b"record-0017"[..]));
}

#[test]
fn test_reopen_repairs_torn_write() {
    let dir = TempDir::new().unwrap();
    let active_log;
    {
        let log = open_log(dir.path(), 1024 * 1024);
        for i in 0..5 {
            log.append(&mut record(i)).unwrap();
        }
        active_log = log.path().join("00000000000000000000.log");
        log.close().unwrap();
    }

    // A crash in the middle of the sixth append
    let mut torn = record(5);
    torn.put_offset(5);
    let mut file = OpenOptions::new().append(true).open(&active_log).unwrap();
    file.write_all(&torn.as_bytes()[..BATCH_HEADER_SIZE + 2]).unwrap();
    drop(file);

    let log = open_log(dir.path(), 1024 * 1024);
    assert_eq!(log.newest_offset(), 5);
    assert_eq!(log.append(&mut record(5)).unwrap(), 5);
    assert_eq!(
        log.read_batch(5).unwrap().records().next(),
        Some(&b"record-0005"[..])
    );
}

#[test]
fn test_reopen_rejects_overlapping_segments() {
    let dir = TempDir::new().unwrap();
    {
        let log = open_log(dir.path(), 1024);
        for i in 0..5 {
            log.append(&mut record(i)).unwrap();
        }
        log.close().unwrap();
    }
    // A stray segment claiming offsets the first one already holds
    let path = dir.path().join("partition-0");
    std::fs::File::create(path.join("00000000000000000002.log")).unwrap();

    let log = CommitLog::<RecordBatch>::new(options(dir.path(), 1024)).unwrap();
    assert!(matches!(log.open(), Err(Error::Corrupt { .. })));
}

#[test]
fn test_open_ignores_unrelated_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("partition-0");
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("notes.txt"), b"hello").unwrap();
    std::fs::write(path.join("leader-epoch.log"), b"not a segment").unwrap();

    let log = open_log(dir.path(), 1024);
    assert_eq!(log.segment_base_offsets(), vec![0]);
    assert_eq!(log.append(&mut record(0)).unwrap(), 0);
}

#[test]
fn test_close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 64);
    for i in 0..6 {
        log.append(&mut record(i)).unwrap();
    }

    log.close().unwrap();
    log.close().unwrap();
    assert!(matches!(log.append(&mut record(6)), Err(Error::Closed)));
}

#[test]
fn test_delete_all_removes_every_file() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 64);
    for i in 0..10 {
        log.append(&mut record(i)).unwrap();
    }
    assert!(log.segment_count() > 1);
    let path = log.path().to_path_buf();

    log.delete_all().unwrap();
    assert!(!path.exists());

    let fresh = open_log(dir.path(), 64);
    assert_eq!(fresh.oldest_offset(), 0);
    assert_eq!(fresh.newest_offset(), 0);
    assert_eq!(fresh.append(&mut record(0)).unwrap(), 0);
}

#[test]
fn test_concurrent_appends_get_unique_contiguous_offsets() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(open_log(dir.path(), 512));

    let writers = 8;
    let per_writer = 50;
    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                (0..per_writer)
                    .map(|i| log.append(&mut record(w * per_writer + i)).unwrap())
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let offsets = handle.join().unwrap();
        // Each writer observes its own offsets in increasing order
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        seen.extend(offsets);
    }

    let total = (writers * per_writer) as u64;
    assert_eq!(seen.len() as u64, total);
    assert_eq!(seen, (0..total).collect::<HashSet<u64>>());
    assert_eq!(log.newest_offset(), total);

    for offset in 0..total {
        assert_eq!(log.read_batch(offset).unwrap().base_offset(), offset);
    }
}

#[test]
fn test_readers_run_during_appends() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(open_log(dir.path(), 256));
    log.append(&mut record(0)).unwrap();

    let writer = {
        let log = Arc::clone(&log);
        thread::spawn(move || {
            for i in 1..300 {
                log.append(&mut record(i)).unwrap();
            }
        })
    };

    let reader = {
        let log = Arc::clone(&log);
        thread::spawn(move || {
            let mut last_newest = 0;
            while last_newest < 300 {
                let newest = log.newest_offset();
                assert!(newest >= last_newest, "newest offset went backwards");
                assert_eq!(log.oldest_offset(), 0);
                if newest > 0 {
                    let batch = log.read_batch(newest - 1).unwrap();
                    assert_eq!(batch.base_offset(), newest - 1);
                }
                last_newest = newest;
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn test_default_sync_mode_is_durable() {
    let dir = TempDir::new().unwrap();
    let log: CommitLog = CommitLog::new(Options::new(dir.path().join("durable"))).unwrap();
    assert_eq!(log.options().sync_mode, SyncMode::FsyncData);
    log.init().unwrap();
    log.open().unwrap();

    for i in 0..3 {
        log.append(&mut record(i)).unwrap();
    }
    log.flush().unwrap();
    log.close().unwrap();

    let log: CommitLog = CommitLog::new(Options::new(dir.path().join("durable"))).unwrap();
    log.open().unwrap();
    assert_eq!(log.newest_offset(), 3);
}
