//! Background compaction.
//!
//! Sealed data files whose stale ratio crosses the configured threshold are
//! queued by the file set. A single worker thread takes them in arrival
//! order, copies every record the index still points at into its own output
//! file, swaps the index entry over only if it still points at the copied
//! record, and finally deletes the source file. Copying is metered by a
//! bytes-per-second token bucket.

use std::{
  sync::Arc,
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};

use crate::{
  data::{
    data_file::{DataFile, FileState},
    file_set::DataFileSet,
    log_record::{LogRecord, LogRecordPos},
  },
  errors::{Errors, Result},
  index::OffHeapIndex,
  stats::Stats,
  tombstone,
  util::{file::available_disk_space, rate_limiter::RateLimiter},
};

struct OutputFile {
  file: Arc<DataFile>,
  unsynced_bytes: usize,
}

/// What happened to the records of one compacted file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
  pub records_copied: u64,
  pub records_skipped: u64,
  pub bytes_copied: u64,
  pub tombstones_reclaimed: u64,
}

/// Rewrites the live part of data files. Owned by the compaction thread,
/// or used inline while the database opens.
pub struct Compactor {
  files: Arc<DataFileSet>,
  index: Arc<OffHeapIndex>,
  stats: Arc<Stats>,
  limiter: RateLimiter,
  output: Option<OutputFile>,
  stop: Receiver<()>,
}

impl Compactor {
  pub(crate) fn new(
    files: Arc<DataFileSet>,
    index: Arc<OffHeapIndex>,
    stats: Arc<Stats>,
    job_rate: u64,
    stop: Receiver<()>,
  ) -> Self {
    Compactor {
      files,
      index,
      stats,
      limiter: RateLimiter::new(job_rate),
      output: None,
      stop,
    }
  }

  /// The stop signal is the sender hanging up.
  fn stop_requested(&self) -> bool {
    matches!(self.stop.try_recv(), Err(TryRecvError::Disconnected))
  }

  fn throttle(&mut self, bytes: u64) -> Result<()> {
    let wait = self.limiter.acquire(bytes);
    if wait.is_zero() {
      return Ok(());
    }
    match self.stop.recv_timeout(wait) {
      Err(RecvTimeoutError::Timeout) => Ok(()),
      _ => Err(Errors::CompactionStopped),
    }
  }

  /// Appends a copied record to the output file, rotating it when full.
  fn append(&mut self, record: &LogRecord) -> Result<LogRecordPos> {
    let size = record.encoded_size();
    let max_file_size = self.files.max_file_size();
    let full = match &self.output {
      Some(out) => {
        let write_off = out.file.get_write_off();
        write_off > 0 && write_off + size > max_file_size
      }
      None => true,
    };
    if full {
      self.roll_output()?;
    }

    let flush_bytes = self.files.flush_data_size_bytes();
    let out = self.output.as_mut().ok_or(Errors::DataFileNotFound)?;
    let offset = match out.file.write(&record.encode()) {
      Ok(offset) => offset,
      Err(e) => {
        if !out.file.has_clean_tail() {
          warn!(
            "compaction output file {} kept a partial record, sealing it",
            out.file.get_file_id()
          );
          if let Err(se) = self.seal_output() {
            warn!("failed to seal compaction output: {}", se);
          }
        }
        return Err(e);
      }
    };
    out.unsynced_bytes += size as usize;
    if flush_bytes > 0 && out.unsynced_bytes >= flush_bytes {
      out.file.sync()?;
      out.unsynced_bytes = 0;
    }

    Ok(LogRecordPos {
      file_id: out.file.get_file_id(),
      offset,
      value_size: record.value.len() as u32,
      seq: record.seq,
    })
  }

  /// Seals the current output file (if any) and opens a fresh one.
  fn roll_output(&mut self) -> Result<()> {
    self.seal_output()?;
    let file = self.files.new_compaction_file()?;
    debug!("compaction output file {}", file.get_file_id());
    self.output = Some(OutputFile {
      file,
      unsynced_bytes: 0,
    });
    Ok(())
  }

  fn seal_output(&mut self) -> Result<()> {
    if let Some(out) = self.output.take() {
      out.file.sync()?;
      if out.file.get_write_off() == 0 {
        self.files.retire_and_delete(out.file.get_file_id())?;
      } else {
        self.files.seal(&out.file);
      }
    }
    Ok(())
  }

  fn sync_output(&mut self) -> Result<()> {
    if let Some(out) = self.output.as_mut() {
      out.file.sync()?;
      out.unsynced_bytes = 0;
    }
    Ok(())
  }

  /// Flushes and seals the output file. Called when the worker stops.
  pub fn finish(&mut self) -> Result<()> {
    self.seal_output()
  }

  /// Compacts one sealed file. On failure the source file is kept and its
  /// accounting is corrected for every record already moved out of it.
  pub fn compact_file(&mut self, file_id: u32) -> Result<CompactionReport> {
    let file = match self.files.get(file_id) {
      Some(file) if file.state() == FileState::Sealed => file,
      Some(file) => {
        file.clear_queued();
        return Ok(CompactionReport::default());
      }
      None => return Ok(CompactionReport::default()),
    };

    let live_bytes = file.total_bytes().saturating_sub(file.stale_bytes());
    if available_disk_space(self.files.dir_path()) < live_bytes {
      warn!(
        "not enough disk space to compact data file {} ({} live bytes)",
        file_id, live_bytes
      );
      file.clear_queued();
      return Ok(CompactionReport::default());
    }

    info!(
      "compacting data file {} ({} bytes, stale ratio {:.2})",
      file_id,
      file.total_bytes(),
      file.stale_ratio()
    );

    let mut relocated: Vec<(Vec<u8>, u64)> = Vec::new();
    let mut released: Vec<Vec<u8>> = Vec::new();
    let mut report = CompactionReport::default();

    match self.copy_live_records(&file, &mut relocated, &mut released, &mut report) {
      Ok(()) => {}
      Err(e) => {
        self.abort(&file, &relocated, e);
        return Err(e);
      }
    }

    // copies must be durable before the source disappears
    if let Err(e) = self
      .sync_output()
      .and_then(|_| self.files.retire_and_delete(file_id))
    {
      self.abort(&file, &relocated, e);
      return Err(e);
    }
    tombstone::release_deleted_copies(&self.index, &released)?;

    Stats::incr(&self.stats.files_compacted);
    Stats::add(&self.stats.records_copied, report.records_copied);
    Stats::add(&self.stats.records_skipped, report.records_skipped);
    Stats::add(&self.stats.bytes_copied, report.bytes_copied);
    Stats::add(&self.stats.tombstones_reclaimed, report.tombstones_reclaimed);
    info!(
      "compacted data file {}: {} records copied ({} bytes), {} skipped, {} tombstones reclaimed",
      file_id,
      report.records_copied,
      report.bytes_copied,
      report.records_skipped,
      report.tombstones_reclaimed
    );
    Ok(report)
  }

  fn copy_live_records(
    &mut self,
    file: &Arc<DataFile>,
    relocated: &mut Vec<(Vec<u8>, u64)>,
    released: &mut Vec<Vec<u8>>,
    report: &mut CompactionReport,
  ) -> Result<()> {
    let file_id = file.get_file_id();
    let mut offset = 0;
    loop {
      if self.stop_requested() {
        return Err(Errors::CompactionStopped);
      }

      let read = match file.read_log_record(offset) {
        Ok(read) => read,
        Err(Errors::ReadDataFileEOF) => return Ok(()),
        Err(e) => return Err(e),
      };
      let record = read.record;
      let here = LogRecordPos {
        file_id,
        offset,
        value_size: record.value.len() as u32,
        seq: record.seq,
      };
      offset += read.size;

      let current = self
        .index
        .get(&record.key)
        .filter(|entry| entry.pos.same_location(&here));
      let entry = match current {
        Some(entry) => entry,
        None => {
          // superseded copy, gone once this file is deleted
          report.records_skipped += 1;
          released.push(record.key);
          continue;
        }
      };

      if entry.tombstone && tombstone::is_reclaimable(&entry) {
        if tombstone::try_reclaim(&self.index, &record.key, &entry.pos) {
          report.tombstones_reclaimed += 1;
        } else {
          report.records_skipped += 1;
          released.push(record.key);
        }
        continue;
      }

      self.throttle(read.size)?;
      let new_pos = self.append(&record)?;
      if self.index.relocate(&record.key, &entry.pos, new_pos)? {
        report.records_copied += 1;
        report.bytes_copied += read.size;
        relocated.push((record.key, read.size));
      } else {
        // rewritten while we copied it, both copies are stale now
        self.files.mark_stale(new_pos.file_id, read.size);
        report.records_skipped += 1;
        released.push(record.key);
      }
    }
  }

  /// Keeps the source file valid: every record moved out of it is now a
  /// stale copy that will outlive this attempt.
  fn abort(&self, file: &Arc<DataFile>, relocated: &[(Vec<u8>, u64)], cause: Errors) {
    for (key, size) in relocated {
      file.add_stale_bytes(*size);
      if let Err(e) = self.index.add_stale_copy(key) {
        error!("failed to record stale copy after aborted compaction: {}", e);
      }
    }
    file.clear_queued();
    Stats::incr(&self.stats.compaction_aborts);
    if cause == Errors::CompactionStopped {
      info!("compaction of data file {} stopped", file.get_file_id());
    } else {
      error!(
        "compaction of data file {} aborted: {}",
        file.get_file_id(),
        cause
      );
    }
  }
}

/// Handle on the compaction thread.
pub struct CompactionManager {
  stop_tx: Option<Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl CompactionManager {
  pub(crate) fn stop_channel() -> (Sender<()>, Receiver<()>) {
    crossbeam::channel::bounded(1)
  }

  pub(crate) fn start(
    mut compactor: Compactor,
    candidates: Receiver<u32>,
    stop_tx: Sender<()>,
  ) -> Result<Self> {
    let stop_rx = compactor.stop.clone();
    let handle = thread::Builder::new()
      .name("haven-kv-compaction".to_string())
      .spawn(move || {
        info!("compaction thread started");
        let mut last_requeue = Instant::now();
        loop {
          crossbeam::select! {
            recv(stop_rx) -> _ => break,
            recv(candidates) -> msg => match msg {
              Ok(file_id) => {
                if let Err(e) = compactor.compact_file(file_id) {
                  if e == Errors::CompactionStopped {
                    break;
                  }
                  debug!("compaction of data file {} failed: {}", file_id, e);
                }
              }
              Err(_) => break,
            },
            default(REQUEUE_INTERVAL) => {}
          }
          // files dropped from the queue by an aborted or skipped attempt
          if last_requeue.elapsed() >= REQUEUE_INTERVAL {
            compactor.files.queue_candidates();
            last_requeue = Instant::now();
          }
        }
        if let Err(e) = compactor.finish() {
          error!("failed to seal compaction output: {}", e);
        }
        info!("compaction thread stopped");
      })
      .map_err(|e| {
        error!("failed to spawn compaction thread: {}", e);
        Errors::FailedToStartCompaction
      })?;

    Ok(CompactionManager {
      stop_tx: Some(stop_tx),
      handle: Some(handle),
    })
  }

  /// Signals the worker and waits until it parks between records.
  pub fn stop(&mut self) {
    drop(self.stop_tx.take());
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        error!("compaction thread panicked");
      }
    }
  }
}

impl Drop for CompactionManager {
  fn drop(&mut self) {
    self.stop();
  }
}

/// How often idle waits poll the queue.
pub(crate) const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often the worker offers every sealed file past the threshold again,
/// picking up files whose last attempt was aborted or skipped.
pub(crate) const REQUEUE_INTERVAL: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
  use crossbeam::channel::unbounded;

  use super::*;
  use crate::{
    data::log_record::LogRecordType,
    index::PutOutcome,
    option::Options,
  };

  struct Fixture {
    _dir: tempfile::TempDir,
    files: Arc<DataFileSet>,
    index: Arc<OffHeapIndex>,
    stats: Arc<Stats>,
    _stop_tx: Sender<()>,
    compactor: Compactor,
  }

  fn fixture(max_file_size: u64) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = Options::default();
    opts.dir_path = dir.path().to_path_buf();
    opts.max_file_size = max_file_size;
    opts.index_segments = 2;
    opts.number_of_records = 64;
    let (tx, _rx) = unbounded();
    let files = Arc::new(DataFileSet::open(&opts, Vec::new(), 1, tx).unwrap());
    let index = Arc::new(OffHeapIndex::new(&opts));
    let stats = Arc::new(Stats::default());
    let (stop_tx, stop_rx) = CompactionManager::stop_channel();
    let compactor = Compactor::new(files.clone(), index.clone(), stats.clone(), 0, stop_rx);
    Fixture {
      _dir: dir,
      files,
      index,
      stats,
      _stop_tx: stop_tx,
      compactor,
    }
  }

  fn put(fx: &Fixture, key: &[u8], value: &[u8]) -> LogRecordPos {
    let pos = fx.files.append(key, value, LogRecordType::Normal).unwrap();
    if let PutOutcome::Applied(Some(prev)) = fx.index.put_newer(key, pos, false).unwrap() {
      fx.files
        .mark_stale(prev.pos.file_id, prev.pos.record_size(key.len()));
    }
    pos
  }

  fn delete(fx: &Fixture, key: &[u8]) -> LogRecordPos {
    let pos = fx.files.append(key, &[], LogRecordType::Deleted).unwrap();
    if let PutOutcome::Applied(Some(prev)) = fx.index.put_newer(key, pos, true).unwrap() {
      fx.files
        .mark_stale(prev.pos.file_id, prev.pos.record_size(key.len()));
    }
    pos
  }

  fn read_value(fx: &Fixture, key: &[u8]) -> Option<Vec<u8>> {
    let pos = fx.index.get_live(key)?;
    Some(fx.files.read(pos.file_id, pos.offset).unwrap().record.value)
  }

  #[test]
  fn test_compact_file_copies_live_records_only() {
    let mut fx = fixture(1024 * 1024);
    let first = put(&fx, b"a", b"a-1");
    put(&fx, b"b", b"b-1");
    put(&fx, b"a", b"a-2");
    put(&fx, b"c", b"c-1");
    fx.files.rotate().unwrap();

    let report = fx.compactor.compact_file(first.file_id).unwrap();
    assert_eq!(report.records_copied, 3);
    assert_eq!(report.records_skipped, 1);
    assert!(fx.files.get(first.file_id).is_none());

    assert_eq!(read_value(&fx, b"a").unwrap(), b"a-2".to_vec());
    assert_eq!(read_value(&fx, b"b").unwrap(), b"b-1".to_vec());
    assert_eq!(read_value(&fx, b"c").unwrap(), b"c-1".to_vec());
    assert_ne!(fx.index.get(b"a").unwrap().pos.file_id, first.file_id);
    // the superseded copy of "a" went away with the file
    assert_eq!(fx.index.get(b"a").unwrap().stale_copies, 0);
    assert_eq!(fx.stats.files_compacted.load(std::sync::atomic::Ordering::Relaxed), 1);
  }

  #[test]
  fn test_compact_file_ignores_active_and_unknown_files() {
    let mut fx = fixture(1024 * 1024);
    let pos = put(&fx, b"a", b"1");
    assert_eq!(
      fx.compactor.compact_file(pos.file_id).unwrap(),
      CompactionReport::default()
    );
    assert_eq!(
      fx.compactor.compact_file(999).unwrap(),
      CompactionReport::default()
    );
    assert!(fx.files.get(pos.file_id).is_some());
  }

  #[test]
  fn test_tombstone_reclaimed_once_older_copies_are_gone() {
    let mut fx = fixture(1024 * 1024);
    let put_pos = put(&fx, b"k", b"value");
    fx.files.rotate().unwrap();
    let del_pos = delete(&fx, b"k");
    fx.files.rotate().unwrap();
    assert_eq!(fx.index.get(b"k").unwrap().stale_copies, 1);

    // the tombstone still guards the copy in the first file
    let report = fx.compactor.compact_file(del_pos.file_id).unwrap();
    assert_eq!(report.tombstones_reclaimed, 0);
    assert_eq!(report.records_copied, 1);
    let moved = fx.index.get(b"k").unwrap();
    assert!(moved.tombstone);

    fx.compactor.compact_file(put_pos.file_id).unwrap();
    assert_eq!(fx.index.get(b"k").unwrap().stale_copies, 0);

    // seal the output holding the tombstone, then compact it away
    fx.compactor.finish().unwrap();
    let report = fx.compactor.compact_file(moved.pos.file_id).unwrap();
    assert_eq!(report.tombstones_reclaimed, 1);
    assert!(fx.index.get(b"k").is_none());
  }

  #[test]
  fn test_output_rotates_and_is_sealed() {
    let mut fx = fixture(128);
    let mut source_ids = Vec::new();
    for i in 0..6u8 {
      source_ids.push(put(&fx, &[b'k', i], &[i; 40]).file_id);
    }
    fx.files.rotate().unwrap();
    source_ids.dedup();
    for file_id in source_ids {
      fx.compactor.compact_file(file_id).unwrap();
    }
    fx.compactor.finish().unwrap();

    for i in 0..6u8 {
      assert_eq!(read_value(&fx, &[b'k', i]).unwrap(), vec![i; 40]);
    }
    for file in fx.files.all_files() {
      assert_ne!(file.state(), FileState::CompactionOutput);
      assert!(file.total_bytes() <= 128);
    }
  }

  #[test]
  fn test_stopped_compaction_keeps_source() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = Options::default();
    opts.dir_path = dir.path().to_path_buf();
    opts.index_segments = 1;
    let (tx, _rx) = unbounded();
    let files = Arc::new(DataFileSet::open(&opts, Vec::new(), 1, tx).unwrap());
    let index = Arc::new(OffHeapIndex::new(&opts));
    let stats = Arc::new(Stats::default());
    let (stop_tx, stop_rx) = CompactionManager::stop_channel();
    let mut compactor = Compactor::new(files.clone(), index.clone(), stats.clone(), 0, stop_rx);

    let pos = files.append(b"k", b"v", LogRecordType::Normal).unwrap();
    index.put_newer(b"k", pos, false).unwrap();
    files.rotate().unwrap();

    drop(stop_tx);
    assert_eq!(
      compactor.compact_file(pos.file_id).err(),
      Some(Errors::CompactionStopped)
    );
    assert!(files.get(pos.file_id).is_some());
    assert_eq!(index.get_live(b"k").unwrap(), pos);
    assert_eq!(stats.compaction_aborts.load(std::sync::atomic::Ordering::Relaxed), 1);
  }
}
