use std::{
  fs::{self, File, OpenOptions},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  thread,
  time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam::channel::unbounded;
use fs2::FileExt;
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::{
  compaction::{CompactionManager, Compactor, IDLE_POLL_INTERVAL},
  data::{
    file_set::DataFileSet,
    log_record::{LogRecordPos, LogRecordType},
  },
  errors::{Errors, Result},
  index::{check_key_size, OffHeapIndex, PutOutcome},
  iterator::DbIterator,
  option::{IOManagerType, Options},
  recovery::{load_data_files, rebuild_index},
  stats::{DbStats, Stats},
  tombstone,
  util::file::dir_disk_size,
};

pub const FILE_LOCK_NAME: &str = "LOCK";

/// Attempts made by a read that races a compaction deleting the file it
/// was about to read from.
const READ_RETRIES: usize = 3;

/// A database instance: the data files, the index over them and the
/// compaction thread reclaiming their stale bytes.
pub struct Engine {
  pub(crate) options: Arc<Options>,
  pub(crate) files: Arc<DataFileSet>,
  pub(crate) index: Arc<OffHeapIndex>,
  pub(crate) stats: Arc<Stats>,
  compaction: Mutex<Option<CompactionManager>>,
  lock_file: File,
  closed: AtomicBool,
}

impl Engine {
  /// Opens the database in `options.dir_path`, creating the directory when
  /// missing and rebuilding the index from every data file found there.
  pub fn open(opts: Options) -> Result<Self> {
    opts.validate()?;

    let dir_path = opts.dir_path.clone();
    if !dir_path.is_dir() {
      if let Err(e) = fs::create_dir_all(&dir_path) {
        error!("create database directory err: {}", e);
        return Err(Errors::FailedToCreateDatabaseDir);
      }
    }

    let lock_file = match OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(dir_path.join(FILE_LOCK_NAME))
    {
      Ok(file) => file,
      Err(e) => {
        error!("failed to open lock file: {}", e);
        return Err(Errors::FailedToLockDatabase);
      }
    };
    if lock_file.try_lock_exclusive().is_err() {
      return Err(Errors::DatabaseIsUsing);
    }

    let started = Instant::now();
    let scan_io = if opts.mmap_at_startup {
      IOManagerType::MemoryMap
    } else {
      IOManagerType::StandardFileIO
    };
    let data_files = load_data_files(&dir_path, scan_io)?;
    let index = Arc::new(OffHeapIndex::new(&opts));
    let recovered = rebuild_index(&data_files, &index)?;
    if opts.mmap_at_startup {
      for data_file in data_files.iter() {
        data_file.set_io_manager(IOManagerType::StandardFileIO)?;
      }
    }

    let (candidates_tx, candidates_rx) = unbounded();
    let files = Arc::new(DataFileSet::open(
      &opts,
      data_files,
      recovered.next_seq,
      candidates_tx,
    )?);
    let stats = Arc::new(Stats::default());

    let (stop_tx, stop_rx) = CompactionManager::stop_channel();
    let mut compactor = Compactor::new(
      files.clone(),
      index.clone(),
      stats.clone(),
      opts.compaction_job_rate,
      stop_rx,
    );
    if opts.clean_up_tombstones_during_open {
      tombstone::clean_up_during_open(&mut compactor, &index)?;
    }

    let compaction = if opts.compaction_enabled {
      files.queue_candidates();
      Some(CompactionManager::start(compactor, candidates_rx, stop_tx)?)
    } else {
      None
    };

    info!(
      "opened database {:?} in {:?}: {} data files ({} bytes on disk), {} keys",
      dir_path,
      started.elapsed(),
      files.segment_count(),
      dir_disk_size(&dir_path),
      index.live_count()
    );

    Ok(Engine {
      options: Arc::new(opts),
      files,
      index,
      stats,
      compaction: Mutex::new(compaction),
      lock_file,
      closed: AtomicBool::new(false),
    })
  }

  fn check_open(&self) -> Result<()> {
    if self.closed.load(Ordering::Acquire) {
      return Err(Errors::DatabaseClosed);
    }
    Ok(())
  }

  /// Stores a key/value pair, replacing any previous value of the key.
  pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
    self.check_open()?;
    check_key_size(&key, self.options.key_size_bound())?;

    let pos = self.files.append(&key, &value, LogRecordType::Normal)?;
    self.update_index(&key, pos, false)?;
    Stats::incr(&self.stats.put_count);
    Ok(())
  }

  /// Deletes a key. Deleting a key that does not exist is a no-op.
  pub fn delete(&self, key: Bytes) -> Result<()> {
    self.check_open()?;
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    Stats::incr(&self.stats.delete_count);

    if self.index.get_live(&key).is_none() {
      return Ok(());
    }
    let pos = self.files.append(&key, &[], LogRecordType::Deleted)?;
    self.update_index(&key, pos, true)
  }

  /// Points the index at a freshly written record and credits whichever
  /// copy lost as stale.
  fn update_index(&self, key: &[u8], pos: LogRecordPos, tombstone: bool) -> Result<()> {
    match self.index.put_newer(key, pos, tombstone) {
      Ok(PutOutcome::Applied(Some(prev))) => {
        self
          .files
          .mark_stale(prev.pos.file_id, prev.pos.record_size(key.len()));
        Ok(())
      }
      Ok(PutOutcome::Applied(None)) => Ok(()),
      Ok(PutOutcome::Superseded) => {
        self.files.mark_stale(pos.file_id, pos.record_size(key.len()));
        Ok(())
      }
      Err(e) => {
        error!("failed to index record of file {}: {}", pos.file_id, e);
        self.files.mark_stale(pos.file_id, pos.record_size(key.len()));
        Err(e)
      }
    }
  }

  /// Returns the current value of a key.
  pub fn get(&self, key: Bytes) -> Result<Bytes> {
    self.check_open()?;
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    Stats::incr(&self.stats.get_count);
    self.read_value(&key)
  }

  pub(crate) fn read_value(&self, key: &[u8]) -> Result<Bytes> {
    for _ in 0..READ_RETRIES {
      let pos = self.index.get_live(key).ok_or(Errors::KeyNotFound)?;
      let data_file = match self.files.get(pos.file_id) {
        Some(data_file) => data_file,
        // compaction moved the key and deleted the file in between
        None => continue,
      };

      let read = data_file.read_log_record(pos.offset)?;
      if read.record.key != key || read.record.seq != pos.seq || read.record.is_tombstone() {
        error!(
          "record at file {} offset {} does not match its index entry",
          pos.file_id, pos.offset
        );
        return Err(Errors::CorruptedRecord);
      }
      return Ok(read.record.value.into());
    }
    Err(Errors::DataFileNotFound)
  }

  /// Whether a key currently has a value.
  pub fn contains_key(&self, key: &[u8]) -> bool {
    self.index.get_live(key).is_some()
  }

  /// Snapshot of every live key.
  pub fn list_keys(&self) -> Result<Vec<Bytes>> {
    self.check_open()?;
    Ok(self.index.live_keys())
  }

  /// Iterates over the keys live when the iterator is created, reading
  /// their values as it goes.
  pub fn iter(&self) -> Result<DbIterator<'_>> {
    self.check_open()?;
    Ok(DbIterator::new(self))
  }

  /// Forces unflushed appends to disk.
  pub fn sync(&self) -> Result<()> {
    self.check_open()?;
    self.files.sync()
  }

  pub fn stats(&self) -> DbStats {
    let files = self.files.all_files();
    DbStats {
      record_count: self.index.live_count(),
      tombstone_count: self.index.tombstone_count(),
      put_count: self.stats.put_count.load(Ordering::Relaxed),
      get_count: self.stats.get_count.load(Ordering::Relaxed),
      delete_count: self.stats.delete_count.load(Ordering::Relaxed),
      stale_bytes_total: self.files.stale_bytes_total(),
      segment_count: files.len(),
      size_bytes: self.files.size_bytes(),
      files_compacted: self.stats.files_compacted.load(Ordering::Relaxed),
      records_copied: self.stats.records_copied.load(Ordering::Relaxed),
      records_skipped: self.stats.records_skipped.load(Ordering::Relaxed),
      bytes_copied: self.stats.bytes_copied.load(Ordering::Relaxed),
      tombstones_reclaimed: self.stats.tombstones_reclaimed.load(Ordering::Relaxed),
      compaction_aborts: self.stats.compaction_aborts.load(Ordering::Relaxed),
      compaction_queue_len: files.iter().filter(|f| f.is_queued()).count(),
      index_segments: self.index.segment_count(),
      index_rehashes: self.index.rehash_count(),
      memory_pool_chunks: self.index.memory_chunks(),
      stale_ratio_per_file: files
        .iter()
        .map(|f| (f.get_file_id(), f.stale_ratio()))
        .collect(),
    }
  }

  pub fn reset_stats(&self) {
    self.stats.reset();
  }

  /// Blocks until no data file is waiting for compaction, or the timeout
  /// passes. Returns whether the queue drained.
  pub fn wait_for_compaction_idle(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      if self.files.queued_count() == 0 {
        return true;
      }
      if Instant::now() >= deadline {
        return false;
      }
      thread::sleep(IDLE_POLL_INTERVAL);
    }
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Stops compaction at a record boundary, flushes outstanding appends and
  /// releases the directory.
  pub fn close(&self) -> Result<()> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }

    if let Some(mut compaction) = self.compaction.lock().take() {
      compaction.stop();
    }

    let res = self.files.close();
    if let Err(e) = &res {
      error!("failed to flush data files on close: {}", e);
    }

    if self.options.clean_up_in_memory_index_on_close {
      self.index.clear();
    }

    if let Err(e) = FileExt::unlock(&self.lock_file) {
      warn!("failed to unlock database directory: {}", e);
    }
    info!("closed database {:?}", self.options.dir_path);
    res
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      error!("error whilst closing database: {}", e);
    }
  }
}
