use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
  },
};

use crossbeam::channel::Sender;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
  data::{
    data_file::{DataFile, FileState},
    log_record::{LogRecord, LogRecordPos, LogRecordType, ReadLogRecord, MAX_KEY_SIZE},
  },
  errors::{Errors, Result},
  option::{IOManagerType, Options},
};

struct ActiveFile {
  file: Arc<DataFile>,
  unsynced_bytes: usize,
}

/// All data files of one database: the single active file taking appends,
/// sealed files, and files written by the compaction thread.
pub struct DataFileSet {
  dir_path: PathBuf,
  max_file_size: u64,
  flush_data_size_bytes: usize,
  sync_writes: bool,
  compaction_threshold: f64,

  files: RwLock<BTreeMap<u32, Arc<DataFile>>>,
  active: Mutex<ActiveFile>,
  next_file_id: AtomicU32,
  next_seq: AtomicU64,
  candidates: Sender<u32>,
}

impl DataFileSet {
  /// Builds the set from files recovered on open and starts a fresh active file.
  pub fn open(
    options: &Options,
    existing: Vec<Arc<DataFile>>,
    next_seq: u64,
    candidates: Sender<u32>,
  ) -> Result<Self> {
    let mut files = BTreeMap::new();
    let mut next_file_id = 0;
    for file in existing {
      file.set_state(FileState::Sealed);
      next_file_id = next_file_id.max(file.get_file_id() + 1);
      files.insert(file.get_file_id(), file);
    }

    let active = Arc::new(DataFile::new(
      &options.dir_path,
      next_file_id,
      IOManagerType::StandardFileIO,
    )?);
    active.set_state(FileState::Active);
    files.insert(next_file_id, active.clone());
    debug!("opened active data file {}", next_file_id);

    Ok(DataFileSet {
      dir_path: options.dir_path.clone(),
      max_file_size: options.max_file_size,
      flush_data_size_bytes: options.flush_data_size_bytes,
      sync_writes: options.sync_writes,
      compaction_threshold: options.compaction_threshold_per_file,
      files: RwLock::new(files),
      active: Mutex::new(ActiveFile {
        file: active,
        unsynced_bytes: 0,
      }),
      next_file_id: AtomicU32::new(next_file_id + 1),
      next_seq: AtomicU64::new(next_seq),
      candidates,
    })
  }

  pub fn dir_path(&self) -> &Path {
    &self.dir_path
  }

  pub fn max_file_size(&self) -> u64 {
    self.max_file_size
  }

  pub fn flush_data_size_bytes(&self) -> usize {
    self.flush_data_size_bytes
  }

  /// Appends a record to the active file, rotating first when it is full.
  /// The sequence number is allocated under the append lock, so records in
  /// a data file are always ordered by sequence number.
  pub fn append(&self, key: &[u8], value: &[u8], rec_type: LogRecordType) -> Result<LogRecordPos> {
    let mut record = LogRecord {
      key: key.to_vec(),
      value: value.to_vec(),
      rec_type,
      seq: 0,
    };
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
      return Err(Errors::InvalidKeySize {
        size: key.len(),
        max: MAX_KEY_SIZE,
      });
    }
    let size = record.encoded_size();
    if size > self.max_file_size {
      return Err(Errors::RecordTooLarge { size });
    }

    let mut active = self.active.lock();
    let write_off = active.file.get_write_off();
    if write_off > 0 && write_off + size > self.max_file_size {
      self.rotate_locked(&mut active)?;
    }

    record.seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
    let offset = match active.file.write(&record.encode()) {
      Ok(offset) => offset,
      Err(e) => {
        if !active.file.has_clean_tail() {
          warn!(
            "data file {} kept a partial record, moving appends to a new file",
            active.file.get_file_id()
          );
          if let Err(re) = self.rotate_locked(&mut active) {
            warn!("failed to rotate away from a partial record: {}", re);
          }
        }
        return Err(e);
      }
    };
    let pos = LogRecordPos {
      file_id: active.file.get_file_id(),
      offset,
      value_size: value.len() as u32,
      seq: record.seq,
    };

    active.unsynced_bytes += size as usize;
    let need_sync = self.sync_writes
      || (self.flush_data_size_bytes > 0 && active.unsynced_bytes >= self.flush_data_size_bytes);
    if need_sync {
      active.file.sync()?;
      active.unsynced_bytes = 0;
    }

    Ok(pos)
  }

  /// Seals the active file and opens a new one, returning the new file id.
  pub fn rotate(&self) -> Result<u32> {
    let mut active = self.active.lock();
    self.rotate_locked(&mut active)
  }

  fn rotate_locked(&self, active: &mut ActiveFile) -> Result<u32> {
    active.file.sync()?;
    active.unsynced_bytes = 0;

    let file_id = self.next_file_id.fetch_add(1, Ordering::AcqRel);
    let new_file = Arc::new(DataFile::new(
      &self.dir_path,
      file_id,
      IOManagerType::StandardFileIO,
    )?);
    new_file.set_state(FileState::Active);
    self.files.write().insert(file_id, new_file.clone());

    let old_file = std::mem::replace(&mut active.file, new_file);
    debug!(
      "rotated data file {} ({} bytes), new active file {}",
      old_file.get_file_id(),
      old_file.get_write_off(),
      file_id
    );
    self.seal(&old_file);
    Ok(file_id)
  }

  /// Allocates a new data file for compaction output.
  pub fn new_compaction_file(&self) -> Result<Arc<DataFile>> {
    let file_id = self.next_file_id.fetch_add(1, Ordering::AcqRel);
    let file = Arc::new(DataFile::new(
      &self.dir_path,
      file_id,
      IOManagerType::StandardFileIO,
    )?);
    file.set_state(FileState::CompactionOutput);
    self.files.write().insert(file_id, file.clone());
    Ok(file)
  }

  /// Makes a file read only and queues it if it is already stale enough.
  pub fn seal(&self, file: &Arc<DataFile>) {
    file.set_state(FileState::Sealed);
    self.maybe_queue(file);
  }

  pub fn active_file_id(&self) -> u32 {
    self.active.lock().file.get_file_id()
  }

  pub fn get(&self, file_id: u32) -> Option<Arc<DataFile>> {
    self.files.read().get(&file_id).cloned()
  }

  pub fn read(&self, file_id: u32, offset: u64) -> Result<ReadLogRecord> {
    let file = self.get(file_id).ok_or(Errors::DataFileNotFound)?;
    file.read_log_record(offset)
  }

  /// Credits stale bytes to a file and queues it once it crosses the threshold.
  pub fn mark_stale(&self, file_id: u32, bytes: u64) {
    if let Some(file) = self.get(file_id) {
      file.add_stale_bytes(bytes);
      self.maybe_queue(&file);
    }
  }

  fn maybe_queue(&self, file: &Arc<DataFile>) {
    if file.state() != FileState::Sealed || file.stale_bytes() == 0 {
      return;
    }
    if file.stale_ratio() >= self.compaction_threshold && file.try_mark_queued() {
      debug!(
        "data file {} queued for compaction, stale ratio {:.2}",
        file.get_file_id(),
        file.stale_ratio()
      );
      if self.candidates.send(file.get_file_id()).is_err() {
        // no compaction thread is listening
        file.clear_queued();
      }
    }
  }

  /// Queues every sealed file that is already above the threshold.
  pub fn queue_candidates(&self) {
    for file in self.all_files() {
      self.maybe_queue(&file);
    }
  }

  /// Unlinks a compacted file. The caller guarantees no index entry still
  /// references it.
  pub fn retire_and_delete(&self, file_id: u32) -> Result<()> {
    let file = match self.files.write().remove(&file_id) {
      Some(file) => file,
      None => return Err(Errors::DataFileNotFound),
    };
    file.set_state(FileState::Retired);
    if let Err(e) = file.remove() {
      file.set_state(FileState::Sealed);
      self.files.write().insert(file_id, file);
      return Err(e);
    }
    info!(
      "deleted data file {} ({} bytes, {} stale)",
      file_id,
      file.total_bytes(),
      file.stale_bytes()
    );
    Ok(())
  }

  pub fn sync(&self) -> Result<()> {
    let mut active = self.active.lock();
    active.file.sync()?;
    active.unsynced_bytes = 0;
    Ok(())
  }

  /// Flushes the active file and drops it if nothing was ever written to it.
  pub fn close(&self) -> Result<()> {
    let mut active = self.active.lock();
    active.file.sync()?;
    active.unsynced_bytes = 0;
    if active.file.get_write_off() == 0 {
      let file_id = active.file.get_file_id();
      self.files.write().remove(&file_id);
      if let Err(e) = active.file.remove() {
        warn!("failed to remove empty active file {}: {}", file_id, e);
      }
    } else {
      active.file.set_state(FileState::Sealed);
    }
    Ok(())
  }

  pub fn all_files(&self) -> Vec<Arc<DataFile>> {
    self.files.read().values().cloned().collect()
  }

  /// Files waiting for, or going through, compaction.
  pub fn queued_count(&self) -> usize {
    self.files.read().values().filter(|f| f.is_queued()).count()
  }

  pub fn segment_count(&self) -> usize {
    self.files.read().len()
  }

  pub fn stale_bytes_total(&self) -> u64 {
    self.files.read().values().map(|f| f.stale_bytes()).sum()
  }

  pub fn size_bytes(&self) -> u64 {
    self.files.read().values().map(|f| f.total_bytes()).sum()
  }
}
