use std::{
  fs::{self, OpenOptions},
  path::{Path, PathBuf},
  sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use derive_more::Display;
use log::error;
use parking_lot::RwLock;

use crate::{
  data::log_record::{ReadLogRecord, RecordHeader, HEADER_SIZE},
  errors::{Errors, Result},
  fio::{new_io_manager, IOManager},
  option::IOManagerType,
};

pub const DATA_FILE_NAME_SUFFIX: &str = ".data";

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
  /// Receives foreground appends.
  Active,

  /// Receives records copied by the compaction thread.
  CompactionOutput,

  /// Read only, tracked for compaction.
  Sealed,

  /// Compacted; deleted as soon as its live data lives elsewhere.
  Retired,
}

/// One append-only segment of the database, with its space accounting.
pub struct DataFile {
  file_id: u32,
  path: PathBuf,
  write_off: AtomicU64,
  stale_bytes: AtomicU64,
  state: RwLock<FileState>,
  queued: AtomicBool,
  io_manager: RwLock<Box<dyn IOManager>>,
}

impl DataFile {
  pub fn new<P>(dir_path: P, file_id: u32, io_type: IOManagerType) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    let path = get_data_file_name(&dir_path, file_id);
    let io_manager = new_io_manager(&path, io_type)?;
    let write_off = io_manager.size();

    Ok(DataFile {
      file_id,
      path,
      write_off: AtomicU64::new(write_off),
      stale_bytes: AtomicU64::new(0),
      state: RwLock::new(FileState::Sealed),
      queued: AtomicBool::new(false),
      io_manager: RwLock::new(io_manager),
    })
  }

  pub fn get_file_id(&self) -> u32 {
    self.file_id
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn get_write_off(&self) -> u64 {
    self.write_off.load(Ordering::Acquire)
  }

  pub fn total_bytes(&self) -> u64 {
    self.get_write_off()
  }

  pub fn stale_bytes(&self) -> u64 {
    self.stale_bytes.load(Ordering::Acquire)
  }

  /// Credits `bytes` as stale, never letting stale bytes exceed the file size.
  /// Returns the new stale total.
  pub fn add_stale_bytes(&self, bytes: u64) -> u64 {
    let total = self.total_bytes();
    let prev = self
      .stale_bytes
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |stale| {
        Some(stale.saturating_add(bytes).min(total))
      })
      .unwrap_or_else(|v| v);
    prev.saturating_add(bytes).min(total)
  }

  pub fn stale_ratio(&self) -> f64 {
    let total = self.total_bytes();
    if total == 0 {
      return 0.0;
    }
    self.stale_bytes() as f64 / total as f64
  }

  pub fn state(&self) -> FileState {
    *self.state.read()
  }

  pub fn set_state(&self, state: FileState) {
    *self.state.write() = state;
  }

  /// Marks the file as queued for compaction, false if it already was.
  pub fn try_mark_queued(&self) -> bool {
    self
      .queued
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  pub fn clear_queued(&self) {
    self.queued.store(false, Ordering::Release);
  }

  pub fn is_queued(&self) -> bool {
    self.queued.load(Ordering::Acquire)
  }

  /// Reads the record starting at `offset`.
  pub fn read_log_record(&self, offset: u64) -> Result<ReadLogRecord> {
    let size = self.get_write_off();
    if offset >= size {
      return Err(Errors::ReadDataFileEOF);
    }
    if offset + HEADER_SIZE as u64 > size {
      return Err(Errors::IncompleteRecord);
    }

    let io_manager = self.io_manager.read();
    let mut header_buf = [0u8; HEADER_SIZE];
    if io_manager.read(&mut header_buf, offset)? < HEADER_SIZE {
      return Err(Errors::IncompleteRecord);
    }
    let header = RecordHeader::decode(&header_buf)?;

    let record_size = header.record_size();
    if offset + record_size > size {
      return Err(Errors::IncompleteRecord);
    }

    let body_size = (record_size as usize) - HEADER_SIZE;
    let mut body = vec![0u8; body_size];
    if io_manager.read(&mut body, offset + HEADER_SIZE as u64)? < body_size {
      return Err(Errors::IncompleteRecord);
    }

    Ok(ReadLogRecord {
      record: header.into_record(&header_buf, &body)?,
      size: record_size,
    })
  }

  /// Appends raw bytes, returning the offset they start at. A failed write
  /// is cut back off the file so the next append starts at a record boundary.
  pub fn write(&self, buf: &[u8]) -> Result<u64> {
    let offset = self.get_write_off();
    let res = self.io_manager.read().write(buf);
    match res {
      Ok(n_bytes) => {
        self.write_off.fetch_add(n_bytes as u64, Ordering::AcqRel);
        Ok(offset)
      }
      Err(e) => {
        if self.io_manager.read().size() != offset {
          if let Err(te) = self.truncate(offset) {
            error!(
              "failed to drop partial write at offset {} of data file {}: {}",
              offset, self.file_id, te
            );
          }
        }
        Err(e)
      }
    }
  }

  /// Whether the bytes on disk end exactly where the last complete record
  /// does. False after a failed write that could not be rolled back.
  pub fn has_clean_tail(&self) -> bool {
    self.io_manager.read().size() == self.get_write_off()
  }

  pub fn sync(&self) -> Result<()> {
    self.io_manager.read().sync()
  }

  pub fn set_io_manager(&self, io_type: IOManagerType) -> Result<()> {
    let io_manager = new_io_manager(&self.path, io_type)?;
    *self.io_manager.write() = io_manager;
    Ok(())
  }

  /// Cuts the file back to `len` bytes, dropping a torn tail.
  pub fn truncate(&self, len: u64) -> Result<()> {
    // a live mapping must not outlive the bytes it covers
    self.set_io_manager(IOManagerType::StandardFileIO)?;
    let file = OpenOptions::new()
      .write(true)
      .open(&self.path)
      .map_err(|e| {
        error!("failed to open data file {} for truncation: {}", self.file_id, e);
        Errors::FailedToOpenDataFile
      })?;
    if let Err(e) = file.set_len(len).and_then(|_| file.sync_all()) {
      error!("failed to truncate data file {}: {}", self.file_id, e);
      return Err(Errors::FailedToWriteToDataFile);
    }
    self.write_off.store(len, Ordering::Release);
    Ok(())
  }

  /// Deletes the file from disk. Readers that already hold this handle keep
  /// reading from the unlinked inode.
  pub fn remove(&self) -> Result<()> {
    if let Err(e) = fs::remove_file(&self.path) {
      error!("failed to delete data file {}: {}", self.file_id, e);
      return Err(Errors::FailedToDeleteDataFile);
    }
    Ok(())
  }
}

pub fn get_data_file_name<P>(dir_path: P, file_id: u32) -> PathBuf
where
  P: AsRef<Path>,
{
  let name = format!("{:09}", file_id) + DATA_FILE_NAME_SUFFIX;
  dir_path.as_ref().join(name)
}

/// Parses the id out of a data file name, `None` for foreign files.
pub fn parse_data_file_id(file_name: &str) -> Option<Result<u32>> {
  let stem = file_name.strip_suffix(DATA_FILE_NAME_SUFFIX)?;
  Some(stem.parse::<u32>().map_err(|_| Errors::DataDirectoryCorrupted))
}

#[cfg(test)]
impl DataFile {
  pub(crate) fn replace_io_manager(&self, io_manager: Box<dyn IOManager>) {
    *self.io_manager.write() = io_manager;
  }
}

/// Writes half of every buffer, then fails.
#[cfg(test)]
pub(crate) struct ShortWriteIO {
  inner: crate::fio::file_io::FileIO,
}

#[cfg(test)]
impl ShortWriteIO {
  pub(crate) fn open(path: &Path) -> Self {
    ShortWriteIO {
      inner: crate::fio::file_io::FileIO::new(path).unwrap(),
    }
  }
}

#[cfg(test)]
impl IOManager for ShortWriteIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    self.inner.read(buf, offset)
  }

  fn write(&self, buf: &[u8]) -> Result<usize> {
    self.inner.write(&buf[..buf.len() / 2])?;
    Err(Errors::FailedToWriteToDataFile)
  }

  fn sync(&self) -> Result<()> {
    self.inner.sync()
  }

  fn size(&self) -> u64 {
    self.inner.size()
  }
}
