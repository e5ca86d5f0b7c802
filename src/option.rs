use lazy_static::lazy_static;
use std::path::PathBuf;

use crate::{
  data::log_record::MAX_KEY_SIZE,
  errors::{Errors, Result},
  index::pool::SLOT_HEADER_SIZE,
};

lazy_static! {
  pub static ref DEFAULT_DIR_PATH: PathBuf = std::env::temp_dir().join("haven-kv");
}

#[derive(Debug, Clone)]
pub struct Options {
  pub dir_path: PathBuf,

  /// Size at which the active data file is rotated.
  pub max_file_size: u64,

  /// Cumulative unsynced bytes after which the active file is synced, 0 disables it.
  pub flush_data_size_bytes: usize,

  pub sync_writes: bool,

  /// Stale ratio at which a sealed data file becomes a compaction candidate.
  pub compaction_threshold_per_file: f64,

  /// Bytes copied per second by the compaction thread, 0 means unlimited.
  pub compaction_job_rate: u64,

  pub compaction_enabled: bool,

  /// Expected number of records, used to pre-size the index.
  pub number_of_records: usize,

  pub clean_up_tombstones_during_open: bool,

  pub clean_up_in_memory_index_on_close: bool,

  pub use_memory_pool: bool,

  pub memory_pool_chunk_size: usize,

  /// Upper bound on key size when the memory pool is used.
  pub fixed_key_size: usize,

  /// Number of index lock stripes, 0 means twice the available parallelism.
  pub index_segments: usize,

  pub mmap_at_startup: bool,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      dir_path: DEFAULT_DIR_PATH.clone(),
      max_file_size: 1024 * 1024 * 1024, // 1GB
      flush_data_size_bytes: 10 * 1024 * 1024,
      sync_writes: false,
      compaction_threshold_per_file: 0.7,
      compaction_job_rate: 50 * 1024 * 1024,
      compaction_enabled: true,
      number_of_records: 1_000_000,
      clean_up_tombstones_during_open: false,
      clean_up_in_memory_index_on_close: false,
      use_memory_pool: false,
      memory_pool_chunk_size: 16 * 1024 * 1024,
      fixed_key_size: MAX_KEY_SIZE,
      index_segments: 0,
      mmap_at_startup: true,
    }
  }
}

impl Options {
  pub fn validate(&self) -> Result<()> {
    if self.dir_path.as_os_str().is_empty() {
      return Err(Errors::InvalidOptions("database dir path is empty"));
    }
    if self.max_file_size == 0 || self.max_file_size > u32::MAX as u64 {
      return Err(Errors::InvalidOptions(
        "max file size must be greater than 0 and fit in 32 bits",
      ));
    }
    if !(0.0..=1.0).contains(&self.compaction_threshold_per_file) {
      return Err(Errors::InvalidOptions(
        "compaction threshold must be between 0 and 1",
      ));
    }
    if self.use_memory_pool {
      if self.fixed_key_size == 0 || self.fixed_key_size > MAX_KEY_SIZE {
        return Err(Errors::InvalidOptions("fixed key size out of range"));
      }
      if self.memory_pool_chunk_size < SLOT_HEADER_SIZE + self.fixed_key_size {
        return Err(Errors::InvalidOptions(
          "memory pool chunk is too small to hold a single entry",
        ));
      }
    }
    Ok(())
  }

  /// Largest key the engine will accept under these options.
  pub fn key_size_bound(&self) -> usize {
    if self.use_memory_pool {
      self.fixed_key_size.min(MAX_KEY_SIZE)
    } else {
      MAX_KEY_SIZE
    }
  }

  pub fn effective_index_segments(&self) -> usize {
    if self.index_segments == 0 {
      std::thread::available_parallelism()
        .map(|p| p.get() * 2)
        .unwrap_or(8)
    } else {
      self.index_segments
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOManagerType {
  StandardFileIO,

  MemoryMap,
}
