use std::result;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum Errors {
  #[error("failed to read from data file")]
  FailedToReadFromDataFile,

  #[error("failed to write to data file")]
  FailedToWriteToDataFile,

  #[error("failed to sync data file")]
  FailedToSyncDataFile,

  #[error("failed to open data file")]
  FailedToOpenDataFile,

  #[error("failed to delete data file")]
  FailedToDeleteDataFile,

  #[error("the key is empty")]
  KeyIsEmpty,

  #[error("invalid key size {size}, the maximum allowed is {max}")]
  InvalidKeySize { size: usize, max: usize },

  #[error("key of {size} bytes does not fit the fixed memory pool slot")]
  KeySizeExceeded { size: usize },

  #[error("memory pool cannot address more index entries")]
  MemoryPoolExhausted,

  #[error("record of {size} bytes exceeds the maximum data file size")]
  RecordTooLarge { size: u64 },

  #[error("key is not found in database")]
  KeyNotFound,

  #[error("data file is not found in database")]
  DataFileNotFound,

  #[error("failed to create the database directory")]
  FailedToCreateDatabaseDir,

  #[error("failed to read the database directory")]
  FailedToReadDatabaseDir,

  #[error("the database directory maybe corrupted")]
  DataDirectoryCorrupted,

  #[error("read data file eof")]
  ReadDataFileEOF,

  #[error("record runs past the end of the data file")]
  IncompleteRecord,

  #[error("invalid crc value, log record maybe corrupted")]
  InvalidLogRecordCrc,

  #[error("log record header is corrupted")]
  CorruptedRecord,

  #[error("the database directory is used by another process")]
  DatabaseIsUsing,

  #[error("failed to lock the database directory")]
  FailedToLockDatabase,

  #[error("invalid options: {0}")]
  InvalidOptions(&'static str),

  #[error("the database is closed")]
  DatabaseClosed,

  #[error("compaction was asked to stop")]
  CompactionStopped,

  #[error("failed to start the compaction thread")]
  FailedToStartCompaction,
}

impl Errors {
  /// Whether the error is the signature of a record torn by an unflushed crash.
  pub fn is_torn_record(&self) -> bool {
    matches!(
      self,
      Errors::IncompleteRecord | Errors::InvalidLogRecordCrc | Errors::CorruptedRecord
    )
  }
}

pub type Result<T> = result::Result<T, Errors>;
