use std::{collections::HashMap, fs, path::Path, sync::Arc};

use log::{error, info, warn};

use crate::{
  data::{
    data_file::{parse_data_file_id, DataFile},
    log_record::LogRecordPos,
  },
  errors::{Errors, Result},
  index::{OffHeapIndex, PutOutcome},
  option::IOManagerType,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryResult {
  pub next_seq: u64,
  pub records: u64,
  pub stale_records: u64,
  pub truncated_files: u32,
}

/// Opens every data file in the directory in ascending id order. Empty files
/// left behind by a crash right after a rotation are removed.
pub(crate) fn load_data_files<P>(dir_path: P, io_type: IOManagerType) -> Result<Vec<Arc<DataFile>>>
where
  P: AsRef<Path>,
{
  let dir = match fs::read_dir(&dir_path) {
    Ok(dir) => dir,
    Err(e) => {
      error!("failed to read database dir: {}", e);
      return Err(Errors::FailedToReadDatabaseDir);
    }
  };

  let mut file_ids = Vec::new();
  for entry in dir.flatten() {
    let file_name = entry.file_name();
    let file_name = match file_name.to_str() {
      Some(name) => name,
      None => continue,
    };
    if let Some(file_id) = parse_data_file_id(file_name) {
      let file_id = file_id?;
      let empty = entry.metadata().map(|m| m.len() == 0).unwrap_or(false);
      if empty {
        if let Err(e) = fs::remove_file(entry.path()) {
          warn!("failed to remove empty data file {}: {}", file_name, e);
        }
        continue;
      }
      file_ids.push(file_id);
    }
  }
  file_ids.sort_unstable();

  let mut data_files = Vec::with_capacity(file_ids.len());
  for file_id in file_ids {
    data_files.push(Arc::new(DataFile::new(&dir_path, file_id, io_type)?));
  }
  Ok(data_files)
}

/// Replays every record into the index. The highest sequence number wins a
/// key; each losing copy is credited as stale to the file holding it. A torn
/// tail is cut off the file it was found in.
pub(crate) fn rebuild_index(data_files: &[Arc<DataFile>], index: &OffHeapIndex) -> Result<RecoveryResult> {
  let by_id: HashMap<u32, &Arc<DataFile>> =
    data_files.iter().map(|f| (f.get_file_id(), f)).collect();
  let mut result = RecoveryResult::default();
  let mut max_seq = 0;

  for data_file in data_files {
    let file_id = data_file.get_file_id();
    let mut offset = 0;
    loop {
      let read = match data_file.read_log_record(offset) {
        Ok(read) => read,
        Err(Errors::ReadDataFileEOF) => break,
        Err(e) if e.is_torn_record() => {
          if let Some(next) = next_valid_record(data_file, offset) {
            error!(
              "data file {} has a corrupted record at offset {} ({}) followed by a valid record at offset {}",
              file_id, offset, e, next
            );
            return Err(Errors::DataDirectoryCorrupted);
          }
          warn!(
            "data file {} has a torn record at offset {} ({}), truncating {} bytes",
            file_id,
            offset,
            e,
            data_file.get_write_off() - offset
          );
          data_file.truncate(offset)?;
          result.truncated_files += 1;
          break;
        }
        Err(e) => return Err(e),
      };

      let record = read.record;
      let pos = LogRecordPos {
        file_id,
        offset,
        value_size: record.value.len() as u32,
        seq: record.seq,
      };
      match index.put_newer(&record.key, pos, record.is_tombstone())? {
        PutOutcome::Applied(Some(prev)) => {
          if let Some(prev_file) = by_id.get(&prev.pos.file_id) {
            prev_file.add_stale_bytes(prev.pos.record_size(record.key.len()));
          }
          result.stale_records += 1;
        }
        PutOutcome::Applied(None) => {}
        PutOutcome::Superseded => {
          data_file.add_stale_bytes(read.size);
          result.stale_records += 1;
        }
      }

      max_seq = max_seq.max(record.seq);
      result.records += 1;
      offset += read.size;
    }
  }

  result.next_seq = max_seq + 1;
  info!(
    "rebuilt index from {} data files: {} records, {} stale, {} live keys, {} tombstones",
    data_files.len(),
    result.records,
    result.stale_records,
    index.live_count(),
    index.tombstone_count()
  );
  Ok(result)
}

/// Looks for a record that decodes cleanly anywhere after a bad one. Only a
/// tail with nothing valid behind it can be the leftover of an unflushed
/// append.
fn next_valid_record(data_file: &DataFile, bad_offset: u64) -> Option<u64> {
  let end = data_file.get_write_off();
  (bad_offset + 1..end).find(|offset| data_file.read_log_record(*offset).is_ok())
}
