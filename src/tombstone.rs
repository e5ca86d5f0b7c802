//! Tombstone lifecycle.
//!
//! Deleting a key writes a tombstone record and leaves a tombstone entry in
//! the index. The entry counts, in `stale_copies`, every older copy of the
//! key still present in some data file. That count only goes down once a
//! compacted file holding such a copy is gone from disk, so a tombstone
//! whose count reached zero can no longer let an old value resurface on the
//! next open and may be dropped.

use std::collections::BTreeSet;

use log::{info, warn};

use crate::{
  compaction::Compactor,
  data::log_record::LogRecordPos,
  errors::Result,
  index::{IndexEntry, OffHeapIndex},
};

pub fn is_reclaimable(entry: &IndexEntry) -> bool {
  entry.tombstone && entry.stale_copies == 0
}

/// Drops the tombstone found at `pos` when it guards no older copy. Returns
/// false when the tombstone must be kept, or when the key moved on.
pub(crate) fn try_reclaim(index: &OffHeapIndex, key: &[u8], pos: &LogRecordPos) -> bool {
  index.remove_reclaimable_tombstone(key, pos)
}

/// Applies the stale copies that disappeared together with a deleted file.
pub(crate) fn release_deleted_copies(index: &OffHeapIndex, keys: &[Vec<u8>]) -> Result<()> {
  for key in keys {
    index.release_stale_copy(key)?;
  }
  Ok(())
}

/// Compacts, before the database takes traffic, every file holding a
/// tombstone that no longer guards anything. Returns the number of
/// tombstones reclaimed.
pub(crate) fn clean_up_during_open(compactor: &mut Compactor, index: &OffHeapIndex) -> Result<usize> {
  let reclaimable = index.reclaimable_tombstones();
  if reclaimable.is_empty() {
    return Ok(0);
  }

  let file_ids: BTreeSet<u32> = reclaimable.iter().map(|(_, e)| e.pos.file_id).collect();
  let before = index.tombstone_count();
  for file_id in file_ids {
    if let Err(e) = compactor.compact_file(file_id) {
      warn!("failed to clean up tombstones of data file {}: {}", file_id, e);
    }
  }
  compactor.finish()?;

  let reclaimed = before.saturating_sub(index.tombstone_count());
  info!(
    "reclaimed {} of {} eligible tombstones during open",
    reclaimed,
    reclaimable.len()
  );
  Ok(reclaimed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::option::Options;

  fn pos(offset: u64, seq: u64) -> LogRecordPos {
    LogRecordPos {
      file_id: 1,
      offset,
      value_size: 0,
      seq,
    }
  }

  #[test]
  fn test_tombstone_kept_until_copies_released() {
    let mut opts = Options::default();
    opts.index_segments = 2;
    let index = OffHeapIndex::new(&opts);

    index.put_newer(b"k", pos(0, 1), false).unwrap();
    index.put_newer(b"k", pos(30, 2), false).unwrap();
    index.put_newer(b"k", pos(60, 3), true).unwrap();
    let entry = index.get(b"k").unwrap();
    assert!(!is_reclaimable(&entry));
    assert!(!try_reclaim(&index, b"k", &pos(60, 3)));

    release_deleted_copies(&index, &[b"k".to_vec()]).unwrap();
    assert!(!try_reclaim(&index, b"k", &pos(60, 3)));
    release_deleted_copies(&index, &[b"k".to_vec()]).unwrap();
    assert!(is_reclaimable(&index.get(b"k").unwrap()));
    assert!(try_reclaim(&index, b"k", &pos(60, 3)));
    assert!(index.get(b"k").is_none());
  }

  #[test]
  fn test_live_entry_is_never_reclaimed() {
    let mut opts = Options::default();
    opts.index_segments = 1;
    let index = OffHeapIndex::new(&opts);
    index.put_newer(b"k", pos(0, 1), false).unwrap();
    assert!(!is_reclaimable(&index.get(b"k").unwrap()));
    assert!(!try_reclaim(&index, b"k", &pos(0, 1)));
  }
}
