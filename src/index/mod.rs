//! Off-heap index: key -> location of the most recent record for that key.
//!
//! The table is split into a fixed number of lock stripes. Every stripe owns
//! its own memory (a heap table or a chunk arena) and its own lock, so
//! operations on keys hashing to different stripes never contend, and a
//! stripe that outgrows its bucket array rehashes alone.

pub mod heap;
pub mod pool;

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
  data::log_record::LogRecordPos,
  errors::{Errors, Result},
  option::Options,
};

use self::{heap::HeapTable, pool::PooledTable};

/// What the index knows about one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
  pub pos: LogRecordPos,

  /// The current record is a delete marker.
  pub tombstone: bool,

  /// Superseded copies of this key that still exist in some data file.
  pub stale_copies: u32,
}

impl IndexEntry {
  pub fn live(pos: LogRecordPos) -> Self {
    IndexEntry {
      pos,
      tombstone: false,
      stale_copies: 0,
    }
  }
}

/// Storage behind a single index stripe.
pub trait SegmentTable: Sync + Send {
  fn get(&self, hash: u64, key: &[u8]) -> Option<IndexEntry>;

  /// Inserts or replaces the entry for `key`, returning the previous one.
  fn insert(&mut self, hash: u64, key: &[u8], entry: IndexEntry) -> Result<Option<IndexEntry>>;

  fn remove(&mut self, hash: u64, key: &[u8]) -> Option<IndexEntry>;

  fn len(&self) -> usize;

  fn bucket_count(&self) -> usize;

  fn rehash_count(&self) -> u64;

  fn for_each(&self, f: &mut dyn FnMut(&[u8], &IndexEntry));

  /// Releases every entry and the memory behind it.
  fn clear(&mut self);

  fn memory_chunks(&self) -> usize {
    0
  }
}

pub fn hash_key(key: &[u8]) -> u64 {
  xxh3_64(key)
}

/// Result of a sequence-ordered put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
  /// The new location is now current; carries the entry it replaced.
  Applied(Option<IndexEntry>),

  /// A newer record already owns the key, the written record is stale.
  Superseded,
}

pub struct OffHeapIndex {
  segments: Vec<RwLock<Box<dyn SegmentTable>>>,
  live_count: AtomicUsize,
  tombstone_count: AtomicUsize,
}

impl OffHeapIndex {
  pub fn new(options: &Options) -> Self {
    let segment_count = options.effective_index_segments().max(1);
    let per_segment = options.number_of_records / segment_count + 1;

    let segments = (0..segment_count)
      .map(|_| {
        let table: Box<dyn SegmentTable> = if options.use_memory_pool {
          Box::new(PooledTable::new(
            per_segment,
            options.memory_pool_chunk_size,
            options.fixed_key_size,
          ))
        } else {
          Box::new(HeapTable::new(per_segment))
        };
        RwLock::new(table)
      })
      .collect();

    OffHeapIndex {
      segments,
      live_count: AtomicUsize::new(0),
      tombstone_count: AtomicUsize::new(0),
    }
  }

  fn segment(&self, hash: u64) -> &RwLock<Box<dyn SegmentTable>> {
    let idx = ((hash >> 32) as usize) % self.segments.len();
    &self.segments[idx]
  }

  fn counter(&self, entry: &IndexEntry) -> &AtomicUsize {
    if entry.tombstone {
      &self.tombstone_count
    } else {
      &self.live_count
    }
  }

  fn account(&self, old: Option<&IndexEntry>, new: Option<&IndexEntry>) {
    if let Some(e) = old {
      self.counter(e).fetch_sub(1, Ordering::AcqRel);
    }
    if let Some(e) = new {
      self.counter(e).fetch_add(1, Ordering::AcqRel);
    }
  }

  /// Current entry for a key, tombstones included.
  pub fn get(&self, key: &[u8]) -> Option<IndexEntry> {
    let hash = hash_key(key);
    self.segment(hash).read().get(hash, key)
  }

  /// Location of the live record for a key.
  pub fn get_live(&self, key: &[u8]) -> Option<LogRecordPos> {
    self.get(key).filter(|e| !e.tombstone).map(|e| e.pos)
  }

  /// Unconditionally points `key` at `pos`, returning the previous entry.
  pub fn put(&self, key: &[u8], pos: LogRecordPos) -> Result<Option<IndexEntry>> {
    let hash = hash_key(key);
    let mut table = self.segment(hash).write();
    let prev = table.get(hash, key);
    let entry = IndexEntry {
      pos,
      tombstone: false,
      stale_copies: prev.map(|p| p.stale_copies + 1).unwrap_or(0),
    };
    table.insert(hash, key, entry)?;
    self.account(prev.as_ref(), Some(&entry));
    Ok(prev)
  }

  /// Installs a record location only if it is newer than the current one,
  /// ordering by sequence number and then by file id. Whichever copy loses
  /// is counted as a stale copy of the key.
  pub fn put_newer(&self, key: &[u8], pos: LogRecordPos, tombstone: bool) -> Result<PutOutcome> {
    let hash = hash_key(key);
    let mut table = self.segment(hash).write();
    let prev = table.get(hash, key);

    if let Some(current) = prev {
      if (current.pos.seq, current.pos.file_id) > (pos.seq, pos.file_id) {
        let updated = IndexEntry {
          stale_copies: current.stale_copies + 1,
          ..current
        };
        table.insert(hash, key, updated)?;
        return Ok(PutOutcome::Superseded);
      }
    }

    let entry = IndexEntry {
      pos,
      tombstone,
      stale_copies: prev.map(|p| p.stale_copies + 1).unwrap_or(0),
    };
    table.insert(hash, key, entry)?;
    self.account(prev.as_ref(), Some(&entry));
    Ok(PutOutcome::Applied(prev))
  }

  pub fn remove(&self, key: &[u8]) -> Option<IndexEntry> {
    let hash = hash_key(key);
    let prev = self.segment(hash).write().remove(hash, key);
    self.account(prev.as_ref(), None);
    prev
  }

  /// Moves a key to a copied record, but only while the index still points
  /// at the copy's source. A key rewritten in the meantime keeps its newer
  /// location and the copy is counted as one more stale copy.
  pub fn relocate(&self, key: &[u8], expected: &LogRecordPos, new_pos: LogRecordPos) -> Result<bool> {
    let hash = hash_key(key);
    let mut table = self.segment(hash).write();
    let current = match table.get(hash, key) {
      Some(current) => current,
      None => return Ok(false),
    };

    if current.pos.same_location(expected) {
      table.insert(hash, key, IndexEntry { pos: new_pos, ..current })?;
      Ok(true)
    } else {
      table.insert(
        hash,
        key,
        IndexEntry {
          stale_copies: current.stale_copies + 1,
          ..current
        },
      )?;
      Ok(false)
    }
  }

  /// Drops the tombstone at `expected` if no older copy of its key remains.
  pub fn remove_reclaimable_tombstone(&self, key: &[u8], expected: &LogRecordPos) -> bool {
    let hash = hash_key(key);
    let mut table = self.segment(hash).write();
    match table.get(hash, key) {
      Some(current)
        if current.tombstone && current.stale_copies == 0 && current.pos.same_location(expected) =>
      {
        table.remove(hash, key);
        self.account(Some(&current), None);
        true
      }
      _ => false,
    }
  }

  pub fn add_stale_copy(&self, key: &[u8]) -> Result<()> {
    self.adjust_stale_copies(key, |n| n + 1)
  }

  /// Called once a stale copy of `key` has been physically deleted.
  pub fn release_stale_copy(&self, key: &[u8]) -> Result<()> {
    self.adjust_stale_copies(key, |n| n.saturating_sub(1))
  }

  fn adjust_stale_copies(&self, key: &[u8], f: impl FnOnce(u32) -> u32) -> Result<()> {
    let hash = hash_key(key);
    let mut table = self.segment(hash).write();
    if let Some(current) = table.get(hash, key) {
      table.insert(
        hash,
        key,
        IndexEntry {
          stale_copies: f(current.stale_copies),
          ..current
        },
      )?;
    }
    Ok(())
  }

  /// Snapshot of every key with a live value.
  pub fn live_keys(&self) -> Vec<Bytes> {
    let mut keys = Vec::with_capacity(self.live_count());
    for segment in &self.segments {
      segment.read().for_each(&mut |key, entry| {
        if !entry.tombstone {
          keys.push(Bytes::copy_from_slice(key));
        }
      });
    }
    keys
  }

  /// Tombstones with no older copy of their key left on disk.
  pub fn reclaimable_tombstones(&self) -> Vec<(Vec<u8>, IndexEntry)> {
    let mut result = Vec::new();
    for segment in &self.segments {
      segment.read().for_each(&mut |key, entry| {
        if entry.tombstone && entry.stale_copies == 0 {
          result.push((key.to_vec(), *entry));
        }
      });
    }
    result
  }

  pub fn live_count(&self) -> usize {
    self.live_count.load(Ordering::Acquire)
  }

  pub fn tombstone_count(&self) -> usize {
    self.tombstone_count.load(Ordering::Acquire)
  }

  pub fn segment_count(&self) -> usize {
    self.segments.len()
  }

  pub fn rehash_count(&self) -> u64 {
    self.segments.iter().map(|s| s.read().rehash_count()).sum()
  }

  pub fn memory_chunks(&self) -> usize {
    self.segments.iter().map(|s| s.read().memory_chunks()).sum()
  }

  /// Eagerly frees all index memory.
  pub fn clear(&self) {
    for segment in &self.segments {
      segment.write().clear();
    }
    self.live_count.store(0, Ordering::Release);
    self.tombstone_count.store(0, Ordering::Release);
  }
}

/// Rejects keys the index cannot hold.
pub fn check_key_size(key: &[u8], max: usize) -> Result<()> {
  if key.is_empty() {
    return Err(Errors::KeyIsEmpty);
  }
  if key.len() > max {
    return Err(Errors::InvalidKeySize {
      size: key.len(),
      max,
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, thread};

  use super::*;

  fn pos(file_id: u32, offset: u64, seq: u64) -> LogRecordPos {
    LogRecordPos {
      file_id,
      offset,
      value_size: 10,
      seq,
    }
  }

  fn indexes() -> Vec<OffHeapIndex> {
    let mut heap = Options::default();
    heap.index_segments = 4;
    heap.number_of_records = 16;

    let mut pooled = heap.clone();
    pooled.use_memory_pool = true;
    pooled.fixed_key_size = 16;
    pooled.memory_pool_chunk_size = 1024;

    vec![OffHeapIndex::new(&heap), OffHeapIndex::new(&pooled)]
  }

  #[test]
  fn test_index_put_get_remove() {
    for index in indexes() {
      assert!(index.put(b"aa", pos(1, 10, 1)).unwrap().is_none());
      let prev = index.put(b"aa", pos(1, 50, 2)).unwrap().unwrap();
      assert_eq!(prev.pos, pos(1, 10, 1));

      let entry = index.get(b"aa").unwrap();
      assert_eq!(entry.pos, pos(1, 50, 2));
      assert_eq!(entry.stale_copies, 1);
      assert_eq!(index.live_count(), 1);

      let removed = index.remove(b"aa").unwrap();
      assert_eq!(removed.pos.offset, 50);
      assert!(index.get(b"aa").is_none());
      assert!(index.remove(b"aa").is_none());
      assert_eq!(index.live_count(), 0);
    }
  }

  #[test]
  fn test_put_newer_orders_by_sequence() {
    for index in indexes() {
      assert_eq!(
        index.put_newer(b"k", pos(2, 0, 5), false).unwrap(),
        PutOutcome::Applied(None)
      );
      assert_eq!(
        index.put_newer(b"k", pos(1, 0, 3), false).unwrap(),
        PutOutcome::Superseded
      );
      let entry = index.get(b"k").unwrap();
      assert_eq!(entry.pos.seq, 5);
      assert_eq!(entry.stale_copies, 1);

      // equal sequence numbers resolve to the later file
      assert!(matches!(
        index.put_newer(b"k", pos(9, 0, 5), false).unwrap(),
        PutOutcome::Applied(Some(_))
      ));
      assert_eq!(index.get(b"k").unwrap().pos.file_id, 9);
      assert_eq!(index.get(b"k").unwrap().stale_copies, 2);
    }
  }

  #[test]
  fn test_tombstone_entries() {
    for index in indexes() {
      index.put_newer(b"k", pos(1, 0, 1), false).unwrap();
      index.put_newer(b"k", pos(1, 40, 2), true).unwrap();
      assert!(index.get_live(b"k").is_none());
      assert_eq!(index.tombstone_count(), 1);
      assert_eq!(index.live_count(), 0);
      assert!(index.live_keys().is_empty());

      // an older copy is still on disk
      assert!(!index.remove_reclaimable_tombstone(b"k", &pos(1, 40, 2)));
      assert!(index.reclaimable_tombstones().is_empty());

      index.release_stale_copy(b"k").unwrap();
      assert_eq!(index.reclaimable_tombstones().len(), 1);
      assert!(!index.remove_reclaimable_tombstone(b"k", &pos(7, 0, 2)));
      assert!(index.remove_reclaimable_tombstone(b"k", &pos(1, 40, 2)));
      assert!(index.get(b"k").is_none());
      assert_eq!(index.tombstone_count(), 0);
    }
  }

  #[test]
  fn test_relocate_checks_current_location() {
    for index in indexes() {
      index.put_newer(b"k", pos(1, 0, 1), false).unwrap();
      assert!(index.relocate(b"k", &pos(1, 0, 1), pos(5, 0, 1)).unwrap());
      assert_eq!(index.get(b"k").unwrap().pos.file_id, 5);

      // source no longer current: copy becomes a stale copy
      assert!(!index.relocate(b"k", &pos(1, 0, 1), pos(6, 0, 1)).unwrap());
      let entry = index.get(b"k").unwrap();
      assert_eq!(entry.pos.file_id, 5);
      assert_eq!(entry.stale_copies, 1);

      assert!(!index.relocate(b"missing", &pos(1, 0, 1), pos(6, 0, 1)).unwrap());
    }
  }

  #[test]
  fn test_index_grows_past_presize() {
    for index in indexes() {
      for i in 0..2000u32 {
        index.put(&i.to_be_bytes(), pos(1, i as u64, i as u64)).unwrap();
      }
      assert_eq!(index.live_count(), 2000);
      assert!(index.rehash_count() > 0);
      for i in 0..2000u32 {
        assert_eq!(index.get_live(&i.to_be_bytes()).unwrap().offset, i as u64);
      }
      assert_eq!(index.live_keys().len(), 2000);

      index.clear();
      assert_eq!(index.live_count(), 0);
      assert!(index.get(&7u32.to_be_bytes()).is_none());
    }
  }

  #[test]
  fn test_concurrent_puts() {
    for index in indexes() {
      let index = Arc::new(index);
      let handles: Vec<_> = (0..4u32)
        .map(|t| {
          let index = index.clone();
          thread::spawn(move || {
            for i in 0..500u32 {
              let key = (t * 1000 + i).to_be_bytes();
              index.put(&key, pos(t, i as u64, i as u64)).unwrap();
            }
          })
        })
        .collect();
      for handle in handles {
        handle.join().unwrap();
      }
      assert_eq!(index.live_count(), 2000);
    }
  }

  #[test]
  fn test_check_key_size() {
    assert_eq!(check_key_size(b"", 8), Err(Errors::KeyIsEmpty));
    assert!(check_key_size(b"12345678", 8).is_ok());
    assert_eq!(
      check_key_size(b"123456789", 8),
      Err(Errors::InvalidKeySize { size: 9, max: 8 })
    );
  }
}
