use std::{
  collections::BTreeMap,
  fmt,
  sync::atomic::{AtomicU64, Ordering},
};

/// Counters shared by the foreground paths and the compaction thread.
#[derive(Default)]
pub struct Stats {
  pub put_count: AtomicU64,
  pub get_count: AtomicU64,
  pub delete_count: AtomicU64,
  pub files_compacted: AtomicU64,
  pub records_copied: AtomicU64,
  pub records_skipped: AtomicU64,
  pub bytes_copied: AtomicU64,
  pub tombstones_reclaimed: AtomicU64,
  pub compaction_aborts: AtomicU64,
}

impl Stats {
  pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  pub fn reset(&self) {
    for counter in [
      &self.put_count,
      &self.get_count,
      &self.delete_count,
      &self.files_compacted,
      &self.records_copied,
      &self.records_skipped,
      &self.bytes_copied,
      &self.tombstones_reclaimed,
      &self.compaction_aborts,
    ] {
      counter.store(0, Ordering::Relaxed);
    }
  }
}

/// Point-in-time view of the database.
#[derive(Debug, Clone, Default)]
pub struct DbStats {
  pub record_count: usize,
  pub tombstone_count: usize,
  pub put_count: u64,
  pub get_count: u64,
  pub delete_count: u64,
  pub stale_bytes_total: u64,
  pub segment_count: usize,
  pub size_bytes: u64,
  pub files_compacted: u64,
  pub records_copied: u64,
  pub records_skipped: u64,
  pub bytes_copied: u64,
  pub tombstones_reclaimed: u64,
  pub compaction_aborts: u64,
  pub compaction_queue_len: usize,
  pub index_segments: usize,
  pub index_rehashes: u64,
  pub memory_pool_chunks: usize,
  /// Stale ratio of every data file, keyed by file id.
  pub stale_ratio_per_file: BTreeMap<u32, f64>,
}

impl fmt::Display for DbStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "records: {} (tombstones: {})", self.record_count, self.tombstone_count)?;
    writeln!(
      f,
      "ops: put={} get={} delete={}",
      self.put_count, self.get_count, self.delete_count
    )?;
    writeln!(
      f,
      "files: {} ({} bytes, {} stale)",
      self.segment_count, self.size_bytes, self.stale_bytes_total
    )?;
    writeln!(
      f,
      "compaction: files={} copied={} skipped={} bytes={} tombstones={} aborts={} queued={}",
      self.files_compacted,
      self.records_copied,
      self.records_skipped,
      self.bytes_copied,
      self.tombstones_reclaimed,
      self.compaction_aborts,
      self.compaction_queue_len
    )?;
    write!(
      f,
      "index: segments={} rehashes={} pool chunks={}",
      self.index_segments, self.index_rehashes, self.memory_pool_chunks
    )
  }
}
