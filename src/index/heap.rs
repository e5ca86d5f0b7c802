use crate::errors::Result;

use super::{IndexEntry, SegmentTable};

const MIN_BUCKETS: usize = 16;

struct HeapEntry {
  hash: u64,
  key: Box<[u8]>,
  entry: IndexEntry,
}

/// Index stripe whose entries are allocated one by one from the global allocator.
pub struct HeapTable {
  buckets: Vec<Vec<HeapEntry>>,
  len: usize,
  rehashes: u64,
}

/// Bucket count keeping `capacity` entries under a 0.75 load factor.
pub(crate) fn buckets_for(capacity: usize) -> usize {
  (capacity.saturating_mul(4) / 3)
    .max(MIN_BUCKETS)
    .next_power_of_two()
}

impl HeapTable {
  pub fn new(capacity: usize) -> Self {
    let mut buckets = Vec::new();
    buckets.resize_with(buckets_for(capacity), Vec::new);
    HeapTable {
      buckets,
      len: 0,
      rehashes: 0,
    }
  }

  fn bucket_index(&self, hash: u64) -> usize {
    (hash as usize) & (self.buckets.len() - 1)
  }

  fn rehash(&mut self) {
    let mut new_buckets = Vec::new();
    new_buckets.resize_with(self.buckets.len() * 2, Vec::new);
    let mask = new_buckets.len() - 1;
    for bucket in self.buckets.drain(..) {
      for item in bucket {
        new_buckets[(item.hash as usize) & mask].push(item);
      }
    }
    self.buckets = new_buckets;
    self.rehashes += 1;
  }
}

impl SegmentTable for HeapTable {
  fn get(&self, hash: u64, key: &[u8]) -> Option<IndexEntry> {
    self.buckets[self.bucket_index(hash)]
      .iter()
      .find(|item| item.hash == hash && &*item.key == key)
      .map(|item| item.entry)
  }

  fn insert(&mut self, hash: u64, key: &[u8], entry: IndexEntry) -> Result<Option<IndexEntry>> {
    let idx = self.bucket_index(hash);
    if let Some(item) = self.buckets[idx]
      .iter_mut()
      .find(|item| item.hash == hash && &*item.key == key)
    {
      return Ok(Some(std::mem::replace(&mut item.entry, entry)));
    }

    if (self.len + 1) * 4 > self.buckets.len() * 3 {
      self.rehash();
    }
    let idx = self.bucket_index(hash);
    self.buckets[idx].push(HeapEntry {
      hash,
      key: key.into(),
      entry,
    });
    self.len += 1;
    Ok(None)
  }

  fn remove(&mut self, hash: u64, key: &[u8]) -> Option<IndexEntry> {
    let idx = self.bucket_index(hash);
    let bucket = &mut self.buckets[idx];
    let at = bucket
      .iter()
      .position(|item| item.hash == hash && &*item.key == key)?;
    self.len -= 1;
    Some(bucket.swap_remove(at).entry)
  }

  fn len(&self) -> usize {
    self.len
  }

  fn bucket_count(&self) -> usize {
    self.buckets.len()
  }

  fn rehash_count(&self) -> u64 {
    self.rehashes
  }

  fn for_each(&self, f: &mut dyn FnMut(&[u8], &IndexEntry)) {
    for bucket in &self.buckets {
      for item in bucket {
        f(&item.key, &item.entry);
      }
    }
  }

  fn clear(&mut self) {
    for bucket in self.buckets.iter_mut() {
      *bucket = Vec::new();
    }
    self.len = 0;
  }
}
