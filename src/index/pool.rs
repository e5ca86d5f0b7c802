//! Chunked arena for index entries.
//!
//! A stripe using the pool never calls the allocator per entry: entries live
//! in fixed-size slots carved out of large chunks, slots are addressed by a
//! `u32` index, and freed slots are threaded onto a free list through their
//! `next` field. Keys up to the declared fixed size are stored in place.
//!
//! Slot layout (little endian):
//!
//! ```text
//! | next u32 | key len u8 | flags u8 | file id u32 | offset u64 | value size u32 | seq u64 | stale copies u32 | key ... |
//! ```

use crate::{
  data::log_record::LogRecordPos,
  errors::{Errors, Result},
};

use super::{hash_key, heap::buckets_for, IndexEntry, SegmentTable};

pub const SLOT_HEADER_SIZE: usize = 34;

const NIL: u32 = u32::MAX;
const TOMBSTONE_FLAG: u8 = 1;

const NEXT: usize = 0;
const KEY_LEN: usize = 4;
const FLAGS: usize = 5;
const FILE_ID: usize = 6;
const OFFSET: usize = 10;
const VALUE_SIZE: usize = 18;
const SEQ: usize = 22;
const STALE: usize = 30;
const KEY: usize = SLOT_HEADER_SIZE;

fn read_u32(slot: &[u8], at: usize) -> u32 {
  let mut buf = [0u8; 4];
  buf.copy_from_slice(&slot[at..at + 4]);
  u32::from_le_bytes(buf)
}

fn read_u64(slot: &[u8], at: usize) -> u64 {
  let mut buf = [0u8; 8];
  buf.copy_from_slice(&slot[at..at + 8]);
  u64::from_le_bytes(buf)
}

fn write_u32(slot: &mut [u8], at: usize, v: u32) {
  slot[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u64(slot: &mut [u8], at: usize, v: u64) {
  slot[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Fixed-size slots carved out of pre-allocated chunks.
pub struct MemoryPool {
  chunk_size: usize,
  slot_size: usize,
  slots_per_chunk: usize,
  chunks: Vec<Box<[u8]>>,
  free_head: u32,
  next_unused: usize,
  in_use: usize,
}

impl MemoryPool {
  pub fn new(chunk_size: usize, fixed_key_size: usize) -> Self {
    let slot_size = SLOT_HEADER_SIZE + fixed_key_size;
    MemoryPool {
      chunk_size,
      slot_size,
      slots_per_chunk: (chunk_size / slot_size).max(1),
      chunks: Vec::new(),
      free_head: NIL,
      next_unused: 0,
      in_use: 0,
    }
  }

  pub fn key_capacity(&self) -> usize {
    self.slot_size - SLOT_HEADER_SIZE
  }

  pub fn chunk_count(&self) -> usize {
    self.chunks.len()
  }

  pub fn in_use(&self) -> usize {
    self.in_use
  }

  /// Hands out a slot, reusing freed ones before carving new ones.
  pub fn allocate(&mut self) -> Result<u32> {
    if self.free_head != NIL {
      let addr = self.free_head;
      self.free_head = read_u32(self.slot(addr), NEXT);
      self.in_use += 1;
      return Ok(addr);
    }

    if self.next_unused >= NIL as usize {
      return Err(Errors::MemoryPoolExhausted);
    }
    if self.next_unused == self.chunks.len() * self.slots_per_chunk {
      let chunk_bytes = (self.slots_per_chunk * self.slot_size).max(self.chunk_size);
      self.chunks.push(vec![0u8; chunk_bytes].into_boxed_slice());
    }
    let addr = self.next_unused as u32;
    self.next_unused += 1;
    self.in_use += 1;
    Ok(addr)
  }

  pub fn free(&mut self, addr: u32) {
    let head = self.free_head;
    write_u32(self.slot_mut(addr), NEXT, head);
    self.free_head = addr;
    self.in_use -= 1;
  }

  pub fn slot(&self, addr: u32) -> &[u8] {
    let addr = addr as usize;
    let chunk = &self.chunks[addr / self.slots_per_chunk];
    let start = (addr % self.slots_per_chunk) * self.slot_size;
    &chunk[start..start + self.slot_size]
  }

  pub fn slot_mut(&mut self, addr: u32) -> &mut [u8] {
    let addr = addr as usize;
    let slot_size = self.slot_size;
    let chunk = &mut self.chunks[addr / self.slots_per_chunk];
    let start = (addr % self.slots_per_chunk) * slot_size;
    &mut chunk[start..start + slot_size]
  }

  /// Gives every chunk back to the allocator at once.
  pub fn release(&mut self) {
    self.chunks = Vec::new();
    self.free_head = NIL;
    self.next_unused = 0;
    self.in_use = 0;
  }
}

/// Index stripe backed by a [`MemoryPool`], buckets chain slots by address.
pub struct PooledTable {
  pool: MemoryPool,
  buckets: Vec<u32>,
  len: usize,
  rehashes: u64,
}

impl PooledTable {
  pub fn new(capacity: usize, chunk_size: usize, fixed_key_size: usize) -> Self {
    PooledTable {
      pool: MemoryPool::new(chunk_size, fixed_key_size),
      buckets: vec![NIL; buckets_for(capacity)],
      len: 0,
      rehashes: 0,
    }
  }

  fn bucket_index(&self, hash: u64) -> usize {
    (hash as usize) & (self.buckets.len() - 1)
  }

  fn slot_key(slot: &[u8]) -> &[u8] {
    let len = slot[KEY_LEN] as usize;
    &slot[KEY..KEY + len]
  }

  fn decode(slot: &[u8]) -> IndexEntry {
    IndexEntry {
      pos: LogRecordPos {
        file_id: read_u32(slot, FILE_ID),
        offset: read_u64(slot, OFFSET),
        value_size: read_u32(slot, VALUE_SIZE),
        seq: read_u64(slot, SEQ),
      },
      tombstone: slot[FLAGS] & TOMBSTONE_FLAG != 0,
      stale_copies: read_u32(slot, STALE),
    }
  }

  fn encode(slot: &mut [u8], entry: &IndexEntry) {
    slot[FLAGS] = if entry.tombstone { TOMBSTONE_FLAG } else { 0 };
    write_u32(slot, FILE_ID, entry.pos.file_id);
    write_u64(slot, OFFSET, entry.pos.offset);
    write_u32(slot, VALUE_SIZE, entry.pos.value_size);
    write_u64(slot, SEQ, entry.pos.seq);
    write_u32(slot, STALE, entry.stale_copies);
  }

  /// Walks a bucket chain, returning (previous slot, matching slot).
  fn find(&self, hash: u64, key: &[u8]) -> Option<(u32, u32)> {
    let mut prev = NIL;
    let mut addr = self.buckets[self.bucket_index(hash)];
    while addr != NIL {
      let slot = self.pool.slot(addr);
      if Self::slot_key(slot) == key {
        return Some((prev, addr));
      }
      prev = addr;
      addr = read_u32(slot, NEXT);
    }
    None
  }

  fn rehash(&mut self) {
    let mut new_buckets = vec![NIL; self.buckets.len() * 2];
    let mask = new_buckets.len() - 1;
    for head in std::mem::take(&mut self.buckets) {
      let mut addr = head;
      while addr != NIL {
        let slot = self.pool.slot(addr);
        let next = read_u32(slot, NEXT);
        let idx = (hash_key(Self::slot_key(slot)) as usize) & mask;
        write_u32(self.pool.slot_mut(addr), NEXT, new_buckets[idx]);
        new_buckets[idx] = addr;
        addr = next;
      }
    }
    self.buckets = new_buckets;
    self.rehashes += 1;
  }
}

impl SegmentTable for PooledTable {
  fn get(&self, hash: u64, key: &[u8]) -> Option<IndexEntry> {
    self
      .find(hash, key)
      .map(|(_, addr)| Self::decode(self.pool.slot(addr)))
  }

  fn insert(&mut self, hash: u64, key: &[u8], entry: IndexEntry) -> Result<Option<IndexEntry>> {
    if key.len() > self.pool.key_capacity() {
      return Err(Errors::KeySizeExceeded { size: key.len() });
    }
    if let Some((_, addr)) = self.find(hash, key) {
      let slot = self.pool.slot_mut(addr);
      let prev = Self::decode(slot);
      Self::encode(slot, &entry);
      return Ok(Some(prev));
    }

    if (self.len + 1) * 4 > self.buckets.len() * 3 {
      self.rehash();
    }
    let addr = self.pool.allocate()?;
    let idx = self.bucket_index(hash);
    let head = self.buckets[idx];
    let slot = self.pool.slot_mut(addr);
    write_u32(slot, NEXT, head);
    slot[KEY_LEN] = key.len() as u8;
    slot[KEY..KEY + key.len()].copy_from_slice(key);
    Self::encode(slot, &entry);
    self.buckets[idx] = addr;
    self.len += 1;
    Ok(None)
  }

  fn remove(&mut self, hash: u64, key: &[u8]) -> Option<IndexEntry> {
    let (prev, addr) = self.find(hash, key)?;
    let slot = self.pool.slot(addr);
    let entry = Self::decode(slot);
    let next = read_u32(slot, NEXT);
    if prev == NIL {
      let idx = self.bucket_index(hash);
      self.buckets[idx] = next;
    } else {
      write_u32(self.pool.slot_mut(prev), NEXT, next);
    }
    self.pool.free(addr);
    self.len -= 1;
    Some(entry)
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
    for &head in &self.buckets {
      let mut addr = head;
      while addr != NIL {
        let slot = self.pool.slot(addr);
        f(Self::slot_key(slot), &Self::decode(slot));
        addr = read_u32(slot, NEXT);
      }
    }
  }

  fn clear(&mut self) {
    self.buckets.iter_mut().for_each(|b| *b = NIL);
    self.pool.release();
    self.len = 0;
  }

  fn memory_chunks(&self) -> usize {
    self.pool.chunk_count()
  }
}
