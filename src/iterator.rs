use std::vec::IntoIter;

use bytes::Bytes;

use crate::{
  db::Engine,
  errors::{Errors, Result},
};

/// Iterator over the key/value pairs of a database.
///
/// The key set is captured when the iterator is created. Values are read
/// lazily, so a key deleted afterwards is skipped and a key overwritten
/// afterwards yields its newer value.
pub struct DbIterator<'a> {
  engine: &'a Engine,
  keys: IntoIter<Bytes>,
}

impl<'a> DbIterator<'a> {
  pub(crate) fn new(engine: &'a Engine) -> Self {
    DbIterator {
      engine,
      keys: engine.index.live_keys().into_iter(),
    }
  }

  /// Keys not yet visited.
  pub fn remaining(&self) -> usize {
    self.keys.len()
  }
}

impl Iterator for DbIterator<'_> {
  type Item = Result<(Bytes, Bytes)>;

  fn next(&mut self) -> Option<Self::Item> {
    for key in self.keys.by_ref() {
      if self.engine.is_closed() {
        return Some(Err(Errors::DatabaseClosed));
      }
      match self.engine.read_value(&key) {
        Ok(value) => return Some(Ok((key, value))),
        Err(Errors::KeyNotFound) => continue,
        Err(e) => return Some(Err(e)),
      }
    }
    None
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (0, Some(self.keys.len()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    option::Options,
    util::rand_kv::{get_test_key, get_test_value},
  };

  fn engine(dir: &std::path::Path) -> Engine {
    let mut opts = Options::default();
    opts.dir_path = dir.to_path_buf();
    opts.index_segments = 4;
    opts.number_of_records = 1024;
    Engine::open(opts).expect("failed to open engine")
  }

  #[test]
  fn test_iterator_empty() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut iter = engine.iter().unwrap();
    assert!(iter.next().is_none());
  }

  #[test]
  fn test_iterator_visits_every_live_key() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    for i in 0..200 {
      engine.put(get_test_key(i), get_test_value(i)).unwrap();
    }
    for i in 0..50 {
      engine.delete(get_test_key(i)).unwrap();
    }

    let mut keys: Vec<Bytes> = engine
      .iter()
      .unwrap()
      .map(|item| item.unwrap().0)
      .collect();
    keys.sort();
    let expected: Vec<Bytes> = (50..200).map(get_test_key).collect();
    assert_eq!(keys, expected);
  }

  #[test]
  fn test_iterator_skips_keys_deleted_after_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.put(get_test_key(1), Bytes::from("one")).unwrap();
    engine.put(get_test_key(2), Bytes::from("two")).unwrap();

    let iter = engine.iter().unwrap();
    assert_eq!(iter.remaining(), 2);
    engine.delete(get_test_key(1)).unwrap();
    engine.put(get_test_key(2), Bytes::from("two-again")).unwrap();

    let items: Vec<(Bytes, Bytes)> = iter.map(|item| item.unwrap()).collect();
    assert_eq!(items, vec![(get_test_key(2), Bytes::from("two-again"))]);
  }

  #[test]
  fn test_iterator_does_not_count_gets() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.put(get_test_key(1), get_test_value(1)).unwrap();
    assert_eq!(engine.iter().unwrap().count(), 1);
    assert_eq!(engine.stats().get_count, 0);
  }
}
