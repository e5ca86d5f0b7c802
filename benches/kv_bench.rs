use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use haven_kv::{
  db::Engine,
  option::Options,
  util::rand_kv::{get_test_key, get_test_value},
};
use rand::Rng;

const PRELOAD: usize = 100000;

fn open_engine(dir: &tempfile::TempDir, use_memory_pool: bool) -> Engine {
  let mut option = Options::default();
  option.dir_path = dir.path().to_path_buf();
  option.max_file_size = 64 * 1024 * 1024;
  option.number_of_records = PRELOAD * 2;
  option.use_memory_pool = use_memory_pool;
  option.fixed_key_size = 32;
  Engine::open(option).unwrap()
}

fn preload(engine: &Engine) {
  for i in 0..PRELOAD {
    let res = engine.put(get_test_key(i), get_test_value(i));
    assert!(res.is_ok());
  }
}

fn bench_put(c: &mut Criterion) {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(&dir, false);
  let mut rnd = rand::rng();

  c.bench_function("haven-kv-put-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..u32::MAX) as usize;
      let res = engine.put(get_test_key(i), get_test_value(i));
      assert!(res.is_ok());
    })
  });
}

fn bench_put_memory_pool(c: &mut Criterion) {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(&dir, true);
  let mut rnd = rand::rng();

  c.bench_function("haven-kv-put-memory-pool-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..u32::MAX) as usize;
      let res = engine.put(get_test_key(i), get_test_value(i));
      assert!(res.is_ok());
    })
  });
}

fn bench_overwrite(c: &mut Criterion) {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(&dir, false);
  preload(&engine);
  let mut rnd = rand::rng();

  c.bench_function("haven-kv-overwrite-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..PRELOAD);
      let res = engine.put(get_test_key(i), Bytes::from("overwritten value"));
      assert!(res.is_ok());
    })
  });
}

fn bench_get(c: &mut Criterion) {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(&dir, false);
  preload(&engine);
  let mut rnd = rand::rng();

  c.bench_function("haven-kv-get-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..u32::MAX) as usize;
      let res = engine.get(get_test_key(i));
      if (0..PRELOAD).contains(&i) {
        assert!(res.is_ok());
      } else {
        assert!(res.is_err());
      }
    })
  });
}

fn bench_delete(c: &mut Criterion) {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(&dir, false);
  preload(&engine);
  let mut rnd = rand::rng();

  c.bench_function("haven-kv-delete-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..u32::MAX) as usize;
      engine.delete(get_test_key(i)).unwrap();
    })
  });
}

fn bench_iterate(c: &mut Criterion) {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(&dir, false);
  preload(&engine);

  c.bench_function("haven-kv-iterate-bench", |b| {
    b.iter(|| {
      let count = engine.iter().unwrap().filter(|item| item.is_ok()).count();
      assert_eq!(count, PRELOAD);
    })
  });
}

fn bench_stats(c: &mut Criterion) {
  let dir = tempfile::tempdir().unwrap();
  let engine = open_engine(&dir, false);
  preload(&engine);

  c.bench_function("haven-kv-stats-bench", |b| {
    b.iter(|| {
      let stats = engine.stats();
      assert_eq!(stats.record_count, PRELOAD);
    })
  });
}

criterion_group!(
  benches,
  bench_get,
  bench_put,
  bench_put_memory_pool,
  bench_overwrite,
  bench_delete,
  bench_iterate,
  bench_stats
);
criterion_main!(benches);
