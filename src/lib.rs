//! Haven-KV: an embedded, log-structured key-value store.
//!
//! Writes are appended to a set of segment files and located through an
//! in-memory hash index split into independently locked segments. A
//! background thread compacts segments whose stale ratio crosses a
//! threshold, copying their live records forward at a bounded rate.
//!
//! # Features
//!
//! * Append-only data files with checksummed records and crash-tolerant recovery
//! * Lock-striped index, optionally backed by a chunked memory pool
//! * Rate-limited background compaction running alongside readers and writers
//! * Tombstones kept only as long as an older copy of the key survives on disk
//!
//! # Basic Usage
//!
//! ```
//! use bytes::Bytes;
//! use haven_kv::{db::Engine, option::Options};
//!
//! let mut opts = Options::default();
//! opts.dir_path = std::env::temp_dir().join("haven-kv-doc");
//! let engine = Engine::open(opts.clone()).expect("failed to open haven-kv engine");
//!
//! let key = Bytes::from(b"hello".to_vec());
//! let value = Bytes::from(b"world".to_vec());
//! engine.put(key.clone(), value.clone()).expect("failed to put");
//!
//! let retrieved = engine.get(key.clone()).expect("failed to get");
//! assert_eq!(retrieved, value);
//!
//! engine.delete(key).expect("failed to delete");
//! engine.close().expect("failed to close");
//! # std::fs::remove_dir_all(opts.dir_path).ok();
//! ```

mod data;

mod fio;
mod index;
mod recovery;
mod tombstone;

pub mod compaction;
pub mod db;
pub mod errors;
pub mod iterator;
pub mod option;
pub mod stats;
pub mod util;
