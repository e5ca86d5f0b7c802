use std::{fs::OpenOptions, path::Path, sync::Arc};

use log::error;
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Read-only memory mapped I/O, used to scan data files while rebuilding
/// the index on open.
pub struct MMapIO {
  map: Arc<Mutex<Option<Mmap>>>,
}

impl MMapIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    match OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(file_name)
    {
      Ok(file) => {
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        // zero length files cannot be mapped on every platform
        let map = if len == 0 {
          None
        } else {
          match unsafe { Mmap::map(&file) } {
            Ok(map) => Some(map),
            Err(e) => {
              error!("failed to map data file: {}", e);
              return Err(Errors::FailedToOpenDataFile);
            }
          }
        };
        Ok(MMapIO {
          map: Arc::new(Mutex::new(map)),
        })
      }
      Err(e) => {
        error!("failed to open data file error: {}", e);
        Err(Errors::FailedToOpenDataFile)
      }
    }
  }
}

impl IOManager for MMapIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let map_guard = self.map.lock();
    let map_arr = match map_guard.as_ref() {
      Some(map) => map,
      None => return Ok(0),
    };
    let len = map_arr.len() as u64;
    if offset >= len {
      return Ok(0);
    }
    let end = (offset + buf.len() as u64).min(len);
    let val = &map_arr[offset as usize..end as usize];
    buf[..val.len()].copy_from_slice(val);
    Ok(val.len())
  }

  fn write(&self, _buf: &[u8]) -> Result<usize> {
    error!("memory mapped data files are read only");
    Err(Errors::FailedToWriteToDataFile)
  }

  fn sync(&self) -> Result<()> {
    Ok(())
  }

  fn size(&self) -> u64 {
    let map_guard = self.map.lock();
    map_guard.as_ref().map(|m| m.len() as u64).unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use crate::fio::file_io::FileIO;

  use super::*;

  #[test]
  fn test_mmap_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmap-test.data");

    // file is empty
    let mmap_io1 = MMapIO::new(&path).unwrap();
    let mut buf1 = [0u8; 10];
    assert_eq!(mmap_io1.read(&mut buf1, 0).unwrap(), 0);

    let fio = FileIO::new(&path).unwrap();
    fio.write(b"hello world").unwrap();
    fio.write(b"good morning").unwrap();
    fio.sync().unwrap();

    // file is not empty
    let mmap_io2 = MMapIO::new(&path).unwrap();
    let mut buf2 = [0u8; 11];
    assert_eq!(mmap_io2.read(&mut buf2, 0).unwrap(), 11);
    assert_eq!(&buf2, b"hello world");

    let mut tail = [0u8; 32];
    assert_eq!(mmap_io2.read(&mut tail, 11).unwrap(), 12);
    assert_eq!(&tail[..12], b"good morning");

    fs::remove_file(&path).unwrap();
  }

  #[test]
  fn test_mmap_size_and_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmap-size.data");

    let mmap_io1 = MMapIO::new(&path).unwrap();
    assert_eq!(mmap_io1.size(), 0);
    assert_eq!(mmap_io1.write(b"x").err(), Some(Errors::FailedToWriteToDataFile));

    let fio = FileIO::new(&path).unwrap();
    fio.write(b"seeyou again").unwrap();

    let mmap_io2 = MMapIO::new(&path).unwrap();
    assert_eq!(mmap_io2.size(), 12);
  }
}
