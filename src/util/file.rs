use std::{fs, path::Path};

/// Free space on the volume holding `dir_path`. Reports no limit when the
/// volume cannot be queried.
pub fn available_disk_space<P>(dir_path: P) -> u64
where
  P: AsRef<Path>,
{
  fs2::available_space(dir_path.as_ref()).unwrap_or(u64::MAX)
}

/// Total size of the regular files directly inside `dir_path`.
pub fn dir_disk_size<P>(dir_path: P) -> u64
where
  P: AsRef<Path>,
{
  match fs::read_dir(dir_path) {
    Ok(dir) => dir
      .flatten()
      .filter_map(|entry| entry.metadata().ok())
      .filter(|meta| meta.is_file())
      .map(|meta| meta.len())
      .sum(),
    Err(_) => 0,
  }
}
