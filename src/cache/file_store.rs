//! On-disk byte storage addressed by cache key.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::keys;
use crate::error::FileError;

const TEMP_DIR: &str = ".tmp";

/// Stores one file per cache key under a root directory.
///
/// Layout is `<root>/<ab>/<abcdef...>` where the name is the sha256 of the key.
/// In-progress writes live in `<root>/.tmp` and are renamed into place, so a
/// reader never observes a partially written file.
#[derive(Debug)]
pub struct FileStore {
  root: PathBuf,
}

impl FileStore {
  /// Open (creating if needed) a file store rooted at `root`.
  ///
  /// Leftover temp files from an interrupted write are removed.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, FileError> {
    let root = root.into();
    let temp = root.join(TEMP_DIR);
    fs::create_dir_all(&temp).map_err(|e| FileError::from_io(&root.display().to_string(), &e))?;

    if let Ok(entries) = fs::read_dir(&temp) {
      for entry in entries.flatten() {
        if let Err(e) = fs::remove_file(entry.path()) {
          warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temp file");
        }
      }
    }

    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Path for a key. Pure function of the key.
  pub fn location(&self, key: &str) -> PathBuf {
    let name = keys::file_name(key);
    self.root.join(&name[..2]).join(name)
  }

  pub fn exists(&self, key: &str) -> bool {
    self.location(key).is_file()
  }

  /// Write `bytes` for `key`, replacing any previous content atomically.
  pub fn write(&self, key: &str, bytes: &[u8]) -> Result<(), FileError> {
    self.stage(key, bytes)?.persist()
  }

  /// Write `bytes` to a synced temp file without touching `key` yet.
  ///
  /// Dropping the result discards the bytes.
  pub fn stage(&self, key: &str, bytes: &[u8]) -> Result<StagedFile, FileError> {
    let dest = self.location(key);
    let map = |e: io::Error| FileError::from_io(key, &e);

    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent).map_err(map)?;
    }

    let mut temp = NamedTempFile::new_in(self.root.join(TEMP_DIR)).map_err(map)?;
    temp.write_all(bytes).map_err(map)?;
    temp.as_file().sync_all().map_err(map)?;

    Ok(StagedFile {
      key: key.to_string(),
      len: bytes.len(),
      temp,
      dest,
    })
  }

  pub fn read(&self, key: &str) -> Result<Vec<u8>, FileError> {
    fs::read(self.location(key)).map_err(|e| FileError::from_io(key, &e))
  }

  /// Delete the file for `key`. Missing files are not an error.
  pub fn delete(&self, key: &str) -> Result<(), FileError> {
    match fs::remove_file(self.location(key)) {
      Ok(()) => {
        debug!(key, "Deleted cache file");
        Ok(())
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(FileError::from_io(key, &e)),
    }
  }

  pub fn size_on_disk(&self, key: &str) -> Result<u64, FileError> {
    fs::metadata(self.location(key))
      .map(|m| m.len())
      .map_err(|e| FileError::from_io(key, &e))
  }

  /// Total bytes held by cached files. In-progress temp files are not counted.
  pub fn used_space(&self) -> Result<u64, FileError> {
    let root_key = self.root.display().to_string();
    let map = |e: io::Error| FileError::from_io(&root_key, &e);

    let mut total = 0;
    for shard in fs::read_dir(&self.root).map_err(map)? {
      let shard = shard.map_err(map)?;
      if shard.file_name() == TEMP_DIR || !shard.file_type().map_err(map)?.is_dir() {
        continue;
      }
      for file in fs::read_dir(shard.path()).map_err(map)? {
        let file = file.map_err(map)?;
        total += file.metadata().map_err(map)?.len();
      }
    }
    Ok(total)
  }
}

/// Bytes on disk that become visible under their key on [`persist`].
///
/// [`persist`]: StagedFile::persist
#[derive(Debug)]
pub struct StagedFile {
  key: String,
  len: usize,
  temp: NamedTempFile,
  dest: PathBuf,
}

impl StagedFile {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Rename into place, replacing any previous content.
  pub fn persist(self) -> Result<(), FileError> {
    self
      .temp
      .persist(&self.dest)
      .map_err(|e| FileError::from_io(&self.key, &e.error))?;

    debug!(key = %self.key, bytes = self.len, "Wrote cache file");
    Ok(())
  }
}
