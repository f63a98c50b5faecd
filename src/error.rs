//! Error taxonomy for the cache engine.
//!
//! Every error here is `Clone` so a single terminal result can be handed to
//! all callers that were coalesced onto the same work unit.

use std::io;
use thiserror::Error;

/// Failure reported by a [`Fetcher`](crate::cache::Fetcher).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// Timeouts, connection resets, 5xx-class responses. Worth retrying.
  #[error("transient failure fetching {url}: {reason}")]
  Transient { url: String, reason: String },

  /// The resource is gone or the request can never succeed.
  #[error("permanent failure fetching {url}: {reason}")]
  Permanent { url: String, reason: String },
}

impl FetchError {
  pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::Transient {
      url: url.into(),
      reason: reason.into(),
    }
  }

  pub fn permanent(url: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::Permanent {
      url: url.into(),
      reason: reason.into(),
    }
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient { .. })
  }

  pub fn url(&self) -> &str {
    match self {
      Self::Transient { url, .. } | Self::Permanent { url, .. } => url,
    }
  }
}

/// Failure reported by the [`FileStore`](crate::cache::FileStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FileError {
  #[error("no cached file for {key}")]
  NotFound { key: String },

  #[error("disk full while writing {key}")]
  DiskFull { key: String },

  #[error("permission denied for {key}")]
  PermissionDenied { key: String },

  #[error("I/O error for {key}: {message}")]
  Other { key: String, message: String },
}

impl FileError {
  /// Classify an I/O error for the given cache key.
  pub fn from_io(key: &str, err: &io::Error) -> Self {
    let key = key.to_string();
    match err.kind() {
      io::ErrorKind::NotFound => Self::NotFound { key },
      io::ErrorKind::PermissionDenied => Self::PermissionDenied { key },
      io::ErrorKind::StorageFull => Self::DiskFull { key },
      _ => Self::Other {
        key,
        message: err.to_string(),
      },
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }
}

/// Failure reported by the [`CacheRecordStore`](crate::db::CacheRecordStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
  #[error("transaction aborted: {0}")]
  TransactionAborted(String),

  #[error("no record for {key}")]
  NotFound { key: String },
}

impl From<rusqlite::Error> for RecordError {
  fn from(err: rusqlite::Error) -> Self {
    Self::TransactionAborted(err.to_string())
  }
}

/// Error raised inside a record transaction that also touches files.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
  #[error(transparent)]
  Record(#[from] RecordError),

  #[error(transparent)]
  File(#[from] FileError),
}

impl StoreError {
  /// Attach the key of the group or item the failed operation was for.
  pub fn into_cache_error(self, key: impl Into<String>) -> CacheError {
    match self {
      Self::Record(source) => CacheError::record(key, source),
      Self::File(source) => CacheError::file(key, source),
    }
  }
}

/// Error surfaced to cache callers, tagged with the key involved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  #[error("fetch failed for {key}: {source}")]
  FetchFailed {
    key: String,
    #[source]
    source: FetchError,
  },

  #[error("file store failed for {key}: {source}")]
  File {
    key: String,
    #[source]
    source: FileError,
  },

  #[error("record store failed for {key}: {source}")]
  Record {
    key: String,
    #[source]
    source: RecordError,
  },

  #[error("caching {key} was cancelled by a removal request")]
  Cancelled { key: String },

  #[error("work for {key} was abandoned before completing")]
  Abandoned { key: String },
}

impl CacheError {
  pub fn fetch(key: impl Into<String>, source: FetchError) -> Self {
    Self::FetchFailed {
      key: key.into(),
      source,
    }
  }

  pub fn file(key: impl Into<String>, source: FileError) -> Self {
    Self::File {
      key: key.into(),
      source,
    }
  }

  pub fn record(key: impl Into<String>, source: RecordError) -> Self {
    Self::Record {
      key: key.into(),
      source,
    }
  }

  /// Only transient fetch failures are retried. Disk and database errors are
  /// terminal for the work unit that hit them.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::FetchFailed { source, .. } if source.is_transient())
  }

  pub fn key(&self) -> &str {
    match self {
      Self::FetchFailed { key, .. }
      | Self::File { key, .. }
      | Self::Record { key, .. }
      | Self::Cancelled { key }
      | Self::Abandoned { key } => key,
    }
  }
}

/// Terminal failure of a work unit, as delivered to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{group_key} failed after {attempts} attempt(s): {source}")]
pub struct SyncError {
  pub group_key: String,
  /// Zero when the unit was cancelled before it ever ran
  pub attempts: u32,
  #[source]
  pub source: CacheError,
}
