//! Test doubles: a scripted fetcher and an isolated store graph.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use super::file_store::FileStore;
use super::syncer::{RetryPolicy, Syncer, SyncerOptions};
use super::traits::{FetchRequest, Fetched, Fetcher};
use super::writer::ContentWriter;
use crate::db::CacheRecordStore;
use crate::error::FetchError;

#[derive(Default)]
struct Script {
  /// Responses consumed in order; the last one repeats.
  responses: HashMap<String, VecDeque<Result<Fetched, FetchError>>>,
  /// Etag that makes a URL answer NotModified.
  current_etags: HashMap<String, String>,
  calls: HashMap<String, u32>,
  last_etags: HashMap<String, Option<String>>,
}

/// Fetcher that answers from a per-URL script and counts calls.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
  script: Arc<Mutex<Script>>,
  delay: Option<Duration>,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sleep before answering every request.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn respond(&self, url: &str, fetched: Fetched) {
    self.respond_sequence(url, vec![Ok(fetched)]);
  }

  pub fn fail(&self, url: &str, error: FetchError) {
    self.respond_sequence(url, vec![Err(error)]);
  }

  pub fn respond_sequence(&self, url: &str, responses: Vec<Result<Fetched, FetchError>>) {
    let mut script = self.script.lock().unwrap();
    script.responses.insert(url.to_string(), responses.into());
  }

  /// Answer NotModified when a request carries `etag`.
  pub fn respond_if_match(&self, url: &str, etag: &str) {
    let mut script = self.script.lock().unwrap();
    script
      .current_etags
      .insert(url.to_string(), etag.to_string());
  }

  pub fn calls(&self, url: &str) -> u32 {
    let script = self.script.lock().unwrap();
    script.calls.get(url).copied().unwrap_or(0)
  }

  pub fn last_etag(&self, url: &str) -> Option<String> {
    let script = self.script.lock().unwrap();
    script.last_etags.get(url).cloned().flatten()
  }

  fn answer(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
    let mut script = self.script.lock().unwrap();
    *script.calls.entry(request.url.clone()).or_default() += 1;
    script
      .last_etags
      .insert(request.url.clone(), request.etag.clone());

    if let (Some(sent), Some(current)) = (&request.etag, script.current_etags.get(&request.url)) {
      if sent == current {
        return Ok(Fetched::not_modified());
      }
    }

    let queue = script
      .responses
      .get_mut(&request.url)
      .ok_or_else(|| FetchError::permanent(&request.url, "no scripted response"))?;

    if queue.len() > 1 {
      queue.pop_front().unwrap()
    } else {
      queue.front().cloned().unwrap()
    }
  }
}

impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: FetchRequest) -> Result<Fetched, FetchError> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self.answer(&request)
  }
}

/// Stores over a temp directory and an in-memory database.
pub struct TestCache {
  _dir: TempDir,
  pub fetcher: Arc<ScriptedFetcher>,
  pub records: Arc<CacheRecordStore>,
  pub files: Arc<FileStore>,
}

impl TestCache {
  pub fn new(fetcher: ScriptedFetcher) -> Self {
    let dir = TempDir::new().unwrap();
    let files = FileStore::open(dir.path().join("files")).unwrap();

    Self {
      fetcher: Arc::new(fetcher),
      records: Arc::new(CacheRecordStore::open_in_memory().unwrap()),
      files: Arc::new(files),
      _dir: dir,
    }
  }

  pub fn writer(&self) -> ContentWriter<ScriptedFetcher> {
    ContentWriter::new(
      Arc::clone(&self.fetcher),
      Arc::clone(&self.records),
      Arc::clone(&self.files),
    )
  }

  /// Syncer with millisecond backoff so retry tests run fast.
  pub fn syncer(&self) -> Syncer<ScriptedFetcher> {
    self.syncer_with(SyncerOptions {
      max_concurrent: 4,
      retry: RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
      },
    })
  }

  pub fn syncer_with(&self, options: SyncerOptions) -> Syncer<ScriptedFetcher> {
    Syncer::new(
      Arc::clone(&self.fetcher),
      Arc::clone(&self.records),
      Arc::clone(&self.files),
      options,
    )
  }
}
