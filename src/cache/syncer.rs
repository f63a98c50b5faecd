//! Work queue that drives cache and removal requests to completion.
//!
//! Each group key gets at most one driver task. The driver runs the key's
//! current work unit, retries transient failures with exponential backoff and
//! then moves on to whatever was queued behind it. Requests that arrive while
//! an equivalent unit is waiting or running are coalesced onto it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::file_store::FileStore;
use super::keys;
use super::references::GroupReferenceManager;
use super::traits::Fetcher;
use super::variants;
use super::writer::{CacheOutcome, ContentWriter};
use crate::db::{CacheRecordStore, ItemHandle, OrphanCursor, RecordStats};
use crate::error::{CacheError, RecordError, StoreError, SyncError};

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`,
  /// capped at `max_delay`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncerOptions {
  /// Work units allowed in flight at once, across all keys
  pub max_concurrent: usize,
  pub retry: RetryPolicy,
}

impl Default for SyncerOptions {
  fn default() -> Self {
    Self {
      max_concurrent: 4,
      retry: RetryPolicy::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
  Cache { url: String },
  Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
  /// Waiting for a concurrency permit
  Pending,
  InFlight,
  /// Terminal; kept as the key's last finished unit
  Succeeded,
  /// `permanent: false` while waiting out a retry backoff. `permanent: true`
  /// is terminal.
  Failed { permanent: bool },
}

/// One queued or running operation for a group key.
#[derive(Debug, Clone)]
pub struct WorkUnit {
  pub group_key: String,
  pub operation: Operation,
  pub state: WorkState,
  pub attempts: u32,
  pub last_error: Option<CacheError>,
}

impl WorkUnit {
  fn new(group_key: &str, operation: Operation) -> Self {
    Self {
      group_key: group_key.to_string(),
      operation,
      state: WorkState::Pending,
      attempts: 0,
      last_error: None,
    }
  }

  fn is_cache(&self) -> bool {
    matches!(self.operation, Operation::Cache { .. })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOutcome {
  pub group_key: String,
  /// False when there was nothing cached under the key
  pub existed: bool,
  /// Storage keys of items whose file and record were deleted
  pub reclaimed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  Cached(CacheOutcome),
  Removed(RemovalOutcome),
}

/// Terminal success of a work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
  pub group_key: String,
  pub attempts: u32,
  pub outcome: SyncOutcome,
}

pub type WorkResult = Result<Completed, SyncError>;

/// Resolves exactly once with the terminal result of a request.
///
/// Dropping it does not cancel the work.
pub struct Completion {
  group_key: String,
  rx: oneshot::Receiver<WorkResult>,
}

impl Future for Completion {
  type Output = WorkResult;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.rx).poll(cx) {
      Poll::Ready(Ok(result)) => Poll::Ready(result),
      Poll::Ready(Err(_)) => Poll::Ready(Err(SyncError {
        group_key: self.group_key.clone(),
        attempts: 0,
        source: CacheError::Abandoned {
          key: self.group_key.clone(),
        },
      })),
      Poll::Pending => Poll::Pending,
    }
  }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  pub reclaimed: Vec<String>,
  /// Orphans that could not be reclaimed this pass
  pub failed: usize,
  pub empty_groups_removed: usize,
  /// Where the orphan walk stopped
  pub cursor: OrphanCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  #[serde(flatten)]
  pub records: RecordStats,
  pub used_bytes: u64,
}

type Waiter = oneshot::Sender<WorkResult>;

struct Queued {
  unit: WorkUnit,
  waiters: Vec<Waiter>,
}

impl Queued {
  fn new(unit: WorkUnit, waiter: Waiter) -> Self {
    Self {
      unit,
      waiters: vec![waiter],
    }
  }
}

/// Per-key state. Its presence in the map is the key's exclusion token.
struct Slot {
  current: Queued,
  queue: VecDeque<Queued>,
  /// Cuts a retry backoff short when the unit backing off is replaced
  wake: Arc<Notify>,
}

impl Slot {
  fn new(current: Queued) -> Self {
    Self {
      current,
      queue: VecDeque::new(),
      wake: Arc::new(Notify::new()),
    }
  }

  fn enqueue_cache(&mut self, group_key: &str, url: &str, waiter: Waiter) {
    let last = self.queue.back_mut().unwrap_or(&mut self.current);
    if last.unit.is_cache() {
      debug!(group = group_key, "Coalesced cache request");
      last.waiters.push(waiter);
    } else {
      let unit = WorkUnit::new(
        group_key,
        Operation::Cache {
          url: url.to_string(),
        },
      );
      self.queue.push_back(Queued::new(unit, waiter));
    }
  }

  /// Queue a removal. Returns waiters of cache units it cancelled.
  fn enqueue_removal(&mut self, group_key: &str, waiter: Waiter) -> Vec<Waiter> {
    let mut cancelled = Vec::new();

    let (caches, rest): (VecDeque<_>, VecDeque<_>) =
      self.queue.drain(..).partition(|q| q.unit.is_cache());
    self.queue = rest;
    cancelled.extend(caches.into_iter().flat_map(|q| q.waiters));

    if self.current.unit.is_cache() && self.current.unit.state != WorkState::InFlight {
      let unit = WorkUnit::new(group_key, Operation::Remove);
      let replaced = std::mem::replace(&mut self.current, Queued::new(unit, waiter));
      cancelled.extend(replaced.waiters);
      if replaced.unit.state == (WorkState::Failed { permanent: false }) {
        self.wake.notify_one();
      }
      return cancelled;
    }

    let last = self.queue.back_mut().unwrap_or(&mut self.current);
    if last.unit.operation == Operation::Remove {
      last.waiters.push(waiter);
    } else {
      let unit = WorkUnit::new(group_key, Operation::Remove);
      self.queue.push_back(Queued::new(unit, waiter));
    }
    cancelled
  }
}

struct Inner<F: Fetcher> {
  writer: ContentWriter<F>,
  records: Arc<CacheRecordStore>,
  files: Arc<FileStore>,
  references: GroupReferenceManager,
  slots: Mutex<HashMap<String, Slot>>,
  /// Last terminal unit per key. Written under the `slots` lock.
  finished: Mutex<HashMap<String, WorkUnit>>,
  permits: Semaphore,
  retry: RetryPolicy,
}

/// Entry point for caching and removal requests.
pub struct Syncer<F: Fetcher> {
  inner: Arc<Inner<F>>,
}

impl<F: Fetcher> Clone for Syncer<F> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<F: Fetcher> Syncer<F> {
  pub fn new(
    fetcher: Arc<F>,
    records: Arc<CacheRecordStore>,
    files: Arc<FileStore>,
    options: SyncerOptions,
  ) -> Self {
    let writer = ContentWriter::new(fetcher, Arc::clone(&records), Arc::clone(&files));

    Self {
      inner: Arc::new(Inner {
        writer,
        records,
        files,
        references: GroupReferenceManager,
        slots: Mutex::new(HashMap::new()),
        finished: Mutex::new(HashMap::new()),
        permits: Semaphore::new(options.max_concurrent.max(1)),
        retry: options.retry,
      }),
    }
  }

  /// Make `url` available offline under `group_key`.
  ///
  /// Coalesces with a cache request for the same key that has not finished.
  /// Must be called from within a tokio runtime.
  pub fn request_cache(&self, url: &str, group_key: &str) -> Completion {
    let (tx, rx) = oneshot::channel();

    let spawn = {
      let mut slots = self.inner.lock_slots();
      match slots.get_mut(group_key) {
        Some(slot) => {
          slot.enqueue_cache(group_key, url, tx);
          false
        }
        None => {
          let unit = WorkUnit::new(
            group_key,
            Operation::Cache {
              url: url.to_string(),
            },
          );
          slots.insert(group_key.to_string(), Slot::new(Queued::new(unit, tx)));
          true
        }
      }
    };

    if spawn {
      tokio::spawn(Arc::clone(&self.inner).drive(group_key.to_string()));
    }

    Completion {
      group_key: group_key.to_string(),
      rx,
    }
  }

  /// Remove `group_key` and reclaim items nothing else references.
  ///
  /// A cache unit for the key that has not started is cancelled; one in flight
  /// finishes first and the removal runs right after it.
  pub fn request_removal(&self, group_key: &str) -> Completion {
    let (tx, rx) = oneshot::channel();

    let (spawn, cancelled) = {
      let mut slots = self.inner.lock_slots();
      match slots.get_mut(group_key) {
        Some(slot) => (false, slot.enqueue_removal(group_key, tx)),
        None => {
          let unit = WorkUnit::new(group_key, Operation::Remove);
          slots.insert(group_key.to_string(), Slot::new(Queued::new(unit, tx)));
          (true, Vec::new())
        }
      }
    };

    if !cancelled.is_empty() {
      info!(
        group = group_key,
        waiters = cancelled.len(),
        "Cancelled pending cache request"
      );
    }
    for waiter in cancelled {
      let _ = waiter.send(Err(SyncError {
        group_key: group_key.to_string(),
        attempts: 0,
        source: CacheError::Cancelled {
          key: group_key.to_string(),
        },
      }));
    }

    if spawn {
      tokio::spawn(Arc::clone(&self.inner).drive(group_key.to_string()));
    }

    Completion {
      group_key: group_key.to_string(),
      rx,
    }
  }

  /// Snapshot of the unit currently waiting or running for `group_key`,
  /// or else of the last one that finished.
  pub fn work_unit(&self, group_key: &str) -> Option<WorkUnit> {
    let slots = self.inner.lock_slots();
    match slots.get(group_key) {
      Some(slot) => Some(slot.current.unit.clone()),
      None => self.inner.lock_finished().get(group_key).cloned(),
    }
  }

  /// Reclaim every orphaned item, then delete groups left without members.
  pub async fn run_reconciliation_pass(&self) -> Result<ReconcileReport, CacheError> {
    let records = Arc::clone(&self.inner.records);
    let files = Arc::clone(&self.inner.files);

    let report = tokio::task::spawn_blocking(move || reconcile(&records, &files))
      .await
      .map_err(|_| CacheError::Abandoned {
        key: "reconciliation".to_string(),
      })??;

    info!(
      reclaimed = report.reclaimed.len(),
      failed = report.failed,
      empty_groups = report.empty_groups_removed,
      "Reconciliation pass finished"
    );
    Ok(report)
  }

  /// Run a reconciliation pass every `interval` until the handle is aborted.
  pub fn spawn_reconciler(&self, interval: Duration) -> JoinHandle<()> {
    let syncer = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        if let Err(e) = syncer.run_reconciliation_pass().await {
          warn!(error = %e, "Reconciliation pass failed");
        }
      }
    })
  }

  /// Cached bytes for a resource URL.
  ///
  /// An image rendition that is not on disk is served from the closest one
  /// that is: the narrowest wider one, else the widest narrower one.
  pub async fn read(&self, url: &str) -> Result<Vec<u8>, CacheError> {
    let id = keys::item_id(url);
    let records = Arc::clone(&self.inner.records);
    let files = Arc::clone(&self.inner.files);
    let key = id.storage_key();

    tokio::task::spawn_blocking(move || -> Result<Vec<u8>, CacheError> {
      let key = id.storage_key();
      if id.variant.is_none() || files.exists(&key) {
        return files.read(&key).map_err(|e| CacheError::file(&key, e));
      }

      let on_disk: Vec<ItemHandle> = records
        .variants_of(&id.key)
        .map_err(|e| CacheError::record(&key, e))?
        .into_iter()
        .filter(|item| files.exists(&item.storage_key()))
        .collect();
      let source = variants::best_for_read(&id, &on_disk)
        .map(|item| item.storage_key())
        .unwrap_or_else(|| key.clone());
      if source != key {
        debug!(item = %key, from = %source, "Serving closest rendition");
      }
      files.read(&source).map_err(|e| CacheError::file(&key, e))
    })
    .await
    .map_err(|_| CacheError::Abandoned { key })?
  }

  /// Cached bytes of the document a group was created for.
  pub async fn read_document(&self, group_key: &str) -> Result<Vec<u8>, CacheError> {
    let records = Arc::clone(&self.inner.records);
    let files = Arc::clone(&self.inner.files);
    let key = group_key.to_string();

    tokio::task::spawn_blocking(move || -> Result<Vec<u8>, CacheError> {
      let root = records
        .group_record(&key)
        .map_err(|e| CacheError::record(&key, e))?
        .and_then(|group| group.root_item)
        .ok_or_else(|| CacheError::record(&key, RecordError::NotFound { key: key.clone() }))?;
      files.read(&root).map_err(|e| CacheError::file(&key, e))
    })
    .await
    .map_err(|_| CacheError::Abandoned {
      key: group_key.to_string(),
    })?
  }

  /// Whether the group exists and its document is on disk.
  pub async fn is_cached(&self, group_key: &str) -> Result<bool, CacheError> {
    let records = Arc::clone(&self.inner.records);
    let files = Arc::clone(&self.inner.files);
    let key = group_key.to_string();

    tokio::task::spawn_blocking(move || -> Result<bool, CacheError> {
      let group = records
        .group_record(&key)
        .map_err(|e| CacheError::record(&key, e))?;
      Ok(
        group
          .and_then(|g| g.root_item)
          .is_some_and(|root| files.exists(&root)),
      )
    })
    .await
    .map_err(|_| CacheError::Abandoned {
      key: group_key.to_string(),
    })?
  }

  pub async fn stats(&self) -> Result<CacheStats, CacheError> {
    let records = Arc::clone(&self.inner.records);
    let files = Arc::clone(&self.inner.files);

    tokio::task::spawn_blocking(move || -> Result<CacheStats, CacheError> {
      let records = records
        .stats()
        .map_err(|e| CacheError::record("stats", e))?;
      let used_bytes = files
        .used_space()
        .map_err(|e| CacheError::file("stats", e))?;
      Ok(CacheStats {
        records,
        used_bytes,
      })
    })
    .await
    .map_err(|_| CacheError::Abandoned {
      key: "stats".to_string(),
    })?
  }
}

impl<F: Fetcher> Inner<F> {
  fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
    // Slot bookkeeping never panics mid-update, so a poisoned map is intact.
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_finished(&self) -> MutexGuard<'_, HashMap<String, WorkUnit>> {
    self.finished.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Drive the work units of one group key until none are left.
  async fn drive(self: Arc<Self>, key: String) {
    loop {
      let Ok(permit) = self.permits.acquire().await else {
        return;
      };

      let (operation, attempt) = {
        let mut slots = self.lock_slots();
        let Some(slot) = slots.get_mut(&key) else {
          return;
        };
        let unit = &mut slot.current.unit;
        unit.state = WorkState::InFlight;
        unit.attempts += 1;
        (unit.operation.clone(), unit.attempts)
      };

      debug!(group = %key, ?operation, attempt, "Work unit in flight");
      let result = self.execute(&key, &operation).await;
      drop(permit);

      if let Err(e) = &result {
        if e.is_transient() && attempt < self.retry.max_attempts {
          let delay = self.retry.delay_for(attempt);
          warn!(group = %key, attempt, ?delay, error = %e, "Transient failure, retrying");
          let backoff = WorkState::Failed { permanent: false };
          let wake = self.set_current_state(&key, backoff, Some(e.clone()));

          if let Some(wake) = wake {
            tokio::select! {
              _ = tokio::time::sleep(delay) => {}
              _ = wake.notified() => debug!(group = %key, "Backoff cut short"),
            }
          }

          // A removal may have replaced the unit while it was backing off.
          let mut slots = self.lock_slots();
          if let Some(slot) = slots.get_mut(&key) {
            if slot.current.unit.state == (WorkState::Failed { permanent: false }) {
              slot.current.unit.state = WorkState::Pending;
            }
          }
          continue;
        }
      }

      let (done, more) = {
        let mut slots = self.lock_slots();
        let Some(slot) = slots.get_mut(&key) else {
          return;
        };
        let (mut done, more) = match slot.queue.pop_front() {
          Some(next) => (std::mem::replace(&mut slot.current, next), true),
          None => match slots.remove(&key) {
            Some(slot) => (slot.current, false),
            None => return,
          },
        };

        done.unit.state = match &result {
          Ok(_) => WorkState::Succeeded,
          Err(_) => WorkState::Failed { permanent: true },
        };
        done.unit.last_error = result.as_ref().err().cloned();
        self
          .lock_finished()
          .insert(key.clone(), done.unit.clone());
        (done.waiters, more)
      };

      let report = match result {
        Ok(outcome) => {
          info!(group = %key, attempts = attempt, "Work unit succeeded");
          Ok(Completed {
            group_key: key.clone(),
            attempts: attempt,
            outcome,
          })
        }
        Err(source) => {
          warn!(group = %key, attempts = attempt, error = %source, "Work unit failed");
          Err(SyncError {
            group_key: key.clone(),
            attempts: attempt,
            source,
          })
        }
      };

      for waiter in done {
        let _ = waiter.send(report.clone());
      }

      if !more {
        return;
      }
    }
  }

  /// Returns the slot's wake handle, or `None` if the key has no slot.
  fn set_current_state(
    &self,
    key: &str,
    state: WorkState,
    error: Option<CacheError>,
  ) -> Option<Arc<Notify>> {
    let mut slots = self.lock_slots();
    let slot = slots.get_mut(key)?;
    slot.current.unit.state = state;
    slot.current.unit.last_error = error;
    Some(Arc::clone(&slot.wake))
  }

  async fn execute(&self, key: &str, operation: &Operation) -> Result<SyncOutcome, CacheError> {
    match operation {
      Operation::Cache { url } => {
        let outcome = self.writer.ensure_cached(url, key).await?;
        if !outcome.released.is_empty() {
          // The group is committed; leftovers are picked up by the next pass.
          if let Err(e) = self.reclaim(key, outcome.released.clone()).await {
            warn!(group = key, error = %e, "Failed to reclaim released items");
          }
        }
        Ok(SyncOutcome::Cached(outcome))
      }
      Operation::Remove => self.remove(key).await.map(SyncOutcome::Removed),
    }
  }

  async fn remove(&self, key: &str) -> Result<RemovalOutcome, CacheError> {
    let records = Arc::clone(&self.records);
    let files = Arc::clone(&self.files);
    let references = self.references;
    let group_key = key.to_string();

    tokio::task::spawn_blocking(move || -> Result<RemovalOutcome, CacheError> {
      let (existed, orphans) = records
        .transaction(|tx| -> Result<_, RecordError> {
          let existed = tx.find_group(&group_key)?.is_some();
          Ok((existed, references.remove_group(tx, &group_key)?))
        })
        .map_err(|e| CacheError::record(&group_key, e))?;

      let reclaimed =
        reclaim_items(&records, &files, &orphans).map_err(|e| e.into_cache_error(&group_key))?;

      info!(
        group = %group_key,
        existed,
        reclaimed = reclaimed.len(),
        "Removed group"
      );
      Ok(RemovalOutcome {
        group_key,
        existed,
        reclaimed,
      })
    })
    .await
    .map_err(|_| CacheError::Abandoned {
      key: key.to_string(),
    })?
  }

  async fn reclaim(&self, key: &str, items: Vec<ItemHandle>) -> Result<Vec<String>, CacheError> {
    let records = Arc::clone(&self.records);
    let files = Arc::clone(&self.files);
    let group_key = key.to_string();

    tokio::task::spawn_blocking(move || {
      reclaim_items(&records, &files, &items).map_err(|e| e.into_cache_error(group_key))
    })
    .await
    .map_err(|_| CacheError::Abandoned {
      key: key.to_string(),
    })?
  }
}

/// Delete file then record for each item still unreferenced.
///
/// The count is re-checked inside the transaction that deletes the file, so
/// an item relinked by a concurrent write is left alone.
fn reclaim_items(
  records: &CacheRecordStore,
  files: &FileStore,
  items: &[ItemHandle],
) -> Result<Vec<String>, StoreError> {
  let mut reclaimed = Vec::new();
  for item in items {
    if reclaim_item(records, files, item)? {
      reclaimed.push(item.storage_key());
    }
  }
  Ok(reclaimed)
}

fn reclaim_item(
  records: &CacheRecordStore,
  files: &FileStore,
  item: &ItemHandle,
) -> Result<bool, StoreError> {
  records.transaction(|tx| -> Result<bool, StoreError> {
    if tx.reference_count(item)? > 0 {
      return Ok(false);
    }
    files.delete(&item.storage_key())?;
    tx.delete_item(item)?;
    debug!(item = %item.storage_key(), "Reclaimed item");
    Ok(true)
  })
}

fn reconcile(records: &CacheRecordStore, files: &FileStore) -> Result<ReconcileReport, CacheError> {
  let mut report = ReconcileReport::default();
  let mut sweep = records.items_orphaned_since(OrphanCursor::default());

  for item in sweep.by_ref() {
    let item = item.map_err(|e| CacheError::record("orphan sweep", e))?;
    match reclaim_item(records, files, &item) {
      Ok(true) => report.reclaimed.push(item.storage_key()),
      Ok(false) => {}
      Err(e) => {
        warn!(item = %item.storage_key(), error = %e, "Failed to reclaim orphan");
        report.failed += 1;
      }
    }
  }
  report.cursor = sweep.cursor();

  report.empty_groups_removed = records
    .transaction(|tx| -> Result<usize, RecordError> {
      let empty = tx.empty_groups()?;
      for group in &empty {
        tx.delete_group(group)?;
      }
      Ok(empty.len())
    })
    .map_err(|e| CacheError::record("empty groups", e))?;

  Ok(report)
}
