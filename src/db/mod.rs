//! Durable records for cache groups, cache items and their links.

pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::RecordError;

/// Orphan sweep page size.
const ORPHAN_PAGE_SIZE: usize = 64;

/// Handle to a stored cache group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupHandle {
  pub id: i64,
  pub key: String,
}

/// Identity of a stored item: canonical key plus an optional size variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemId {
  pub key: String,
  /// Pixel width of an image rendition
  pub variant: Option<u32>,
}

impl ItemId {
  pub fn new(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      variant: None,
    }
  }

  pub fn with_variant(mut self, variant: Option<u32>) -> Self {
    self.variant = variant.filter(|width| *width > 0);
    self
  }

  /// Name the item's bytes are stored under. Each variant gets its own file.
  pub fn storage_key(&self) -> String {
    match self.variant {
      None => self.key.clone(),
      Some(width) => format!("{}#{}px", self.key, width),
    }
  }
}

impl fmt::Display for ItemId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.storage_key())
  }
}

impl From<&str> for ItemId {
  fn from(key: &str) -> Self {
    Self::new(key)
  }
}

impl From<String> for ItemId {
  fn from(key: String) -> Self {
    Self::new(key)
  }
}

impl From<&String> for ItemId {
  fn from(key: &String) -> Self {
    Self::new(key.as_str())
  }
}

impl From<&ItemId> for ItemId {
  fn from(id: &ItemId) -> Self {
    id.clone()
  }
}

/// Handle to a stored cache item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemHandle {
  pub id: i64,
  pub key: String,
  pub variant: Option<u32>,
}

impl ItemHandle {
  pub fn item_id(&self) -> ItemId {
    ItemId::new(self.key.as_str()).with_variant(self.variant)
  }

  pub fn storage_key(&self) -> String {
    self.item_id().storage_key()
  }

  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      key: row.get(1)?,
      variant: variant_from_column(row.get(2)?),
    })
  }
}

/// Metadata recorded once an item's bytes are on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMeta {
  pub url: Option<String>,
  pub mime_type: Option<String>,
  pub etag: Option<String>,
  pub size: u64,
}

/// Full view of a stored item.
#[derive(Debug, Clone)]
pub struct ItemRecord {
  pub handle: ItemHandle,
  pub url: Option<String>,
  pub mime_type: Option<String>,
  pub etag: Option<String>,
  pub size: Option<u64>,
  /// None until the first successful write
  pub cached_at: Option<DateTime<Utc>>,
  pub reference_count: u64,
}

/// Full view of a stored group.
#[derive(Debug, Clone)]
pub struct GroupRecord {
  pub handle: GroupHandle,
  /// Key of the document item the group renders
  pub root_item: Option<String>,
  pub created_at: DateTime<Utc>,
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordStats {
  pub groups: u64,
  pub items: u64,
  pub links: u64,
}

/// Position in an orphan sweep. Items are visited in row id order, so a sweep
/// resumed from a cursor never revisits what it already yielded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrphanCursor(pub i64);

/// SQLite-backed record store.
///
/// A single connection behind a mutex. Every mutation runs inside
/// [`CacheRecordStore::transaction`], which is also the serialization point
/// for all writers.
pub struct CacheRecordStore {
  conn: Mutex<Connection>,
}

impl CacheRecordStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self, RecordError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        RecordError::TransactionAborted(format!(
          "Failed to create database directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    Self::from_connection(conn)
  }

  /// Private in-memory store, used by tests.
  pub fn open_in_memory() -> Result<Self, RecordError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, RecordError> {
    conn.pragma_update(None, "foreign_keys", true)?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<(), RecordError> {
    let conn = self.lock()?;
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < schema::SCHEMA_VERSION {
      if version == 0 {
        conn.execute_batch(schema::SCHEMA)?;
      } else if version < 2 {
        conn.execute_batch(schema::MIGRATE_ITEM_VARIANTS)?;
      }
      conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
      debug!(
        from = version,
        to = schema::SCHEMA_VERSION,
        "Migrated cache schema"
      );
    }

    Ok(())
  }

  /// Schema version marker, for callers that gate startup on it.
  pub fn schema_version(&self) -> Result<i64, RecordError> {
    let conn = self.lock()?;
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, RecordError> {
    self
      .conn
      .lock()
      .map_err(|e| RecordError::TransactionAborted(format!("Lock poisoned: {}", e)))
  }

  /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
  pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
  where
    F: FnOnce(&RecordTx<'_>) -> Result<T, E>,
    E: From<RecordError>,
  {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(RecordError::from)?;

    match f(&RecordTx { tx: &*tx }) {
      Ok(value) => {
        tx.commit().map_err(RecordError::from)?;
        Ok(value)
      }
      Err(err) => {
        // Dropping also rolls back; an explicit rollback surfaces nothing new.
        let _ = tx.rollback();
        Err(err)
      }
    }
  }

  pub fn find_group(&self, key: &str) -> Result<Option<GroupHandle>, RecordError> {
    self.transaction(|tx| tx.find_group(key))
  }

  pub fn group_record(&self, key: &str) -> Result<Option<GroupRecord>, RecordError> {
    self.transaction(|tx| tx.group_record(key))
  }

  pub fn find_item(&self, id: impl Into<ItemId>) -> Result<Option<ItemHandle>, RecordError> {
    let id = id.into();
    self.transaction(|tx| tx.find_item(&id))
  }

  pub fn item_record(&self, id: impl Into<ItemId>) -> Result<Option<ItemRecord>, RecordError> {
    let id = id.into();
    self.transaction(|tx| tx.item_record(&id))
  }

  pub fn variants_of(&self, key: &str) -> Result<Vec<ItemHandle>, RecordError> {
    self.transaction(|tx| tx.variants_of(key))
  }

  /// Storage keys of every item linked to the group, or empty if the group is
  /// unknown.
  pub fn group_item_keys(&self, group_key: &str) -> Result<Vec<String>, RecordError> {
    self.transaction(|tx| match tx.find_group(group_key)? {
      Some(group) => Ok(
        tx.group_items(&group)?
          .into_iter()
          .map(|item| item.storage_key())
          .collect(),
      ),
      None => Ok(Vec::new()),
    })
  }

  pub fn stats(&self) -> Result<RecordStats, RecordError> {
    self.transaction(|tx| tx.stats())
  }

  /// Lazily walk items with no group memberships, starting after `cursor`.
  pub fn items_orphaned_since(&self, cursor: OrphanCursor) -> OrphanSweep<'_> {
    OrphanSweep {
      store: self,
      cursor,
      page: VecDeque::new(),
      exhausted: false,
    }
  }
}

/// Record operations available inside a transaction.
pub struct RecordTx<'a> {
  tx: &'a Connection,
}

impl RecordTx<'_> {
  pub fn find_group(&self, key: &str) -> Result<Option<GroupHandle>, RecordError> {
    let id = self
      .tx
      .query_row(
        "SELECT id FROM cache_groups WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    Ok(id.map(|id| GroupHandle {
      id,
      key: key.to_string(),
    }))
  }

  pub fn group_record(&self, key: &str) -> Result<Option<GroupRecord>, RecordError> {
    let row: Option<(i64, Option<String>, String)> = self
      .tx
      .query_row(
        "SELECT id, root_item, created_at FROM cache_groups WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((id, root_item, created_at)) => Ok(Some(GroupRecord {
        handle: GroupHandle {
          id,
          key: key.to_string(),
        },
        root_item,
        created_at: parse_datetime(&created_at)?,
      })),
      None => Ok(None),
    }
  }

  /// Create the group if absent. Idempotent.
  pub fn upsert_group(&self, key: &str) -> Result<GroupHandle, RecordError> {
    self.tx.execute(
      "INSERT OR IGNORE INTO cache_groups (key) VALUES (?)",
      params![key],
    )?;

    self.find_group(key)?.ok_or_else(|| RecordError::NotFound {
      key: key.to_string(),
    })
  }

  pub fn set_root_item(&self, group: &GroupHandle, item_key: &str) -> Result<(), RecordError> {
    self.tx.execute(
      "UPDATE cache_groups SET root_item = ? WHERE id = ?",
      params![item_key, group.id],
    )?;
    Ok(())
  }

  pub fn find_item(&self, id: impl Into<ItemId>) -> Result<Option<ItemHandle>, RecordError> {
    let id = id.into();
    let row_id = self
      .tx
      .query_row(
        "SELECT id FROM cache_items WHERE key = ? AND variant = ?",
        params![id.key, variant_column(id.variant)],
        |row| row.get(0),
      )
      .optional()?;

    Ok(row_id.map(|row_id| ItemHandle {
      id: row_id,
      key: id.key,
      variant: id.variant,
    }))
  }

  /// Every stored variant of `key`, narrowest first. The plain item is not
  /// included.
  pub fn variants_of(&self, key: &str) -> Result<Vec<ItemHandle>, RecordError> {
    let mut stmt = self.tx.prepare(
      "SELECT id, key, variant FROM cache_items
       WHERE key = ? AND variant > 0
       ORDER BY variant",
    )?;

    let items = stmt
      .query_map(params![key], ItemHandle::from_row)?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(items)
  }

  pub fn item_record(&self, id: impl Into<ItemId>) -> Result<Option<ItemRecord>, RecordError> {
    let id = id.into();
    type Row = (
      i64,
      Option<String>,
      Option<String>,
      Option<String>,
      Option<i64>,
      Option<String>,
    );

    let row: Option<Row> = self
      .tx
      .query_row(
        "SELECT id, url, mime_type, etag, size, cached_at FROM cache_items
         WHERE key = ? AND variant = ?",
        params![id.key, variant_column(id.variant)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()?;

    let Some((row_id, url, mime_type, etag, size, cached_at)) = row else {
      return Ok(None);
    };

    let handle = ItemHandle {
      id: row_id,
      key: id.key,
      variant: id.variant,
    };
    let reference_count = self.reference_count(&handle)?;

    Ok(Some(ItemRecord {
      handle,
      url,
      mime_type,
      etag,
      size: size.map(|s| s as u64),
      cached_at: cached_at.as_deref().map(parse_datetime).transpose()?,
      reference_count,
    }))
  }

  /// Create the item if absent. Idempotent.
  pub fn upsert_item(&self, id: impl Into<ItemId>) -> Result<ItemHandle, RecordError> {
    let id = id.into();
    self.tx.execute(
      "INSERT OR IGNORE INTO cache_items (key, variant) VALUES (?, ?)",
      params![id.key, variant_column(id.variant)],
    )?;

    let key = id.storage_key();
    self
      .find_item(id)?
      .ok_or(RecordError::NotFound { key })
  }

  /// Record metadata for bytes that were just written for `item`.
  pub fn record_download(&self, item: &ItemHandle, meta: &ItemMeta) -> Result<(), RecordError> {
    self.tx.execute(
      "UPDATE cache_items
       SET url = ?, mime_type = ?, etag = ?, size = ?, cached_at = datetime('now')
       WHERE id = ?",
      params![
        meta.url,
        meta.mime_type,
        meta.etag,
        meta.size as i64,
        item.id
      ],
    )?;
    Ok(())
  }

  /// Add membership. Linking twice is a no-op.
  pub fn link_item_to_group(
    &self,
    item: &ItemHandle,
    group: &GroupHandle,
  ) -> Result<(), RecordError> {
    self.tx.execute(
      "INSERT OR IGNORE INTO cache_group_items (group_id, item_id) VALUES (?, ?)",
      params![group.id, item.id],
    )?;
    Ok(())
  }

  /// Remove membership and return the item's remaining reference count.
  pub fn unlink_item_from_group(
    &self,
    item: &ItemHandle,
    group: &GroupHandle,
  ) -> Result<u64, RecordError> {
    self.tx.execute(
      "DELETE FROM cache_group_items WHERE group_id = ? AND item_id = ?",
      params![group.id, item.id],
    )?;
    self.reference_count(item)
  }

  /// Number of distinct groups linking to `item`.
  pub fn reference_count(&self, item: &ItemHandle) -> Result<u64, RecordError> {
    let count: i64 = self.tx.query_row(
      "SELECT COUNT(*) FROM cache_group_items WHERE item_id = ?",
      params![item.id],
      |row| row.get(0),
    )?;
    Ok(count as u64)
  }

  pub fn group_items(&self, group: &GroupHandle) -> Result<Vec<ItemHandle>, RecordError> {
    let mut stmt = self.tx.prepare(
      "SELECT ci.id, ci.key, ci.variant FROM cache_items ci
       INNER JOIN cache_group_items cgi ON cgi.item_id = ci.id
       WHERE cgi.group_id = ?
       ORDER BY ci.id",
    )?;

    let items = stmt
      .query_map(params![group.id], ItemHandle::from_row)?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(items)
  }

  /// Delete the group and its link rows. Items are left for the caller to
  /// reclaim through the reference manager.
  pub fn delete_group(&self, group: &GroupHandle) -> Result<(), RecordError> {
    self.tx.execute(
      "DELETE FROM cache_group_items WHERE group_id = ?",
      params![group.id],
    )?;
    self
      .tx
      .execute("DELETE FROM cache_groups WHERE id = ?", params![group.id])?;
    Ok(())
  }

  pub fn delete_item(&self, item: &ItemHandle) -> Result<(), RecordError> {
    self.tx.execute(
      "DELETE FROM cache_group_items WHERE item_id = ?",
      params![item.id],
    )?;
    self
      .tx
      .execute("DELETE FROM cache_items WHERE id = ?", params![item.id])?;
    Ok(())
  }

  /// Items without memberships whose id is greater than `cursor`.
  pub fn orphans_after(
    &self,
    cursor: OrphanCursor,
    limit: usize,
  ) -> Result<Vec<ItemHandle>, RecordError> {
    let mut stmt = self.tx.prepare(
      "SELECT id, key, variant FROM cache_items ci
       WHERE ci.id > ?
         AND NOT EXISTS (SELECT 1 FROM cache_group_items cgi WHERE cgi.item_id = ci.id)
       ORDER BY ci.id
       LIMIT ?",
    )?;

    let items = stmt
      .query_map(params![cursor.0, limit as i64], ItemHandle::from_row)?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(items)
  }

  /// Groups that have no members left.
  pub fn empty_groups(&self) -> Result<Vec<GroupHandle>, RecordError> {
    let mut stmt = self.tx.prepare(
      "SELECT id, key FROM cache_groups cg
       WHERE NOT EXISTS (SELECT 1 FROM cache_group_items cgi WHERE cgi.group_id = cg.id)
       ORDER BY cg.id",
    )?;

    let groups = stmt
      .query_map([], |row| {
        Ok(GroupHandle {
          id: row.get(0)?,
          key: row.get(1)?,
        })
      })?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(groups)
  }

  pub fn stats(&self) -> Result<RecordStats, RecordError> {
    let count = |table: &str| -> Result<u64, RecordError> {
      let n: i64 = self
        .tx
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
          row.get(0)
        })?;
      Ok(n as u64)
    };

    Ok(RecordStats {
      groups: count("cache_groups")?,
      items: count("cache_items")?,
      links: count("cache_group_items")?,
    })
  }
}

/// Lazy, restartable iterator over orphaned items.
///
/// Each page is read in its own short transaction, so items can be reclaimed
/// between pages without holding the store lock for the whole sweep.
pub struct OrphanSweep<'a> {
  store: &'a CacheRecordStore,
  cursor: OrphanCursor,
  page: VecDeque<ItemHandle>,
  exhausted: bool,
}

impl OrphanSweep<'_> {
  /// Cursor to resume from: everything up to it has been yielded.
  pub fn cursor(&self) -> OrphanCursor {
    self.cursor
  }
}

impl Iterator for OrphanSweep<'_> {
  type Item = Result<ItemHandle, RecordError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.page.is_empty() && !self.exhausted {
      let cursor = self.cursor;
      match self
        .store
        .transaction(|tx| tx.orphans_after(cursor, ORPHAN_PAGE_SIZE))
      {
        Ok(page) => {
          self.exhausted = page.len() < ORPHAN_PAGE_SIZE;
          self.page.extend(page);
        }
        Err(e) => {
          self.exhausted = true;
          return Some(Err(e));
        }
      }
    }

    let item = self.page.pop_front()?;
    self.cursor = OrphanCursor(item.id);
    Some(Ok(item))
  }
}

fn variant_column(variant: Option<u32>) -> i64 {
  variant.map_or(0, i64::from)
}

fn variant_from_column(value: i64) -> Option<u32> {
  u32::try_from(value).ok().filter(|width| *width > 0)
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RecordError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| {
      RecordError::TransactionAborted(format!("Failed to parse datetime '{}': {}", s, e))
    })
}
