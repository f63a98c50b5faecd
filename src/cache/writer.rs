//! Turns a fetch into durable files and records.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{join_all, OptionFuture};
use tracing::{debug, info, warn};

use super::file_store::{FileStore, StagedFile};
use super::keys;
use super::references::GroupReferenceManager;
use super::traits::{FetchBody, FetchRequest, Fetcher, SubResourceRef};
use super::variants::{self, VariantChoice};
use crate::db::{CacheRecordStore, ItemHandle, ItemId, ItemMeta};
use crate::error::{CacheError, FetchError, FileError, RecordError, StoreError};

/// What one `ensure_cached` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOutcome {
  pub group_key: String,
  /// Item key of the group's document
  pub root_item: String,
  /// Storage keys of every item now linked to the group for this fetch,
  /// document first
  pub items: Vec<String>,
  /// Items whose bytes were (re)written
  pub written: Vec<String>,
  /// Items the fetcher reported as not modified
  pub unchanged: Vec<String>,
  /// Requested renditions served by a wider one already on disk
  pub reused: Vec<String>,
  /// Optional sub-resources that could not be fetched
  pub skipped: Vec<String>,
  /// Items the group no longer needs that now have no references at all.
  /// The caller reclaims them.
  pub released: Vec<ItemHandle>,
}

/// Where a resource's bytes come from at commit time.
enum Source {
  Fetched(FetchBody),
  /// Link an existing wider rendition in place of `requested`
  Reused { requested: ItemId },
}

/// A resource waiting to be committed.
struct Resource {
  id: ItemId,
  url: String,
  source: Source,
}

/// What is already on disk for the items a fetch is about to need.
#[derive(Default)]
struct LocalCopies {
  /// Stored etag of items whose record and file both exist
  etags: HashMap<ItemId, Option<String>>,
  /// Wider renditions to link instead of downloading the requested one
  substitutes: HashMap<ItemId, ItemHandle>,
}

/// Fetches a document and its sub-resources, then commits them in one
/// transaction.
///
/// Callers must not run two `ensure_cached` for the same group key at once;
/// the syncer guarantees this.
pub struct ContentWriter<F: Fetcher> {
  fetcher: Arc<F>,
  records: Arc<CacheRecordStore>,
  files: Arc<FileStore>,
  references: GroupReferenceManager,
}

impl<F: Fetcher> ContentWriter<F> {
  pub fn new(fetcher: Arc<F>, records: Arc<CacheRecordStore>, files: Arc<FileStore>) -> Self {
    Self {
      fetcher,
      records,
      files,
      references: GroupReferenceManager,
    }
  }

  /// Make `url` and everything it references available offline under
  /// `group_key`.
  ///
  /// A fetch failure returns before any store is touched. A file or record
  /// failure rolls the whole group back.
  pub async fn ensure_cached(&self, url: &str, group_key: &str) -> Result<CacheOutcome, CacheError> {
    let root = ItemId::new(keys::item_key(url));

    // The document is always fetched unconditionally: its body carries the
    // authoritative sub-resource list.
    let document = self
      .fetcher
      .fetch(FetchRequest::new(url))
      .await
      .map_err(|e| CacheError::fetch(group_key, e))?;

    let refresh = matches!(document.body, FetchBody::Content { .. });
    let refs = dedupe_sub_resources(&root, &document.sub_resources, |url| {
      self.fetcher.item_id(url)
    });

    let mut wanted: Vec<ItemId> = refs.iter().map(|(id, _)| id.clone()).collect();
    wanted.push(root.clone());
    let mut local = self.local_copies(group_key, wanted).await?;

    if matches!(document.body, FetchBody::NotModified) && !local.etags.contains_key(&root) {
      return Err(CacheError::fetch(
        group_key,
        FetchError::permanent(url, "not modified, but no cached copy exists"),
      ));
    }

    let fetches = refs.iter().map(|(id, sub)| {
      let request = (!local.substitutes.contains_key(id)).then(|| {
        let etag = local.etags.get(id).cloned().flatten();
        self.fetcher.fetch(FetchRequest::new(&sub.url).with_etag(etag))
      });
      OptionFuture::from(request)
    });
    let results = join_all(fetches).await;

    let mut resources = vec![Resource {
      id: root.clone(),
      url: url.to_string(),
      source: Source::Fetched(document.body),
    }];
    let mut skipped = Vec::new();

    for ((id, sub), result) in refs.into_iter().zip(results) {
      let Some(result) = result else {
        if let Some(wider) = local.substitutes.remove(&id) {
          debug!(group = group_key, item = %id, using = %wider.item_id(), "Reusing wider rendition");
          resources.push(Resource {
            id: wider.item_id(),
            url: sub.url,
            source: Source::Reused { requested: id },
          });
        }
        continue;
      };

      let result = result.and_then(|fetched| match fetched.body {
        FetchBody::NotModified if !local.etags.contains_key(&id) => Err(FetchError::permanent(
          &sub.url,
          "not modified, but no cached copy exists",
        )),
        body => Ok(body),
      });

      match result {
        Ok(body) => resources.push(Resource {
          id,
          url: sub.url,
          source: Source::Fetched(body),
        }),
        Err(e) if sub.required => return Err(CacheError::fetch(group_key, e)),
        Err(e) => {
          warn!(group = group_key, item = %id, error = %e, "Skipping optional sub-resource");
          skipped.push(id.storage_key());
        }
      }
    }

    let records = Arc::clone(&self.records);
    let files = Arc::clone(&self.files);
    let references = self.references;
    let key = group_key.to_string();

    let mut outcome = tokio::task::spawn_blocking(move || {
      commit(&records, &files, references, &key, &root.key, resources, refresh)
    })
    .await
    .map_err(|_| CacheError::Abandoned {
      key: group_key.to_string(),
    })??;

    outcome.skipped = skipped;
    info!(
      group = group_key,
      items = outcome.items.len(),
      written = outcome.written.len(),
      unchanged = outcome.unchanged.len(),
      reused = outcome.reused.len(),
      skipped = outcome.skipped.len(),
      released = outcome.released.len(),
      "Cached group"
    );
    Ok(outcome)
  }

  /// Etags of the given items that are on disk, plus wider renditions that
  /// can stand in for requested variants.
  async fn local_copies(&self, group_key: &str, ids: Vec<ItemId>) -> Result<LocalCopies, CacheError> {
    let records = Arc::clone(&self.records);
    let files = Arc::clone(&self.files);

    tokio::task::spawn_blocking(move || {
      records.transaction(|tx| -> Result<_, RecordError> {
        let mut local = LocalCopies::default();
        for id in ids {
          if let Some(record) = tx.item_record(&id)? {
            if files.exists(&id.storage_key()) {
              local.etags.insert(id.clone(), record.etag);
              continue;
            }
          }
          if id.variant.is_none() {
            continue;
          }

          let on_disk: Vec<ItemHandle> = tx
            .variants_of(&id.key)?
            .into_iter()
            .filter(|item| files.exists(&item.storage_key()))
            .collect();
          if let VariantChoice::Reuse(wider) = variants::choose(&id, &on_disk) {
            local.substitutes.insert(id, wider);
          }
        }
        Ok(local)
      })
    })
    .await
    .map_err(|_| CacheError::Abandoned {
      key: group_key.to_string(),
    })?
    .map_err(|e| CacheError::record(group_key, e))
  }
}

/// Sub-resources keyed by item identity, without the document itself or
/// repeats. A resource listed more than once is required if any listing
/// requires it.
fn dedupe_sub_resources(
  root: &ItemId,
  refs: &[SubResourceRef],
  item_id: impl Fn(&str) -> ItemId,
) -> Vec<(ItemId, SubResourceRef)> {
  let mut out: Vec<(ItemId, SubResourceRef)> = Vec::new();
  let mut index: HashMap<ItemId, usize> = HashMap::new();

  for sub in refs {
    let id = item_id(&sub.url);
    if &id == root {
      continue;
    }
    match index.get(&id) {
      Some(&i) => out[i].1.required |= sub.required,
      None => {
        index.insert(id.clone(), out.len());
        out.push((id, sub.clone()));
      }
    }
  }
  out
}

/// Bytes staged for an item, renamed into place once every record is written.
struct PendingWrite {
  staged: StagedFile,
  /// The item had a record before this commit
  existed: bool,
}

/// Write files and records for `resources` in one transaction.
///
/// Bytes are staged first and only renamed into place at the end of the
/// transaction, new items before overwrites, so a failure anywhere earlier
/// leaves every existing file untouched.
fn commit(
  records: &CacheRecordStore,
  files: &FileStore,
  references: GroupReferenceManager,
  group_key: &str,
  root_key: &str,
  resources: Vec<Resource>,
  refresh: bool,
) -> Result<CacheOutcome, CacheError> {
  let mut created = Vec::new();
  let mut written = Vec::new();
  let mut unchanged = Vec::new();
  let mut reused = Vec::new();
  // Resource whose on-disk copy disappeared after it was checked
  let mut vanished: Option<String> = None;

  let result = records.transaction(|tx| -> Result<_, StoreError> {
    let mut handles = Vec::with_capacity(resources.len());
    let mut seen = HashSet::new();
    let mut pending = Vec::new();

    for resource in &resources {
      let storage_key = resource.id.storage_key();
      let existed = tx.find_item(&resource.id)?.is_some();
      let item = tx.upsert_item(&resource.id)?;

      match &resource.source {
        Source::Fetched(FetchBody::Content {
          bytes,
          mime_type,
          etag,
        }) => {
          pending.push(PendingWrite {
            staged: files.stage(&storage_key, bytes)?,
            existed,
          });
          tx.record_download(
            &item,
            &ItemMeta {
              url: Some(resource.url.clone()),
              mime_type: mime_type.clone(),
              etag: etag.clone(),
              size: bytes.len() as u64,
            },
          )?;
          written.push(storage_key);
        }
        Source::Fetched(FetchBody::NotModified) | Source::Reused { .. } => {
          // Checked before the fetch; a concurrent reclaim may have run since.
          if !existed || !files.exists(&storage_key) {
            vanished = Some(resource.url.clone());
            return Err(FileError::NotFound { key: storage_key }.into());
          }
          match &resource.source {
            Source::Reused { requested } => reused.push(requested.storage_key()),
            _ => unchanged.push(storage_key),
          }
        }
      }

      if seen.insert(item.id) {
        handles.push(item);
      }
    }

    let group = tx.upsert_group(group_key)?;
    tx.set_root_item(&group, root_key)?;
    for item in &handles {
      tx.link_item_to_group(item, &group)?;
    }

    // A fresh document defines the full resource set; anything else the group
    // still links to is stale.
    let released = if refresh {
      let stale = tx
        .group_items(&group)?
        .into_iter()
        .filter(|item| !seen.contains(&item.id));
      references.detach(tx, &group, stale)?
    } else {
      Vec::new()
    };

    pending.sort_by_key(|write| write.existed);
    for write in pending {
      let key = write.staged.key().to_string();
      write.staged.persist()?;
      if !write.existed {
        created.push(key);
      }
    }

    Ok((handles, released))
  });

  match result {
    Ok((handles, released)) => Ok(CacheOutcome {
      group_key: group_key.to_string(),
      root_item: root_key.to_string(),
      items: handles.iter().map(ItemHandle::storage_key).collect(),
      written,
      unchanged,
      reused,
      skipped: Vec::new(),
      released,
    }),
    Err(e) => {
      // Files for items that never existed have no record after rollback.
      for key in &created {
        if let Err(err) = files.delete(key) {
          warn!(item = %key, error = %err, "Failed to remove file after rollback");
        }
      }
      debug!(group = group_key, removed = created.len(), "Rolled back cache write");

      match vanished {
        // Retrying fetches it unconditionally, since it is no longer local.
        Some(url) => Err(CacheError::fetch(
          group_key,
          FetchError::transient(url, "cached copy was reclaimed before it could be linked"),
        )),
        None => Err(e.into_cache_error(group_key)),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::{ScriptedFetcher, TestCache};
  use crate::cache::Fetched;

  #[tokio::test]
  async fn test_scenario_a_document_and_image() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond(
      "https://x/articleA",
      Fetched::content("<html>A</html>", Some("text/html"))
        .with_sub_resources(vec![SubResourceRef::optional("https://x/img.png")]),
    );
    fetcher.respond("https://x/img.png", Fetched::content("PNG", Some("image/png")));
    let cache = TestCache::new(fetcher);

    let outcome = cache
      .writer()
      .ensure_cached("https://x/articleA", "articleA")
      .await
      .unwrap();

    assert_eq!(outcome.items, vec!["https://x/articleA", "https://x/img.png"]);
    assert_eq!(outcome.written.len(), 2);
    assert!(outcome.released.is_empty());

    let stats = cache.records.stats().unwrap();
    assert_eq!((stats.groups, stats.items, stats.links), (1, 2, 2));
    assert_eq!(cache.files.read("https://x/articleA").unwrap(), b"<html>A</html>");
    assert_eq!(
      cache
        .records
        .group_record("articleA")
        .unwrap()
        .unwrap()
        .root_item
        .as_deref(),
      Some("https://x/articleA")
    );
  }

  #[tokio::test]
  async fn test_ensure_cached_twice_is_idempotent() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond(
      "https://x/a",
      Fetched::content("doc", None).with_sub_resources(vec![SubResourceRef::required("https://x/s.js")]),
    );
    fetcher.respond("https://x/s.js", Fetched::content("js", None));
    let cache = TestCache::new(fetcher);

    cache.writer().ensure_cached("https://x/a", "a").await.unwrap();
    let stats_once = cache.records.stats().unwrap();
    let space_once = cache.files.used_space().unwrap();
    let keys_once = cache.records.group_item_keys("a").unwrap();

    cache.writer().ensure_cached("https://x/a", "a").await.unwrap();

    assert_eq!(cache.records.stats().unwrap(), stats_once);
    assert_eq!(cache.files.used_space().unwrap(), space_once);
    assert_eq!(cache.records.group_item_keys("a").unwrap(), keys_once);
  }

  #[tokio::test]
  async fn test_fetch_failure_touches_nothing() {
    let fetcher = ScriptedFetcher::new();
    fetcher.fail("https://x/a", FetchError::permanent("https://x/a", "gone"));
    let cache = TestCache::new(fetcher);

    let err = cache
      .writer()
      .ensure_cached("https://x/a", "a")
      .await
      .unwrap_err();

    assert!(matches!(err, CacheError::FetchFailed { .. }));
    assert_eq!(cache.records.stats().unwrap(), Default::default());
    assert_eq!(cache.files.used_space().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_write_failure_rolls_back_whole_group() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond(
      "https://x/a",
      Fetched::content("doc", None).with_sub_resources(vec![
        SubResourceRef::required("https://x/1.png"),
        SubResourceRef::required("https://x/2.png"),
        SubResourceRef::required("https://x/3.png"),
      ]),
    );
    fetcher.respond("https://x/1.png", Fetched::content("1", None));
    fetcher.respond("https://x/2.png", Fetched::content("2", None));
    fetcher.respond("https://x/3.png", Fetched::content("3", None));
    let cache = TestCache::new(fetcher);

    // A directory where the third file's shard should be makes its write fail.
    std::fs::create_dir_all(cache.files.location("https://x/3.png")).unwrap();

    let err = cache
      .writer()
      .ensure_cached("https://x/a", "a")
      .await
      .unwrap_err();

    assert!(matches!(err, CacheError::File { .. }));
    assert_eq!(cache.records.stats().unwrap(), Default::default());
    assert!(!cache.files.exists("https://x/a"));
    assert!(!cache.files.exists("https://x/1.png"));
  }

  #[tokio::test]
  async fn test_optional_failure_is_skipped_required_failure_aborts() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond(
      "https://x/a",
      Fetched::content("doc", None)
        .with_sub_resources(vec![SubResourceRef::optional("https://x/missing.png")]),
    );
    fetcher.fail(
      "https://x/missing.png",
      FetchError::permanent("https://x/missing.png", "404"),
    );
    fetcher.respond(
      "https://x/b",
      Fetched::content("doc", None)
        .with_sub_resources(vec![SubResourceRef::required("https://x/missing.js")]),
    );
    fetcher.fail(
      "https://x/missing.js",
      FetchError::permanent("https://x/missing.js", "404"),
    );
    let cache = TestCache::new(fetcher);

    let outcome = cache.writer().ensure_cached("https://x/a", "a").await.unwrap();
    assert_eq!(outcome.skipped, vec!["https://x/missing.png"]);
    assert_eq!(outcome.items, vec!["https://x/a"]);

    let err = cache
      .writer()
      .ensure_cached("https://x/b", "b")
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::FetchFailed { .. }));
    assert!(cache.records.find_group("b").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_not_modified_sub_resource_is_linked_without_rewrite() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond(
      "https://x/a",
      Fetched::content("doc a", None)
        .with_sub_resources(vec![SubResourceRef::optional("https://x/img.png")]),
    );
    fetcher.respond(
      "https://x/b",
      Fetched::content("doc b", None)
        .with_sub_resources(vec![SubResourceRef::optional("https://x/img.png")]),
    );
    fetcher.respond(
      "https://x/img.png",
      Fetched::content("PNG", None).with_etag("\"v1\""),
    );
    fetcher.respond_if_match("https://x/img.png", "\"v1\"");
    let cache = TestCache::new(fetcher.clone());

    cache.writer().ensure_cached("https://x/a", "a").await.unwrap();
    let outcome = cache.writer().ensure_cached("https://x/b", "b").await.unwrap();

    assert_eq!(outcome.unchanged, vec!["https://x/img.png"]);
    assert_eq!(outcome.written, vec!["https://x/b"]);
    assert_eq!(
      fetcher.last_etag("https://x/img.png").as_deref(),
      Some("\"v1\"")
    );
    assert_eq!(
      cache
        .records
        .item_record("https://x/img.png")
        .unwrap()
        .unwrap()
        .reference_count,
      2
    );
  }

  #[tokio::test]
  async fn test_refresh_releases_items_no_longer_referenced() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond_sequence(
      "https://x/a",
      vec![
        Ok(Fetched::content("v1", None)
          .with_sub_resources(vec![SubResourceRef::optional("https://x/old.png")])),
        Ok(Fetched::content("v2", None)
          .with_sub_resources(vec![SubResourceRef::optional("https://x/new.png")])),
      ],
    );
    fetcher.respond("https://x/old.png", Fetched::content("old", None));
    fetcher.respond("https://x/new.png", Fetched::content("new", None));
    let cache = TestCache::new(fetcher);

    cache.writer().ensure_cached("https://x/a", "a").await.unwrap();
    let outcome = cache.writer().ensure_cached("https://x/a", "a").await.unwrap();

    let released: Vec<_> = outcome.released.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(released, vec!["https://x/old.png"]);
    assert_eq!(
      cache.records.group_item_keys("a").unwrap(),
      vec!["https://x/a", "https://x/new.png"]
    );
  }

  #[test]
  fn test_dedupe_sub_resources() {
    let refs = vec![
      SubResourceRef::optional("https://x/a.png#top"),
      SubResourceRef::required("https://x/a.png"),
      SubResourceRef::optional("https://x/doc"),
      SubResourceRef::optional("https://x/b.png"),
    ];

    let deduped = dedupe_sub_resources(&ItemId::new("https://x/doc"), &refs, keys::item_id);
    assert_eq!(deduped.len(), 2);
    assert_eq!(deduped[0].0, ItemId::new("https://x/a.png"));
    assert!(deduped[0].1.required);
    assert!(!deduped[1].1.required);
  }
  #[test]
  fn test_dedupe_keeps_renditions_apart() {
    let refs = vec![
      SubResourceRef::optional("https://x/thumb/Foo.jpg/220px-Foo.jpg"),
      SubResourceRef::optional("https://x/thumb/Foo.jpg/640px-Foo.jpg"),
      SubResourceRef::required("https://x/thumb/Foo.jpg/220px-Foo.jpg?x=1#a"),
    ];

    let deduped = dedupe_sub_resources(&ItemId::new("https://x/doc"), &refs, keys::item_id);
    let ids: Vec<_> = deduped.iter().map(|(id, _)| id.storage_key()).collect();
    assert_eq!(ids, vec!["https://x/Foo.jpg#220px", "https://x/Foo.jpg#640px"]);
    assert!(deduped[0].1.required);
  }

  fn page_with(doc: &str, image: &str) -> Fetched {
    Fetched::content(doc, Some("text/html"))
      .with_sub_resources(vec![SubResourceRef::optional(image)])
  }

  const WIDE: &str = "https://x/thumb/Foo.jpg/640px-Foo.jpg";
  const NARROW: &str = "https://x/thumb/Foo.jpg/220px-Foo.jpg";

  #[tokio::test]
  async fn test_wider_rendition_on_disk_is_linked_instead_of_downloaded() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("https://x/a", page_with("doc a", WIDE));
    fetcher.respond("https://x/b", page_with("doc b", NARROW));
    fetcher.respond(WIDE, Fetched::content("640", Some("image/jpeg")));
    fetcher.respond(NARROW, Fetched::content("220", Some("image/jpeg")));
    let cache = TestCache::new(fetcher.clone());

    cache.writer().ensure_cached("https://x/a", "a").await.unwrap();
    let outcome = cache.writer().ensure_cached("https://x/b", "b").await.unwrap();

    assert_eq!(fetcher.calls(NARROW), 0);
    assert_eq!(outcome.reused, vec!["https://x/Foo.jpg#220px"]);
    assert_eq!(outcome.items, vec!["https://x/b", "https://x/Foo.jpg#640px"]);
    assert_eq!(outcome.written, vec!["https://x/b"]);

    let wide = ItemId::new("https://x/Foo.jpg").with_variant(Some(640));
    let record = cache.records.item_record(&wide).unwrap().unwrap();
    assert_eq!(record.reference_count, 2);
    assert!(cache.records.item_record(keys::item_id(NARROW)).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_narrower_rendition_does_not_stand_in_for_wider() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("https://x/a", page_with("doc a", NARROW));
    fetcher.respond("https://x/b", page_with("doc b", WIDE));
    fetcher.respond(WIDE, Fetched::content("640", Some("image/jpeg")));
    fetcher.respond(NARROW, Fetched::content("220", Some("image/jpeg")));
    let cache = TestCache::new(fetcher.clone());

    cache.writer().ensure_cached("https://x/a", "a").await.unwrap();
    let outcome = cache.writer().ensure_cached("https://x/b", "b").await.unwrap();

    assert_eq!(fetcher.calls(WIDE), 1);
    assert!(outcome.reused.is_empty());
    assert_eq!(cache.records.variants_of("https://x/Foo.jpg").unwrap().len(), 2);
    assert_eq!(cache.files.read("https://x/Foo.jpg#640px").unwrap(), b"640");
    assert_eq!(cache.files.read("https://x/Foo.jpg#220px").unwrap(), b"220");
  }

  #[tokio::test]
  async fn test_failed_commit_keeps_old_bytes_of_shared_item() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("https://x/a", page_with("doc a", "https://x/img.png"));
    fetcher.respond(
      "https://x/b",
      Fetched::content("doc b", None).with_sub_resources(vec![
        SubResourceRef::optional("https://x/img.png"),
        SubResourceRef::required("https://x/new.png"),
      ]),
    );
    fetcher.respond_sequence(
      "https://x/img.png",
      vec![
        Ok(Fetched::content("OLD", None).with_etag("\"v1\"")),
        Ok(Fetched::content("NEW", None).with_etag("\"v2\"")),
      ],
    );
    fetcher.respond("https://x/new.png", Fetched::content("new", None));
    let cache = TestCache::new(fetcher);

    cache.writer().ensure_cached("https://x/a", "a").await.unwrap();
    std::fs::create_dir_all(cache.files.location("https://x/new.png")).unwrap();

    let err = cache
      .writer()
      .ensure_cached("https://x/b", "b")
      .await
      .unwrap_err();

    assert!(matches!(err, CacheError::File { .. }));
    assert_eq!(cache.files.read("https://x/img.png").unwrap(), b"OLD");
    let record = cache.records.item_record("https://x/img.png").unwrap().unwrap();
    assert_eq!(record.etag.as_deref(), Some("\"v1\""));
    assert!(!cache.files.exists("https://x/b"));
    assert!(cache.records.find_group("b").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_copy_reclaimed_before_linking_is_transient() {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("https://x/a", page_with("doc a", "https://x/img.png"));
    fetcher.respond("https://x/b", page_with("doc b", "https://x/img.png"));
    fetcher.respond(
      "https://x/img.png",
      Fetched::content("PNG", None).with_etag("\"v1\""),
    );
    fetcher.respond_if_match("https://x/img.png", "\"v1\"");
    let cache = TestCache::new(fetcher);

    cache.writer().ensure_cached("https://x/a", "a").await.unwrap();
    let resources = vec![
      Resource {
        id: ItemId::new("https://x/b"),
        url: "https://x/b".to_string(),
        source: Source::Fetched(FetchBody::Content {
          bytes: b"doc b".to_vec(),
          mime_type: None,
          etag: None,
        }),
      },
      Resource {
        id: ItemId::new("https://x/img.png"),
        url: "https://x/img.png".to_string(),
        source: Source::Fetched(FetchBody::NotModified),
      },
    ];
    cache.files.delete("https://x/img.png").unwrap();

    let err = commit(
      &cache.records,
      &cache.files,
      GroupReferenceManager,
      "b",
      "https://x/b",
      resources,
      true,
    )
    .unwrap_err();

    assert!(err.is_transient());
    assert!(!cache.files.exists("https://x/b"));
    assert!(cache.records.find_group("b").unwrap().is_none());
  }
}
