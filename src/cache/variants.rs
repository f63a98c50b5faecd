//! Choosing between renditions of one image.

use crate::db::{ItemHandle, ItemId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantChoice {
  /// Fetch the requested item, conditionally if it is already on disk
  Fetch,
  /// A wider rendition is on disk; link it instead of downloading
  Reuse(ItemHandle),
}

/// Decide how to satisfy `requested` given the renditions of its key that
/// are on disk.
///
/// The same width is revalidated rather than skipped, so its etag still gets
/// checked. The narrowest wider rendition is reused as is.
pub fn choose(requested: &ItemId, on_disk: &[ItemHandle]) -> VariantChoice {
  let Some(width) = requested.variant else {
    return VariantChoice::Fetch;
  };
  if on_disk.iter().any(|item| item.variant == Some(width)) {
    return VariantChoice::Fetch;
  }

  on_disk
    .iter()
    .filter(|item| item.variant.is_some_and(|w| w > width))
    .min_by_key(|item| item.variant)
    .cloned()
    .map_or(VariantChoice::Fetch, VariantChoice::Reuse)
}

/// Rendition to serve a read of `requested` from: the exact width, else the
/// narrowest wider one, else the widest narrower one.
pub fn best_for_read(requested: &ItemId, on_disk: &[ItemHandle]) -> Option<ItemHandle> {
  let width = requested.variant?;
  if let Some(exact) = on_disk.iter().find(|item| item.variant == Some(width)) {
    return Some(exact.clone());
  }
  match choose(requested, on_disk) {
    VariantChoice::Reuse(wider) => Some(wider),
    VariantChoice::Fetch => on_disk.iter().max_by_key(|item| item.variant).cloned(),
  }
}
