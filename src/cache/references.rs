//! Group membership removal.
//!
//! Every path that takes an item away from a group goes through here, so the
//! rule "zero references means reclaimable" has one implementation.

use tracing::debug;

use crate::db::{GroupHandle, ItemHandle, RecordTx};
use crate::error::RecordError;

/// Stateless unlink-then-check-orphan logic over a record transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupReferenceManager;

impl GroupReferenceManager {
  /// Unlink every member of `group_key` and delete the group.
  ///
  /// Returns the items left with no references. An unknown group yields
  /// nothing.
  pub fn remove_group(
    &self,
    tx: &RecordTx<'_>,
    group_key: &str,
  ) -> Result<Vec<ItemHandle>, RecordError> {
    let Some(group) = tx.find_group(group_key)? else {
      return Ok(Vec::new());
    };

    let members = tx.group_items(&group)?;
    let orphans = self.detach(tx, &group, members)?;
    tx.delete_group(&group)?;

    debug!(group = group_key, orphans = orphans.len(), "Removed cache group");
    Ok(orphans)
  }

  /// Unlink `items` from `group`, returning those whose count reached zero.
  pub fn detach(
    &self,
    tx: &RecordTx<'_>,
    group: &GroupHandle,
    items: impl IntoIterator<Item = ItemHandle>,
  ) -> Result<Vec<ItemHandle>, RecordError> {
    let mut orphans = Vec::new();
    for item in items {
      if tx.unlink_item_from_group(&item, group)? == 0 {
        orphans.push(item);
      }
    }
    Ok(orphans)
  }
}
