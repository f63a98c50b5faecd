//! Offline article cache.
//!
//! A document and the resources it needs are fetched together and stored
//! under a group key. Items shared between groups are stored once and only
//! reclaimed when the last group referencing them is removed.

mod file_store;
pub mod keys;
mod references;
mod syncer;
#[cfg(test)]
pub(crate) mod testing;
mod traits;
mod variants;
mod writer;

pub use file_store::FileStore;
pub use references::GroupReferenceManager;
pub use syncer::{
  CacheStats, Completed, Completion, Operation, ReconcileReport, RemovalOutcome, RetryPolicy,
  SyncOutcome, Syncer, SyncerOptions, WorkResult, WorkState, WorkUnit,
};
pub use traits::{FetchBody, FetchRequest, Fetched, Fetcher, SubResourceRef};
pub use variants::VariantChoice;
pub use writer::{CacheOutcome, ContentWriter};
