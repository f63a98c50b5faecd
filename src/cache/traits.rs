//! Core traits and types for the fetch boundary.

use std::future::Future;

use super::keys;
use crate::db::ItemId;
use crate::error::FetchError;

/// A request for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub url: String,
  /// Validator of the copy already on disk. When set, the fetcher may answer
  /// with [`FetchBody::NotModified`].
  pub etag: Option<String>,
}

impl FetchRequest {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      etag: None,
    }
  }

  pub fn with_etag(mut self, etag: Option<String>) -> Self {
    self.etag = etag;
    self
  }
}

/// Payload of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchBody {
  Content {
    bytes: Vec<u8>,
    mime_type: Option<String>,
    etag: Option<String>,
  },
  /// The copy identified by the request's etag is still current.
  NotModified,
}

/// A resource another resource needs in order to render offline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubResourceRef {
  pub url: String,
  /// Required resources fail the whole cache operation when they cannot be
  /// fetched. Optional ones are skipped.
  pub required: bool,
}

impl SubResourceRef {
  pub fn required(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      required: true,
    }
  }

  pub fn optional(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      required: false,
    }
  }
}

/// Typed fetch result: bytes plus the sub-resources they reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
  pub body: FetchBody,
  pub sub_resources: Vec<SubResourceRef>,
}

impl Fetched {
  pub fn content(bytes: impl Into<Vec<u8>>, mime_type: Option<&str>) -> Self {
    Self {
      body: FetchBody::Content {
        bytes: bytes.into(),
        mime_type: mime_type.map(String::from),
        etag: None,
      },
      sub_resources: Vec::new(),
    }
  }

  pub fn not_modified() -> Self {
    Self {
      body: FetchBody::NotModified,
      sub_resources: Vec::new(),
    }
  }

  pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
    if let FetchBody::Content { etag: slot, .. } = &mut self.body {
      *slot = Some(etag.into());
    }
    self
  }

  pub fn with_sub_resources(mut self, refs: Vec<SubResourceRef>) -> Self {
    self.sub_resources = refs;
    self
  }
}

/// Transport collaborator: given a URL, returns content or an error.
///
/// Implementations decide what is transient. The cache core never looks at
/// transport details.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(
    &self,
    request: FetchRequest,
  ) -> impl Future<Output = Result<Fetched, FetchError>> + Send;

  /// Identity a sub-resource is stored under. Renditions of one image share a
  /// key and differ by variant.
  fn item_id(&self, url: &str) -> ItemId {
    keys::item_id(url)
  }
}
