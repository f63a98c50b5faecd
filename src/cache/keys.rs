//! Cache key derivation.
//!
//! Item keys are canonical URL strings. File names are derived from item keys
//! alone, so the record store never needs to remember where a file lives.

use sha2::{Digest, Sha256};
use url::Url;

use crate::db::ItemId;

/// Canonical item key for a resource URL.
///
/// Scheme and host are lowercased and default ports dropped by the URL parser;
/// fragments are removed since they never change the fetched bytes. Strings
/// that do not parse as URLs are used trimmed, as-is.
pub fn item_key(url: &str) -> String {
  let trimmed = url.trim();
  match Url::parse(trimmed) {
    Ok(mut parsed) => {
      parsed.set_fragment(None);
      parsed.to_string()
    }
    Err(_) => trimmed.to_string(),
  }
}

/// Default group key for an article URL when the caller does not pick one.
pub fn group_key_for_url(url: &str) -> String {
  item_key(url)
}

/// Item identity for a sub-resource URL.
///
/// Image renditions named `<width>px-<name>` are stored as a variant of the
/// full-size image they were scaled from, so different widths of one image
/// share a key. In the `/thumb/<path>/<name>/<width>px-<name>` layout the
/// `thumb` segment is dropped as well.
pub fn item_id(url: &str) -> ItemId {
  let key = item_key(url);
  match rendition_of(&key) {
    Some((original, width)) => ItemId::new(original).with_variant(Some(width)),
    None => ItemId::new(key),
  }
}

fn rendition_of(key: &str) -> Option<(String, u32)> {
  let mut url = Url::parse(key).ok()?;
  let segments: Vec<String> = url.path_segments()?.map(String::from).collect();
  let (last, parents) = segments.split_last()?;

  let (width, name) = last.split_once("px-")?;
  if name.is_empty() || width.is_empty() || !width.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  let width: u32 = width.parse().ok().filter(|w| *w > 0)?;

  let thumb = parents.iter().position(|s| s == "thumb");
  let path: Vec<&str> = match thumb {
    Some(at) if parents.last().is_some_and(|p| p == name) => parents
      .iter()
      .enumerate()
      .filter(|(i, _)| *i != at)
      .map(|(_, s)| s.as_str())
      .collect(),
    _ => parents
      .iter()
      .map(String::as_str)
      .chain(std::iter::once(name))
      .collect(),
  };

  url.set_path(&format!("/{}", path.join("/")));
  url.set_query(None);
  Some((url.to_string(), width))
}

/// Stable, fixed-length file name for a storage key.
pub fn file_name(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_item_key_is_canonical() {
    assert_eq!(
      item_key("HTTPS://Example.org:443/wiki/Rust#History"),
      "https://example.org/wiki/Rust"
    );
    assert_eq!(item_key("  https://x/a "), "https://x/a");
  }

  #[test]
  fn test_non_url_keys_pass_through() {
    assert_eq!(item_key(" articleA "), "articleA");
  }

  #[test]
  fn test_thumbnail_urls_are_variants_of_the_original() {
    let id = item_id(
      "https://upload.example.org/wiki/commons/thumb/a/ab/Foo.jpg/220px-Foo.jpg",
    );
    assert_eq!(id.key, "https://upload.example.org/wiki/commons/a/ab/Foo.jpg");
    assert_eq!(id.variant, Some(220));

    let flat = item_id("https://x/img/640px-Bar.png?x=1");
    assert_eq!(flat.key, "https://x/img/Bar.png");
    assert_eq!(flat.variant, Some(640));
  }

  #[test]
  fn test_plain_urls_have_no_variant() {
    for url in [
      "https://x/img.png",
      "https://x/px-Foo.jpg",
      "https://x/0px-Foo.jpg",
      "https://x/12apx-Foo.jpg",
      "https://x/220px-",
      "articleA",
    ] {
      let id = item_id(url);
      assert_eq!(id.variant, None, "{url}");
      assert_eq!(id.key, item_key(url));
    }
  }

  #[test]
  fn test_file_name_is_stable_hex() {
    let name = file_name("https://x/a");
    assert_eq!(name.len(), 64);
    assert_eq!(name, file_name("https://x/a"));
    assert_ne!(name, file_name("https://x/b"));
  }
}
