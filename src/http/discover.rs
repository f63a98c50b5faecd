//! Sub-resource discovery in HTML documents.
//!
//! Only `src` attributes of media and script tags are considered. Scripts are
//! required for the page to work offline; media is optional.

use std::collections::HashSet;

use url::Url;

use crate::cache::SubResourceRef;

const MEDIA_TAGS: &[&str] = &["img", "source", "audio", "video"];

/// Sub-resources referenced by `html`, resolved against `base`.
///
/// Duplicates and `data:` URLs are dropped. Order follows the document.
pub fn sub_resources(base: &Url, html: &str) -> Vec<SubResourceRef> {
  let lower = html.to_ascii_lowercase();
  let mut seen = HashSet::new();
  let mut refs = Vec::new();

  let mut pos = 0;
  while let Some(offset) = lower[pos..].find('<') {
    let start = pos + offset + 1;
    let end = lower[start..].find('>').map_or(lower.len(), |i| start + i);
    pos = end.min(lower.len());

    let tag = &lower[start..end];
    let name_len = tag
      .find(|c: char| !c.is_ascii_alphanumeric())
      .unwrap_or(tag.len());
    let name = &tag[..name_len];

    let required = match name {
      "script" => true,
      n if MEDIA_TAGS.contains(&n) => false,
      _ => continue,
    };

    let Some(value) = src_attribute(&html[start..end], &tag[name_len..], name_len) else {
      continue;
    };
    let Some(url) = resolve(base, value) else {
      continue;
    };

    if seen.insert(url.clone()) {
      refs.push(SubResourceRef { url, required });
    }
  }
  refs
}

/// Value of the `src` attribute in a tag body.
///
/// `attrs_lower` is the lowercased text after the tag name, which starts
/// `name_len` bytes into `original`.
fn src_attribute<'a>(original: &'a str, attrs_lower: &str, name_len: usize) -> Option<&'a str> {
  let bytes = attrs_lower.as_bytes();
  let mut search = 0;

  while let Some(i) = attrs_lower[search..].find("src") {
    let at = search + i;
    search = at + 3;

    // Reject data-src, srcset and the like.
    let boundary_before = at == 0 || bytes[at - 1].is_ascii_whitespace();
    let rest = attrs_lower[at + 3..].trim_start();
    if !boundary_before || !rest.starts_with('=') {
      continue;
    }

    let value_start = attrs_lower.len() - rest.len() + 1;
    let value = &original[name_len + value_start..];
    let value = value.trim_start();

    return match value.chars().next()? {
      quote @ ('"' | '\'') => {
        let inner = &value[1..];
        Some(inner.find(quote).map_or(inner, |end| &inner[..end]))
      }
      _ => {
        let end = value
          .find(|c: char| c.is_ascii_whitespace())
          .unwrap_or(value.len());
        Some(&value[..end])
      }
    };
  }
  None
}

fn resolve(base: &Url, value: &str) -> Option<String> {
  let value = value.trim();
  if value.is_empty() || value.starts_with("data:") {
    return None;
  }
  let mut url = base.join(value).ok()?;
  if !matches!(url.scheme(), "http" | "https") {
    return None;
  }
  url.set_fragment(None);
  Some(url.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base() -> Url {
    Url::parse("https://en.example.org/wiki/Article").unwrap()
  }

  #[test]
  fn test_discovers_media_and_scripts() {
    let html = r#"
      <html><head><SCRIPT src="/static/app.js"></SCRIPT></head>
      <body>
        <img class="thumb" src='//upload.example.org/a.png' alt="a">
        <video controls><source src=clip.webm type="video/webm"></video>
        <a href="/wiki/Other">link</a>
      </body></html>
    "#;

    let refs = sub_resources(&base(), html);

    assert_eq!(
      refs,
      vec![
        SubResourceRef::required("https://en.example.org/static/app.js"),
        SubResourceRef::optional("https://upload.example.org/a.png"),
        SubResourceRef::optional("https://en.example.org/wiki/clip.webm"),
      ]
    );
  }

  #[test]
  fn test_skips_lookalike_attributes_and_data_urls() {
    let html = r#"
      <img data-src="/lazy.png" srcset="/a.png 2x">
      <img src="data:image/png;base64,AAAA">
      <img src="/b.png#frag"><img src="/b.png">
      <div src="/not-media.png"></div>
    "#;

    let refs = sub_resources(&base(), html);

    assert_eq!(refs, vec![SubResourceRef::optional("https://en.example.org/b.png")]);
  }

  #[test]
  fn test_unterminated_markup_does_not_panic() {
    assert!(sub_resources(&base(), "<img src=\"/x.png").len() <= 1);
    assert!(sub_resources(&base(), "<").is_empty());
    assert!(sub_resources(&base(), "<img src=").is_empty());
  }
}
