//! HTTP implementation of [`Fetcher`].

mod discover;

pub use discover::sub_resources;

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::cache::{FetchRequest, Fetched, Fetcher};
use crate::config::HttpConfig;
use crate::error::FetchError;

/// Fetches over HTTP(S) and discovers sub-resources in HTML responses.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(config: &HttpConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(&config.user_agent)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: FetchRequest) -> Result<Fetched, FetchError> {
    let url = Url::parse(&request.url)
      .map_err(|e| FetchError::permanent(&request.url, format!("invalid url: {e}")))?;

    let mut req = self.client.get(url);
    if let Some(etag) = &request.etag {
      if let Ok(value) = HeaderValue::from_str(etag) {
        req = req.header(IF_NONE_MATCH, value);
      }
    }

    let resp = req
      .send()
      .await
      .map_err(|e| transport_error(&request.url, &e))?;
    let status = resp.status();
    debug!(url = %request.url, status = status.as_u16(), "Fetched");

    if status == StatusCode::NOT_MODIFIED {
      return Ok(Fetched::not_modified());
    }
    if !status.is_success() {
      return Err(status_error(&request.url, status));
    }

    let etag = header_value(resp.headers(), ETAG);
    let mime_type = header_value(resp.headers(), CONTENT_TYPE)
      .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase());

    // Redirects change the base that relative references resolve against.
    let base = resp.url().clone();
    let bytes = resp
      .bytes()
      .await
      .map_err(|e| transport_error(&request.url, &e))?
      .to_vec();

    let refs = if is_html(mime_type.as_deref()) {
      sub_resources(&base, &String::from_utf8_lossy(&bytes))
    } else {
      Vec::new()
    };

    let mut fetched = Fetched::content(bytes, mime_type.as_deref()).with_sub_resources(refs);
    if let Some(etag) = etag {
      fetched = fetched.with_etag(etag);
    }
    Ok(fetched)
  }
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> Option<String> {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .map(ToString::to_string)
}

fn is_html(mime_type: Option<&str>) -> bool {
  matches!(mime_type, Some("text/html" | "application/xhtml+xml"))
}

/// Non-success status to fetch error. Throttling, request timeouts and
/// server errors are worth retrying.
fn status_error(url: &str, status: StatusCode) -> FetchError {
  let reason = format!("HTTP {status}");
  if status == StatusCode::REQUEST_TIMEOUT
    || status == StatusCode::TOO_MANY_REQUESTS
    || status.is_server_error()
  {
    FetchError::transient(url, reason)
  } else {
    FetchError::permanent(url, reason)
  }
}

fn transport_error(url: &str, err: &reqwest::Error) -> FetchError {
  if err.is_timeout() || err.is_connect() || err.is_body() {
    FetchError::transient(url, err.to_string())
  } else {
    FetchError::permanent(url, err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_classification() {
    let url = "https://x/a";
    for code in [408, 429, 500, 502, 503] {
      let status = StatusCode::from_u16(code).unwrap();
      assert!(status_error(url, status).is_transient(), "{code}");
    }
    for code in [400, 401, 403, 404, 410] {
      let status = StatusCode::from_u16(code).unwrap();
      assert!(!status_error(url, status).is_transient(), "{code}");
    }
  }

  #[test]
  fn test_html_detection() {
    assert!(is_html(Some("text/html")));
    assert!(is_html(Some("application/xhtml+xml")));
    assert!(!is_html(Some("image/png")));
    assert!(!is_html(None));
  }

  #[tokio::test]
  async fn test_invalid_url_is_permanent() {
    let fetcher = HttpFetcher::new(&HttpConfig::default()).unwrap();
    let err = fetcher
      .fetch(FetchRequest::new("not a url"))
      .await
      .unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(err.url(), "not a url");
  }

  #[tokio::test]
  async fn test_connection_refused_is_transient() {
    let fetcher = HttpFetcher::new(&HttpConfig::default()).unwrap();
    let err = fetcher
      .fetch(FetchRequest::new("http://127.0.0.1:9/"))
      .await
      .unwrap_err();
    assert!(err.is_transient());
  }
}
