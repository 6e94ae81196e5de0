//! Canonical request signatures.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Canonical identity of a logical request.
///
/// Two requests that differ only in parameter order, redundant slashes or
/// object key order in the body produce the same signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
  pub fn new(method: Method, path: &str, params: &[(&str, &str)], body: Option<&Value>) -> Self {
    let (path, inline_query) = match path.split_once('?') {
      Some((p, q)) => (p, Some(q)),
      None => (path, None),
    };

    let mut pairs: Vec<(String, String)> = params
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    if let Some(query) = inline_query {
      pairs.extend(
        url::form_urlencoded::parse(query.as_bytes()).map(|(k, v)| (k.into_owned(), v.into_owned())),
      );
    }
    pairs.sort();

    let mut canonical = family_prefix(method, path);
    if !pairs.is_empty() {
      // Re-encode so separators inside keys or values cannot alias other pairs
      let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(&pairs)
        .finish();
      canonical.push('?');
      canonical.push_str(&query);
    }
    if let Some(body) = body {
      canonical.push('#');
      canonical.push_str(&body_digest(body));
    }

    Self(canonical)
  }

  /// Signature for a GET without parameters.
  pub fn get(path: &str) -> Self {
    Self::new(Method::Get, path, &[], None)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn starts_with(&self, prefix: &str) -> bool {
    self.0.starts_with(prefix)
  }
}

impl fmt::Display for Signature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Prefix shared by every signature for `method` under `path`.
///
/// Mutations use this with `Method::Get` to name the key family they
/// invalidate.
pub fn family_prefix(method: Method, path: &str) -> String {
  format!("{}:{}", method, normalize_path(path))
}

/// Normalize a request path for consistent signatures.
///
/// Trims whitespace, ensures a leading slash, collapses repeated slashes and
/// drops a trailing slash.
pub fn normalize_path(path: &str) -> String {
  let segments: Vec<&str> = path
    .trim()
    .split('/')
    .filter(|s| !s.is_empty())
    .collect();
  format!("/{}", segments.join("/"))
}

/// Short SHA-256 digest of a JSON body.
fn body_digest(body: &Value) -> String {
  // serde_json maps are key-ordered, so this encoding is canonical
  let encoded = body.to_string();
  let mut hasher = Sha256::new();
  hasher.update(encoded.as_bytes());
  let result = hasher.finalize();
  hex::encode(&result[..8])
}
