//! Cache key construction and key matching for bulk invalidation.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

use super::traits::QueryKey;

/// Key for a resource plus its filter parameters.
///
/// Parameters are kept sorted by name so the same filter set always renders
/// the same key, whatever order the caller added them in.
///
/// ```ignore
/// let key = CacheKey::new("listings").param("status", "open").param("page", 1);
/// assert_eq!(key.cache_key(), "listings:page=1&status=open");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
  namespace: String,
  params: BTreeMap<String, String>,
}

impl CacheKey {
  pub fn new(namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      params: BTreeMap::new(),
    }
  }

  /// Add a filter parameter. A repeated name replaces the earlier value.
  pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
    self.params.insert(name.into(), value.to_string());
    self
  }

  /// Add a parameter only when a value is present.
  pub fn param_opt<V: fmt::Display>(self, name: impl Into<String>, value: Option<V>) -> Self {
    match value {
      Some(v) => self.param(name, v),
      None => self,
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }
}

impl QueryKey for CacheKey {
  fn cache_key(&self) -> String {
    if self.params.is_empty() {
      return self.namespace.clone();
    }

    let params = self
      .params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");
    format!("{}:{}", self.namespace, params)
  }

  fn description(&self) -> String {
    if self.params.is_empty() {
      format!("all {}", self.namespace)
    } else {
      let params = self
        .params
        .iter()
        .map(|(k, v)| format!("{} {}", k, v))
        .collect::<Vec<_>>()
        .join(", ");
      format!("{} ({})", self.namespace, params)
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.cache_key())
  }
}

/// Namespace of a rendered key: everything before the first `:`.
pub(crate) fn namespace_of(key: &str) -> &str {
  key.split_once(':').map(|(ns, _)| ns).unwrap_or(key)
}

/// Predicate selecting keys for bulk invalidation.
#[derive(Clone, Debug)]
pub enum KeyMatcher {
  /// Key contains the text anywhere
  Substring(String),
  /// Key starts with the text
  Prefix(String),
  /// Key matches the regular expression
  Regex(Regex),
}

impl KeyMatcher {
  pub fn prefix(prefix: impl Into<String>) -> Self {
    Self::Prefix(prefix.into())
  }

  /// Compile a regular expression matcher.
  pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
    Regex::new(pattern).map(Self::Regex)
  }

  pub fn matches(&self, key: &str) -> bool {
    match self {
      Self::Substring(s) => key.contains(s.as_str()),
      Self::Prefix(p) => key.starts_with(p.as_str()),
      Self::Regex(re) => re.is_match(key),
    }
  }
}

impl From<&str> for KeyMatcher {
  fn from(s: &str) -> Self {
    Self::Substring(s.to_string())
  }
}

impl From<String> for KeyMatcher {
  fn from(s: String) -> Self {
    Self::Substring(s)
  }
}

impl From<Regex> for KeyMatcher {
  fn from(re: Regex) -> Self {
    Self::Regex(re)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_params_are_sorted() {
    let a = CacheKey::new("listings")
      .param("status", "open")
      .param("page", 1);
    let b = CacheKey::new("listings")
      .param("page", 1)
      .param("status", "open");
    assert_eq!(a.cache_key(), "listings:page=1&status=open");
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_key_without_params() {
    let key = CacheKey::new("farms").param_opt::<u32>("region", None);
    assert_eq!(key.cache_key(), "farms");
    assert_eq!(key.description(), "all farms");
    assert_eq!(key.to_string(), "farms");
  }

  #[test]
  fn test_namespace_of() {
    assert_eq!(namespace_of("listings:page=1"), "listings");
    assert_eq!(namespace_of("received_42"), "received_42");
  }

  #[test]
  fn test_matchers() {
    let substring = KeyMatcher::from("project=7");
    assert!(substring.matches("listings:project=7&page=1"));
    assert!(!substring.matches("listings:project=8"));

    let prefix = KeyMatcher::prefix("sent_");
    assert!(prefix.matches("sent_42"));
    assert!(!prefix.matches("received_42"));

    let re = KeyMatcher::regex("^received_").unwrap();
    assert!(re.matches("received_7"));
    assert!(!re.matches("not_received_7"));

    assert!(KeyMatcher::regex("(").is_err());
  }
}
