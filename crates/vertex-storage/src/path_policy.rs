//! Storage key validation and normalization.
//!
//! Every raw key coming from a caller goes through [`PathPolicy`] before any
//! provider sees it. A normalized [`StorageKey`] is relative, uses `/` as the
//! only separator, has no empty, `.` or `..` segments and no NUL or control
//! bytes, so joining it onto any backend root cannot escape that root.

use crate::traits::{StorageError, StorageResult};
use serde::Serialize;
use std::fmt;

/// Default upper bound on a normalized key, in bytes.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 1024;

/// A validated, backend-agnostic relative path such as `VertexAR/ProjectX/ORD-001/photo.jpg`.
///
/// The empty key is the root and is only produced by [`PathPolicy::normalize_prefix`]
/// or [`StorageKey::root`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// The root of a backend
    pub fn root() -> Self {
        StorageKey(String::new())
    }

    /// Wrap a key produced by a backend listing under an already-validated root.
    pub(crate) fn from_listing(key: impl Into<String>) -> Self {
        StorageKey(key.into().trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// `self/child`, or whichever side is non-empty
    pub fn join(&self, child: &StorageKey) -> StorageKey {
        match (self.is_root(), child.is_root()) {
            (true, _) => child.clone(),
            (_, true) => self.clone(),
            _ => StorageKey(format!("{}/{}", self.0, child.0)),
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, if any
    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Parent prefix. The root has none; a single-segment key's parent is the root.
    pub fn parent(&self) -> Option<StorageKey> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(StorageKey(self.0[..idx].to_string())),
            None => Some(StorageKey::root()),
        }
    }

    /// Every parent prefix, nearest first, ending with the root.
    ///
    /// `a/b/c.jpg` yields `a/b`, `a`, ``.
    pub fn ancestors(&self) -> Vec<StorageKey> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(key) = current {
            current = key.parent();
            out.push(key);
        }
        out
    }

    /// Percent-encoded form for use in URL paths, segment separators kept.
    pub fn url_path(&self) -> String {
        self.segments()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Remove `prefix` (segment-aligned) from the front of this key.
    pub fn strip_prefix(&self, prefix: &StorageKey) -> Option<StorageKey> {
        if prefix.is_root() {
            return Some(self.clone());
        }
        if self.0 == prefix.0 {
            return Some(StorageKey::root());
        }
        self.0
            .strip_prefix(prefix.0.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| StorageKey(rest.to_string()))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validates raw keys and turns them into [`StorageKey`]s. Pure, no I/O.
#[derive(Debug, Clone, Copy)]
pub struct PathPolicy {
    max_key_length: usize,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_KEY_LENGTH)
    }
}

impl PathPolicy {
    pub fn new(max_key_length: usize) -> Self {
        Self { max_key_length }
    }

    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    /// Normalize a key naming a file. Empty keys are rejected.
    pub fn normalize(&self, raw: &str) -> StorageResult<StorageKey> {
        let key = self.normalize_inner(raw)?;
        if key.is_root() {
            return Err(StorageError::InvalidKey("key is empty".to_string()));
        }
        Ok(key)
    }

    /// Normalize a listing/statistics prefix. The empty prefix is the root.
    pub fn normalize_prefix(&self, raw: &str) -> StorageResult<StorageKey> {
        self.normalize_inner(raw)
    }

    fn normalize_inner(&self, raw: &str) -> StorageResult<StorageKey> {
        if raw.contains('\0') {
            return Err(StorageError::InvalidKey("key contains a NUL byte".to_string()));
        }
        if raw.chars().any(|c| c.is_control()) {
            return Err(StorageError::InvalidKey(
                "key contains control characters".to_string(),
            ));
        }
        if raw.starts_with('/') || raw.starts_with('\\') {
            return Err(StorageError::InvalidKey("key must be relative".to_string()));
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(StorageError::InvalidKey(
                        "key must not contain '..' segments".to_string(),
                    ))
                }
                s => {
                    if segments.is_empty() && is_absolute_prefix(s) {
                        return Err(StorageError::InvalidKey(
                            "key must be relative".to_string(),
                        ));
                    }
                    segments.push(s);
                }
            }
        }

        let normalized = segments.join("/");
        if normalized.len() > self.max_key_length {
            return Err(StorageError::InvalidKey(format!(
                "key exceeds {} bytes",
                self.max_key_length
            )));
        }

        Ok(StorageKey(normalized))
    }
}

/// `C:` drive letters and `disk:` or `file:` schemes are absolute on some
/// backends. Other colons are ordinary name characters.
fn is_absolute_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    let scheme = segment.strip_suffix(':').is_some_and(|name| {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    });
    drive || scheme
}
