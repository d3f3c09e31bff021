//! Hierarchical configuration keys.
//!
//! A key is a slash-delimited absolute path such as
//! `/apps/eog/view/interpolate`. The same type names directories.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ConfError, ConfResult};

/// Characters that may not appear in key or directory names.
const INVALID_CHARS: &str = " \t\r\n\"$&<>,+=#!()'|{}[]?~`;%\\";

/// A validated, normalized configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// The root directory `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Validate a key.
    pub fn parse(raw: &str) -> ConfResult<Self> {
        validate(raw)?;
        Ok(Self(raw.to_string()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the root directory.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The last path segment, empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// The containing directory, `None` for the root.
    pub fn parent(&self) -> Option<Key> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Key::root()),
            Some(idx) => Some(Key(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Append a relative name (which may itself contain slashes).
    pub fn join(&self, name: &str) -> ConfResult<Key> {
        let name = name.trim_start_matches('/');
        if self.is_root() {
            Key::parse(&format!("/{}", name))
        } else {
            Key::parse(&format!("{}/{}", self.0, name))
        }
    }

    /// Whether `self` is `other` or one of its ancestors, by whole segments.
    ///
    /// `/apps/eog` covers `/apps/eog/view/zoom` but not `/apps/eogx`.
    pub fn is_prefix_of(&self, other: &Key) -> bool {
        if self.is_root() {
            return true;
        }
        match other.0.strip_prefix(self.0.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }

    /// Every ancestor directory from the root down, excluding `self`.
    pub fn ancestors(&self) -> Vec<Key> {
        let mut out = Vec::new();
        let mut cur = self.parent();
        while let Some(k) = cur {
            cur = k.parent();
            out.push(k);
        }
        out.reverse();
        out
    }
}

fn validate(raw: &str) -> ConfResult<()> {
    if !raw.starts_with('/') {
        return Err(ConfError::bad_key(raw, "must begin with a slash (/)"));
    }
    if raw == "/" {
        return Ok(());
    }
    if raw.ends_with('/') {
        return Err(ConfError::bad_key(raw, "may not end with a slash (/)"));
    }

    let mut just_saw_slash = false;
    for c in raw.chars() {
        if just_saw_slash && c == '/' {
            return Err(ConfError::bad_key(raw, "can't have two slashes (/) in a row"));
        }
        if just_saw_slash && c == '.' {
            return Err(ConfError::bad_key(
                raw,
                "can't have a period (.) right after a slash (/)",
            ));
        }
        if c == '/' {
            just_saw_slash = true;
            continue;
        }
        just_saw_slash = false;
        if !c.is_ascii() {
            return Err(ConfError::bad_key(
                raw,
                format!("'{}' is not an ASCII character", c),
            ));
        }
        if INVALID_CHARS.contains(c) {
            return Err(ConfError::bad_key(
                raw,
                format!("'{}' is an invalid character in key/directory names", c),
            ));
        }
    }
    Ok(())
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Key {
    type Err = ConfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::parse(s)
    }
}

impl TryFrom<String> for Key {
    type Error = ConfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value))
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    #[test]
    fn accepts_well_formed_keys() {
        for raw in ["/", "/apps", "/apps/eog/view/interpolate", "/a_b/c-d/e.f"] {
            assert!(Key::parse(raw).is_ok(), "{} should be valid", raw);
        }
    }

    #[test]
    fn rejects_malformed_keys() {
        for raw in [
            "",
            "apps/eog",
            "/apps/",
            "/apps//eog",
            "/apps/.hidden",
            "/apps/e og",
            "/apps/caf\u{e9}",
            "/apps/a;b",
            "/apps/\"q\"",
        ] {
            let err = Key::parse(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadKey, "{:?} should be rejected", raw);
        }
    }

    #[test]
    fn prefix_matching_is_segment_exact() {
        let loc = key("/apps/eog");
        assert!(loc.is_prefix_of(&key("/apps/eog")));
        assert!(loc.is_prefix_of(&key("/apps/eog/view/zoom")));
        assert!(!loc.is_prefix_of(&key("/apps/eogx")));
        assert!(!loc.is_prefix_of(&key("/apps")));
        assert!(Key::root().is_prefix_of(&key("/anything/at/all")));
    }

    #[test]
    fn parent_and_name() {
        let k = key("/apps/eog/view");
        assert_eq!(k.name(), "view");
        assert_eq!(k.parent(), Some(key("/apps/eog")));
        assert_eq!(key("/apps").parent(), Some(Key::root()));
        assert_eq!(Key::root().parent(), None);
        assert_eq!(Key::root().name(), "");
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(Key::root().join("apps").unwrap(), key("/apps"));
        assert_eq!(key("/apps").join("eog/view").unwrap(), key("/apps/eog/view"));
        assert!(key("/apps").join("bad name").is_err());
    }

    #[test]
    fn ancestors_from_root_down() {
        assert_eq!(
            key("/a/b/c").ancestors(),
            vec![Key::root(), key("/a"), key("/a/b")]
        );
        assert!(Key::root().ancestors().is_empty());
    }

    #[test]
    fn serde_validates() {
        let k: Key = serde_json::from_str("\"/apps/x\"").unwrap();
        assert_eq!(k, key("/apps/x"));
        assert!(serde_json::from_str::<Key>("\"apps/x\"").is_err());
    }
}
