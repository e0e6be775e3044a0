//! Normalized absolute paths.
//!
//! Every key in the metadata index is an [`FsPath`]: it always starts with
//! `/`, never ends with `/` (except the root itself), and contains no `.`,
//! `..` or empty components. Normalization happens once at the edge so the
//! index can compare paths as plain strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest single path component accepted.
pub const NAME_MAX: usize = 255;

/// Path parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// A component contains a NUL byte.
    #[error("invalid path component in {0:?}")]
    InvalidComponent(String),

    /// A component is longer than [`NAME_MAX`].
    #[error("file name too long in {0:?}")]
    NameTooLong(String),
}

/// A normalized absolute path.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FsPath(String);

impl FsPath {
    /// The root directory, `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and normalize a path.
    ///
    /// Relative paths are taken relative to `/`. `.` is dropped and `..`
    /// pops a component (clamped at the root).
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let mut parts: Vec<&str> = Vec::new();
        for component in raw.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => {
                    if name.contains('\0') {
                        return Err(PathError::InvalidComponent(raw.to_string()));
                    }
                    if name.len() > NAME_MAX {
                        return Err(PathError::NameTooLong(raw.to_string()));
                    }
                    parts.push(name);
                }
            }
        }

        if parts.is_empty() {
            return Ok(Self::root());
        }
        let mut normalized = String::with_capacity(raw.len() + 1);
        for part in parts {
            normalized.push('/');
            normalized.push_str(part);
        }
        Ok(Self(normalized))
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for `/`.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<FsPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// The final component, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Append a single component.
    pub fn join(&self, name: &str) -> Result<FsPath, PathError> {
        if self.is_root() {
            Self::parse(name)
        } else {
            Self::parse(&format!("{}/{}", self.0, name))
        }
    }

    /// Prefix that every strict descendant key starts with.
    pub fn descendant_prefix(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("{}/", self.0)
        }
    }

    /// Returns true if `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &FsPath) -> bool {
        self == other || (!self.is_root() && self.0.starts_with(&other.descendant_prefix()))
    }

    /// Returns true if `self` lies strictly beneath `other`.
    pub fn is_descendant_of(&self, other: &FsPath) -> bool {
        self != other && self.starts_with(other)
    }

    /// Move `self` from under `from` to under `to`.
    ///
    /// Returns `None` when `self` is not `from` or one of its descendants.
    pub fn rebase(&self, from: &FsPath, to: &FsPath) -> Option<FsPath> {
        if self == from {
            return Some(to.clone());
        }
        let rest = self.0.strip_prefix(&from.descendant_prefix())?;
        if to.is_root() {
            Some(Self(format!("/{rest}")))
        } else {
            Some(Self(format!("{}/{}", to.0, rest)))
        }
    }
}

impl TryFrom<String> for FsPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for FsPath {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<FsPath> for String {
    fn from(path: FsPath) -> String {
        path.0
    }
}

impl AsRef<str> for FsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsPath({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(p("/a/b/c.txt").as_str(), "/a/b/c.txt");
        assert_eq!(p("a/b/c.txt").as_str(), "/a/b/c.txt");
        assert_eq!(p("a/./b//c.txt/").as_str(), "/a/b/c.txt");
        assert_eq!(p("a/b/../b/c.txt").as_str(), "/a/b/c.txt");
        assert_eq!(p("/../..").as_str(), "/");
        assert_eq!(p("").as_str(), "/");
    }

    #[test]
    fn test_rejects_bad_components() {
        assert!(matches!(
            FsPath::parse("/a\0b"),
            Err(PathError::InvalidComponent(_))
        ));
        let long = "x".repeat(NAME_MAX + 1);
        assert!(matches!(
            FsPath::parse(&long),
            Err(PathError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(p("/a/b").parent(), Some(p("/a")));
        assert_eq!(p("/a").parent(), Some(FsPath::root()));
        assert_eq!(FsPath::root().parent(), None);
        assert_eq!(p("/a/b").name(), Some("b"));
        assert_eq!(FsPath::root().name(), None);
    }

    #[test]
    fn test_join() {
        assert_eq!(FsPath::root().join("x").unwrap(), p("/x"));
        assert_eq!(p("/a").join("x").unwrap(), p("/a/x"));
    }

    #[test]
    fn test_starts_with_is_component_wise() {
        assert!(p("/a/b").starts_with(&p("/a")));
        assert!(p("/a").starts_with(&p("/a")));
        assert!(!p("/ab").starts_with(&p("/a")));
        assert!(p("/a").starts_with(&FsPath::root()));
        assert!(!p("/a").is_descendant_of(&p("/a")));
    }

    #[test]
    fn test_rebase() {
        let from = p("/old");
        let to = p("/new/place");
        assert_eq!(p("/old").rebase(&from, &to), Some(to.clone()));
        assert_eq!(p("/old/x/y").rebase(&from, &to), Some(p("/new/place/x/y")));
        assert_eq!(p("/older/x").rebase(&from, &to), None);
        assert_eq!(p("/old/x").rebase(&from, &FsPath::root()), Some(p("/x")));
    }

    #[test]
    fn test_serde_normalizes() {
        let back: FsPath = serde_json::from_str("\"a//b/\"").unwrap();
        assert_eq!(back, p("/a/b"));
    }
}
