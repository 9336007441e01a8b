//! Document name validation.
//!
//! Names are path-like (`specs/api.md`) and always resolved relative to the
//! mission root. Absolute paths, `..` and empty components are refused so a
//! document can never escape the root.

use crate::error::{CoordinationError, Result};
use std::fmt;
use std::path::{Component, Path, PathBuf};

const MAX_NAME_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentName(String);

impl DocumentName {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.replace('\\', "/");
        let invalid = |reason: &str| CoordinationError::InvalidName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };

        if normalized.is_empty() {
            return Err(invalid("name is empty"));
        }
        if normalized.len() > MAX_NAME_LEN {
            return Err(invalid("name is too long"));
        }
        if normalized.starts_with('/') {
            return Err(invalid("absolute paths are not allowed"));
        }

        let mut parts = Vec::new();
        for component in Path::new(&normalized).components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| invalid("name is not valid UTF-8"))?;
                    parts.push(part);
                }
                Component::CurDir => continue,
                Component::ParentDir => return Err(invalid("'..' components are not allowed")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("absolute paths are not allowed"))
                }
            }
        }
        if parts.is_empty() {
            return Err(invalid("name has no file component"));
        }
        if normalized.ends_with('/') {
            return Err(invalid("name refers to a directory"));
        }
        if normalized.split('/').any(str::is_empty) {
            return Err(invalid("empty path segment"));
        }

        Ok(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Location of the document beneath `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |path, part| path.join(part))
    }

    /// Flat file-safe key, used for lease files. `%` is escaped before `/`
    /// so distinct names never map to the same key.
    pub fn flat_key(&self) -> String {
        self.0.replace('%', "%25").replace('/', "%2F")
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_nested_relative_names() {
        let name = DocumentName::parse("specs/api.md").unwrap();
        assert_eq!(name.as_str(), "specs/api.md");
        assert_eq!(name.flat_key(), "specs%2Fapi.md");

        let dotted = DocumentName::parse("./notes.md").unwrap();
        assert_eq!(dotted.as_str(), "notes.md");
    }

    #[test]
    fn test_normalizes_backslashes() {
        let name = DocumentName::parse("specs\\api.md").unwrap();
        assert_eq!(name.as_str(), "specs/api.md");
    }

    #[test]
    fn test_rejects_escaping_names() {
        for bad in ["", "/etc/passwd", "../secrets.md", "specs/../../x.md", "specs//a.md", "specs/"] {
            let result = DocumentName::parse(bad);
            assert!(
                matches!(result, Err(CoordinationError::InvalidName { .. })),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_flat_keys_are_distinct() {
        let names = ["a/b.md", "a__b.md", "a%2Fb.md", "a%252Fb.md", "a/b/c.md", "a%2Fb/c.md"];
        let keys: std::collections::HashSet<String> = names
            .iter()
            .map(|raw| DocumentName::parse(raw).unwrap().flat_key())
            .collect();
        assert_eq!(keys.len(), names.len());
        assert!(keys.iter().all(|key| !key.contains('/')));
    }

    #[test]
    fn test_resolve_joins_under_root() {
        let name = DocumentName::parse("a/b.md").unwrap();
        let path = name.resolve(Path::new("/tmp/mission"));
        assert_eq!(path, PathBuf::from("/tmp/mission/a/b.md"));
    }
}
