//! Sandbox root and the path boundary validator.
//!
//! All checks are lexical: candidate paths are resolved against the root and
//! normalized without touching the filesystem, so validation is a pure function
//! of its inputs.

use std::path::{Component, Path, PathBuf};

use crate::errors::PathError;

/// The single permitted base directory for all filesystem mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoot {
    root: PathBuf,
}

impl SandboxRoot {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PathError> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(PathError::RelativeRoot { root });
        }
        Ok(Self {
            root: normalize(&root),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Final segment of the root, used to detect self-nesting.
    pub fn segment(&self) -> Option<&str> {
        self.root.file_name().and_then(|s| s.to_str())
    }

    /// Resolve a candidate against the root without validating it.
    pub fn resolve(&self, candidate: &Path) -> PathBuf {
        if candidate.is_absolute() {
            normalize(candidate)
        } else {
            normalize(&self.root.join(candidate))
        }
    }

    /// Validate a candidate path and return its resolved absolute form.
    ///
    /// The root itself is valid (it is the working directory of root-level
    /// commands). Anything resolving outside it fails with `OutOfBoundary`;
    /// a path in which the root's final segment appears as an immediate child
    /// of itself fails with `DuplicateRootSegment`.
    pub fn validate(&self, candidate: &Path) -> Result<PathBuf, PathError> {
        let resolved = self.resolve(candidate);

        if !resolved.starts_with(&self.root) {
            return Err(PathError::OutOfBoundary {
                path: resolved,
                root: self.root.clone(),
            });
        }

        if let Some(segment) = self.segment()
            && self.nests_root_segment(&resolved, segment)
        {
            return Err(PathError::DuplicateRootSegment {
                path: resolved,
                segment: segment.to_string(),
            });
        }

        Ok(resolved)
    }

    /// Path relative to the root with `/` separators, if inside it.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let resolved = self.resolve(path);
        let rel = resolved.strip_prefix(&self.root).ok()?;
        Some(
            rel.components()
                .filter_map(|c| match c {
                    Component::Normal(s) => s.to_str(),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    /// Whether the root's segment repeats as an adjacent pair inside the root.
    ///
    /// Ancestors of the root are not inspected: `/home/shop/shop` is a valid
    /// root even though its last two segments match.
    fn nests_root_segment(&self, resolved: &Path, segment: &str) -> bool {
        let Ok(rel) = resolved.strip_prefix(&self.root) else {
            return false;
        };
        let names: Vec<&str> = std::iter::once(segment)
            .chain(rel.components().filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            }))
            .collect();
        names
            .windows(2)
            .any(|pair| pair[0] == segment && pair[1] == segment)
    }
}

/// Lexically normalize a path: drop `.`, fold `..` into its parent.
///
/// `..` never climbs above the filesystem root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_root {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
