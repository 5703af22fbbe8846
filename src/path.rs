//! Path component tokenizing and parent/child splitting.
//!
//! Mirrors `original_source/filesys/directory.c`'s `get_next_part`: leading
//! slashes collapse, an empty path yields no components, and a component
//! longer than [`crate::NAME_MAX`] is an error rather than silently
//! truncated.

use crate::error::{FsError, FsResult};
use crate::NAME_MAX;

/// Splits `path` into its `/`-separated components, collapsing repeated
/// and leading slashes. Returns an error if any component exceeds
/// [`NAME_MAX`] bytes.
pub fn components(path: &str) -> FsResult<Vec<&str>> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        if part.is_empty() {
            continue;
        }
        if part.len() > NAME_MAX {
            return Err(FsError::InvalidArgument);
        }
        parts.push(part);
    }
    Ok(parts)
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Split `path` into its parent directory path and final component.
///
/// `"/a/b/c"` -> `(Some("/a/b"), "c")`; `"c"` -> `(None, "c")` meaning the
/// parent is the caller's current working directory. A trailing-slash-only
/// path such as `"/"` has no final component and is rejected.
pub fn split_parent(path: &str) -> FsResult<(Option<&str>, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    match trimmed.rfind('/') {
        Some(idx) => {
            let parent = &trimmed[..idx];
            let name = &trimmed[idx + 1..];
            if name.is_empty() || name.len() > NAME_MAX {
                return Err(FsError::InvalidArgument);
            }
            Ok((Some(if parent.is_empty() { "/" } else { parent }), name))
        }
        None => {
            if trimmed.len() > NAME_MAX {
                return Err(FsError::InvalidArgument);
            }
            Ok((None, trimmed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_repeated_and_leading_slashes() {
        assert_eq!(components("///foo//bar/").unwrap(), vec!["foo", "bar"]);
        assert_eq!(components("/").unwrap(), Vec::<&str>::new());
    }

    #[test]
    fn rejects_overlong_component() {
        let long = "a".repeat(NAME_MAX + 1);
        assert!(components(&long).is_err());
    }

    #[test]
    fn splits_parent_and_name() {
        assert_eq!(split_parent("/a/b/c").unwrap(), (Some("/a/b"), "c"));
        assert_eq!(split_parent("/c").unwrap(), (Some("/"), "c"));
        assert_eq!(split_parent("c").unwrap(), (None, "c"));
        assert!(split_parent("/").is_err());
    }
}
