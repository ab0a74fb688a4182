//! Object directory scanner
//!
//! Walks one object directory and yields a `(tag-name, path)` item for
//! every regular file whose basename starts with `#`. Nested
//! directories become dotted namespace segments. Symbolic links are
//! ignored entirely, whether they point at files or directories.

use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One discovered tag file.
#[derive(Debug, Clone)]
pub struct TagFile {
    pub tag: String,
    pub path: PathBuf,
}

/// Enumerate the tag files of one object. A root that is not a
/// directory is an `ObjectNotFound` error for that object only.
pub fn scan_object(root: &Path) -> Result<Vec<TagFile>> {
    if !root.is_dir() {
        return Err(EngineError::ObjectNotFound(root.display().to_string()));
    }

    let mut found = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // An unreadable subtree costs those tags, nothing more
                debug!(object = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        let Some(leaf) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.strip_prefix('#'))
        else {
            continue;
        };
        if leaf.is_empty() {
            continue;
        }

        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let mut name = String::new();
        if let Some(parent) = rel.parent() {
            for segment in parent.components() {
                name.push_str(&segment.as_os_str().to_string_lossy());
                name.push('.');
            }
        }
        name.push_str(leaf);

        found.push(TagFile {
            tag: name,
            path: entry.path().to_path_buf(),
        });
    }
    Ok(found)
}
