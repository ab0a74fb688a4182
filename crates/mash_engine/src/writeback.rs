//! Writeback
//!
//! Persists changed tags to the object directory: the dotted name maps
//! back to nested directories plus a `#<leaf>` file, missing
//! directories are created, an all-whitespace value deletes the tag
//! file, and non-empty values are written atomically (temp file in the
//! target directory, then rename). The per-object error list becomes
//! the root-level `#errors` file, and the rendered report `mash.log`.

use crate::error::Result;
use crate::eval::{format_error_line, EvalError};
use crate::tags::{tag_rel_path, TagMap};
use std::fs;
use std::path::Path;
use tracing::debug;

/// File name of the serialized error list at the object root.
pub const ERRORS_FILE: &str = "#errors";

/// File name of the rendered report at the object root.
pub const REPORT_FILE: &str = "mash.log";

/// Write every changed tag under the object root. Returns how many
/// files were written or deleted.
pub fn write_tags(object_root: &Path, changed: &TagMap) -> Result<usize> {
    let mut touched = 0;
    for (name, value) in changed {
        let path = object_root.join(tag_rel_path(name));
        if value.trim().is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
                touched += 1;
                debug!(tag = %name, "Deleted blank tag");
            }
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, value)?;
        touched += 1;
    }
    Ok(touched)
}

/// Serialize the error list into the `#errors` tag. An empty list
/// deletes the file, same as any all-whitespace tag value.
pub fn write_errors(object_root: &Path, errors: &[EvalError]) -> Result<()> {
    let path = object_root.join(ERRORS_FILE);
    if errors.is_empty() {
        if path.exists() {
            fs::remove_file(&path)?;
        }
        return Ok(());
    }
    let body = errors
        .iter()
        .map(format_error_line)
        .collect::<Vec<_>>()
        .join("\n");
    write_atomic(&path, &body)
}

/// Write the rendered report to `mash.log` at the object root.
pub fn write_report(object_root: &Path, text: &str) -> Result<()> {
    write_atomic(&object_root.join(REPORT_FILE), text)
}

fn write_atomic(path: &Path, value: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    temp.write_all(value.as_bytes())?;
    temp.persist(path).map_err(|e| e.error)?;
    set_tag_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_tag_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_tag_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
