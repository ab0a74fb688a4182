//! Batch CSV export
//!
//! One row per object, built by streaming the spill file twice: pass
//! one collects the union of tag names, pass two emits rows. Values
//! are sanitized per the report contract (commas become `;`, newlines
//! become spaces), which is why this is not the quoting behavior a CSV
//! library would give us.

use crate::error::Result;
use crate::eval::format_error_line;
use crate::spill::SpillReader;
use crate::writeback::ERRORS_FILE;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Export every spill record as a CSV row. Returns the row count.
pub fn export_csv(spill_path: &Path, csv_path: &Path) -> Result<usize> {
    // Pass 1: union of all tag names, sorted
    let mut names: BTreeSet<String> = BTreeSet::new();
    names.insert(ERRORS_FILE.to_string());
    for record in SpillReader::open(spill_path)? {
        let record = record?;
        names.extend(record.initial_tags.keys().cloned());
        names.extend(record.changed_tags.keys().cloned());
    }

    // Pass 2: one row per object
    let mut writer = BufWriter::new(File::create(csv_path)?);
    let header: Vec<&str> = std::iter::once("path")
        .chain(names.iter().map(String::as_str))
        .collect();
    writeln!(writer, "{}", header.join(","))?;

    let mut rows = 0usize;
    for record in SpillReader::open(spill_path)? {
        let record = record?;
        let mut row: Vec<String> = Vec::with_capacity(names.len() + 1);
        row.push(sanitize(&record.object_path));
        for name in &names {
            let value = if name == ERRORS_FILE {
                record
                    .errors
                    .iter()
                    .map(format_error_line)
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                record
                    .changed_tags
                    .get(name)
                    .or_else(|| record.initial_tags.get(name))
                    .cloned()
                    .unwrap_or_default()
            };
            row.push(sanitize(&value));
        }
        writeln!(writer, "{}", row.join(","))?;
        rows += 1;
    }
    writer.flush()?;

    info!(rows, columns = names.len() + 1, csv = %csv_path.display(), "CSV written");
    Ok(rows)
}

fn sanitize(value: &str) -> String {
    value
        .replace(',', ";")
        .replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{ErrorKind, EvalError};
    use crate::spill::{ObjectRecord, SpillWriter};
    use crate::tags::TagMap;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(path: &str, initial: &[(&str, &str)], changed: &[(&str, &str)]) -> ObjectRecord {
        let to_map = |pairs: &[(&str, &str)]| -> TagMap {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        ObjectRecord {
            object_path: path.to_string(),
            evaluated_at: Utc::now(),
            initial_tags: to_map(initial),
            changed_tags: to_map(changed),
            errors: Vec::new(),
            trace_log: Vec::new(),
            rule_log: BTreeMap::new(),
            property_log: BTreeMap::new(),
            profiling: BTreeMap::new(),
        }
    }

    #[test]
    fn union_columns_and_value_precedence() {
        let temp = TempDir::new().unwrap();
        let spill = temp.path().join("spill.jsonl");
        let csv = temp.path().join("out.csv");

        let mut writer = SpillWriter::create(&spill).unwrap();
        writer
            .append(&record("/a", &[("x", "1")], &[("y", "2")]))
            .unwrap();
        writer
            .append(&record("/b", &[("x", "old"), ("z", "3")], &[("x", "new")]))
            .unwrap();
        writer.finish().unwrap();

        let rows = export_csv(&spill, &csv).unwrap();
        assert_eq!(rows, 2);

        let text = std::fs::read_to_string(&csv).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "path,#errors,x,y,z");
        assert_eq!(lines[1], "/a,,1,2,");
        // Changed value wins over the initial one
        assert_eq!(lines[2], "/b,,new,,3");
    }

    #[test]
    fn values_are_sanitized() {
        let temp = TempDir::new().unwrap();
        let spill = temp.path().join("spill.jsonl");
        let csv = temp.path().join("out.csv");

        let mut writer = SpillWriter::create(&spill).unwrap();
        writer
            .append(&record("/a", &[], &[("note", "a,b\nc")]))
            .unwrap();
        writer.finish().unwrap();

        export_csv(&spill, &csv).unwrap();
        let text = std::fs::read_to_string(&csv).unwrap();
        assert!(text.lines().nth(1).unwrap().contains("a;b c"));
    }

    #[test]
    fn errors_column_filled() {
        let temp = TempDir::new().unwrap();
        let spill = temp.path().join("spill.jsonl");
        let csv = temp.path().join("out.csv");

        let mut rec = record("/a", &[], &[]);
        rec.errors.push(EvalError {
            trace_index: 0,
            rule: String::new(),
            tag: String::new(),
            kind: ErrorKind::ObjectNotFound,
            message: "gone".to_string(),
        });
        let mut writer = SpillWriter::create(&spill).unwrap();
        writer.append(&rec).unwrap();
        writer.finish().unwrap();

        export_csv(&spill, &csv).unwrap();
        let text = std::fs::read_to_string(&csv).unwrap();
        assert!(text.lines().nth(1).unwrap().contains("ObjectNotFound: gone"));
    }
}
