//! Spill file records
//!
//! Each evaluated object becomes one serialized JSONL record appended
//! to the spill file by a single writer, so callers can stream a large
//! batch's results without holding them all in memory.

use crate::error::Result;
use crate::eval::{EvalError, Evaluation, TraceEntry};
use crate::tags::TagMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Serialized result of one object evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub object_path: String,
    pub evaluated_at: DateTime<Utc>,
    pub initial_tags: TagMap,
    pub changed_tags: TagMap,
    pub errors: Vec<EvalError>,
    pub trace_log: Vec<TraceEntry>,
    pub rule_log: BTreeMap<String, Vec<String>>,
    pub property_log: BTreeMap<String, Vec<String>>,
    pub profiling: BTreeMap<String, f64>,
}

impl ObjectRecord {
    pub fn from_evaluation(object_path: &str, evaluation: &Evaluation) -> Self {
        Self {
            object_path: object_path.to_string(),
            evaluated_at: Utc::now(),
            initial_tags: evaluation.initial.clone(),
            changed_tags: evaluation.changed(),
            errors: evaluation.errors.clone(),
            trace_log: evaluation.trace.clone(),
            rule_log: evaluation.rule_log.clone(),
            property_log: evaluation.property_log.clone(),
            profiling: evaluation.profiling.clone(),
        }
    }

    /// Record for an object that could not be loaded at all.
    pub fn failed(object_path: &str, error: EvalError) -> Self {
        Self {
            object_path: object_path.to_string(),
            evaluated_at: Utc::now(),
            initial_tags: TagMap::new(),
            changed_tags: TagMap::new(),
            errors: vec![error],
            trace_log: Vec::new(),
            rule_log: BTreeMap::new(),
            property_log: BTreeMap::new(),
            profiling: BTreeMap::new(),
        }
    }
}

/// Single-writer append stream of object records.
pub struct SpillWriter {
    writer: BufWriter<File>,
}

impl SpillWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    pub fn append(&mut self, record: &ObjectRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Streaming reader over a spill file.
pub struct SpillReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl SpillReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            lines: BufReader::new(File::open(path)?).lines(),
        })
    }
}

impl Iterator for SpillReader {
    type Item = Result<ObjectRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(&line).map_err(Into::into));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::ErrorKind;
    use tempfile::TempDir;

    fn sample(path: &str) -> ObjectRecord {
        ObjectRecord {
            object_path: path.to_string(),
            evaluated_at: Utc::now(),
            initial_tags: [("x".to_string(), "1".to_string())].into(),
            changed_tags: [("y".to_string(), "2".to_string())].into(),
            errors: Vec::new(),
            trace_log: Vec::new(),
            rule_log: BTreeMap::new(),
            property_log: BTreeMap::new(),
            profiling: [("total".to_string(), 0.5)].into(),
        }
    }

    #[test]
    fn write_then_stream_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("results.jsonl");

        let mut writer = SpillWriter::create(&path).unwrap();
        writer.append(&sample("/a")).unwrap();
        writer.append(&sample("/b")).unwrap();
        writer.finish().unwrap();

        let records: Vec<ObjectRecord> = SpillReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].object_path, "/a");
        assert_eq!(records[1].object_path, "/b");
        assert_eq!(records[0].changed_tags.get("y").unwrap(), "2");
    }

    #[test]
    fn failed_record_carries_the_error() {
        let record = ObjectRecord::failed(
            "/missing",
            EvalError {
                trace_index: 0,
                rule: String::new(),
                tag: String::new(),
                kind: ErrorKind::ObjectNotFound,
                message: "object not found: /missing".to_string(),
            },
        );
        assert!(record.initial_tags.is_empty());
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].kind, ErrorKind::ObjectNotFound);
    }
}
