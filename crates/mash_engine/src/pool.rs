//! Worker pool and batch pipeline
//!
//! Objects are processed in batches: scan + read every tag for the
//! batch, then dispatch one evaluation job per object round-robin
//! across worker threads, then await the batch before moving on.
//! Workers share the read-only registry and each own their evaluator
//! state; results stream back to a single writer that appends spill
//! records and (optionally) performs per-object writeback. No worker
//! ever changes the process working directory.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::eval::{self, ErrorKind, EvalError};
use crate::reader::{self, ReadRequest};
use crate::report;
use crate::rules::RuleRegistry;
use crate::scanner;
use crate::spill::{ObjectRecord, SpillWriter};
use crate::tags::TagMap;
use crate::writeback;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counters for a whole batch run.
#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub objects: usize,
    pub objects_with_errors: usize,
    pub tags_loaded: usize,
    pub tags_changed: usize,
    pub duration_ms: u64,
}

struct Job {
    path: PathBuf,
    tags: TagMap,
}

/// Evaluate every object against the ruleset, streaming one record per
/// object into the spill file. With `write_results`, changed tags, the
/// `#errors` tag, and the `mash.log` report are also written back to
/// each object directory.
pub fn run_batch(
    registry: &RuleRegistry,
    objects: &[PathBuf],
    config: &EngineConfig,
    write_results: bool,
    spill_path: &Path,
) -> Result<BatchSummary> {
    let start = Instant::now();
    let mut spill = SpillWriter::create(spill_path)?;
    let mut summary = BatchSummary::default();

    let batch_size = config.effective_batch_size();
    info!(
        objects = objects.len(),
        batch_size,
        workers = config.worker_threads,
        io_channels = config.io_channels,
        "Starting batch run"
    );

    for chunk in objects.chunks(batch_size) {
        run_chunk(
            registry,
            chunk,
            config,
            write_results,
            &mut spill,
            &mut summary,
        )?;
    }

    spill.finish()?;
    summary.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        objects = summary.objects,
        with_errors = summary.objects_with_errors,
        tags_loaded = summary.tags_loaded,
        tags_changed = summary.tags_changed,
        duration_ms = summary.duration_ms,
        "Batch complete"
    );
    Ok(summary)
}

fn run_chunk(
    registry: &RuleRegistry,
    chunk: &[PathBuf],
    config: &EngineConfig,
    write_results: bool,
    spill: &mut SpillWriter,
    summary: &mut BatchSummary,
) -> Result<()> {
    // Load phase: scan every object, then read all tag files through
    // the bounded reader.
    let mut tag_maps: Vec<TagMap> = (0..chunk.len()).map(|_| TagMap::new()).collect();
    let mut load_failures: Vec<Option<EvalError>> = vec![None; chunk.len()];
    let mut requests: Vec<ReadRequest> = Vec::new();

    for (index, object) in chunk.iter().enumerate() {
        match scanner::scan_object(object) {
            Ok(files) => {
                requests.extend(files.into_iter().map(|file| ReadRequest {
                    object: index,
                    tag: file.tag,
                    path: file.path,
                }));
            }
            Err(e) => {
                warn!(object = %object.display(), error = %e, "Object load failed");
                load_failures[index] = Some(EvalError {
                    trace_index: 0,
                    rule: String::new(),
                    tag: String::new(),
                    kind: ErrorKind::ObjectNotFound,
                    message: e.to_string(),
                });
            }
        }
    }

    for read in reader::read_tag_values(requests, config.io_channels)? {
        if let Some(value) = read.value {
            tag_maps[read.object].insert(read.tag, value);
            summary.tags_loaded += 1;
        }
    }

    // Evaluation phase: round-robin dispatch, single result consumer.
    let workers = config.worker_threads.min(chunk.len()).max(1);
    let (record_tx, record_rx) = mpsc::channel::<ObjectRecord>();

    std::thread::scope(|scope| -> Result<()> {
        let mut job_senders = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (job_tx, job_rx) = mpsc::channel::<Job>();
            let record_tx = record_tx.clone();
            scope.spawn(move || {
                for job in job_rx {
                    let evaluation =
                        eval::evaluate(registry, &job.path, job.tags, config.step_cap);
                    let record = ObjectRecord::from_evaluation(
                        &job.path.display().to_string(),
                        &evaluation,
                    );
                    if record_tx.send(record).is_err() {
                        break;
                    }
                }
            });
            job_senders.push(job_tx);
        }
        drop(record_tx);

        let mut dispatched = 0usize;
        for (index, object) in chunk.iter().enumerate() {
            summary.objects += 1;
            if let Some(error) = load_failures[index].take() {
                // The object aborts alone; the batch carries on
                let record = ObjectRecord::failed(&object.display().to_string(), error);
                spill.append(&record)?;
                summary.objects_with_errors += 1;
                continue;
            }
            let job = Job {
                path: object.clone(),
                tags: std::mem::take(&mut tag_maps[index]),
            };
            let _ = job_senders[dispatched % workers].send(job);
            dispatched += 1;
        }
        drop(job_senders);

        for record in record_rx {
            summary.tags_changed += record.changed_tags.len();
            if !record.errors.is_empty() {
                summary.objects_with_errors += 1;
            }
            spill.append(&record)?;
            if write_results {
                if let Err(e) = deliver(&record, registry) {
                    warn!(object = %record.object_path, error = %e, "Writeback failed");
                }
            }
            debug!(
                object = %record.object_path,
                changed = record.changed_tags.len(),
                errors = record.errors.len(),
                "Object evaluated"
            );
        }
        Ok(())
    })
}

/// Persist one object's results: changed tags, the `#errors` tag, and
/// the rendered report.
fn deliver(record: &ObjectRecord, registry: &RuleRegistry) -> Result<()> {
    let object_root = Path::new(&record.object_path);
    writeback::write_tags(object_root, &record.changed_tags)?;
    writeback::write_errors(object_root, &record.errors)?;
    writeback::write_report(object_root, &report::render(record, registry))?;
    Ok(())
}
