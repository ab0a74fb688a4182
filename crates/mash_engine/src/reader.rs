//! Concurrent tag reader
//!
//! Loads tag values for a batch of objects with a bounded number of
//! concurrent file reads. The dispatcher is a single-threaded
//! cooperative loop (current-thread tokio runtime): it keeps up to
//! `channels_limit` reads in flight and refills from the pending queue
//! only when the outstanding count drops below the hysteresis
//! threshold `floor(limit * 5/6)` or reaches zero.
//!
//! A tag whose file cannot be opened or read is simply absent from the
//! object's context; the reader never surfaces an error for it. The
//! working directory is never changed.

use crate::error::Result;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// Backstop poll interval: re-enter dispatch even if no read completes.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A pending read: which object wants which tag from which file.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub object: usize,
    pub tag: String,
    pub path: PathBuf,
}

/// A finished read. `value` is `None` when the file could not be read.
#[derive(Debug)]
pub struct TagRead {
    pub object: usize,
    pub tag: String,
    pub value: Option<String>,
}

/// Read all requested tag files with at most `channels_limit`
/// concurrent reads. Blocking entry point; the event loop runs on a
/// dedicated current-thread runtime.
pub fn read_tag_values(requests: Vec<ReadRequest>, channels_limit: usize) -> Result<Vec<TagRead>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(dispatch(requests, channels_limit)))
}

async fn dispatch(requests: Vec<ReadRequest>, channels_limit: usize) -> Vec<TagRead> {
    let limit = channels_limit.max(1);
    let threshold = limit * 5 / 6;
    let mut pending: VecDeque<ReadRequest> = requests.into();
    let mut results = Vec::with_capacity(pending.len());
    let mut in_flight = 0usize;
    let mut reads: JoinSet<TagRead> = JoinSet::new();

    loop {
        // Refill step: top up to the channel limit
        while in_flight < limit {
            let Some(request) = pending.pop_front() else {
                break;
            };
            reads.spawn(read_one(request));
            in_flight += 1;
        }
        if in_flight == 0 {
            break;
        }

        // Drain completions until the refill condition holds again
        loop {
            let joined = match tokio::time::timeout(POLL_INTERVAL, reads.join_next()).await {
                Ok(joined) => joined,
                Err(_) => break, // poll backstop: re-enter dispatch
            };
            let Some(joined) = joined else {
                break;
            };
            in_flight -= 1;
            if let Ok(read) = joined {
                results.push(read);
            }
            if in_flight < threshold || in_flight == 0 {
                break;
            }
        }
    }

    results
}

/// Stream one tag file, appending chunks to the value buffer, and strip
/// the trailing newline at EOF.
async fn read_one(request: ReadRequest) -> TagRead {
    let value = match read_file(&request.path).await {
        Ok(raw) => Some(finalize(raw)),
        Err(e) => {
            debug!(tag = %request.tag, path = %request.path.display(), error = %e, "Tag unreadable");
            None
        }
    };
    TagRead {
        object: request.object,
        tag: request.tag,
        value,
    }
}

async fn read_file(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(buffer)
}

fn finalize(raw: Vec<u8>) -> String {
    let mut text = String::from_utf8_lossy(&raw).into_owned();
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}
