//! Engine configuration

pub const DEFAULT_WORKER_THREADS: usize = 16;
pub const DEFAULT_IO_CHANNELS: usize = 256;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_STEP_CAP: usize = 10_000;

/// Resource knobs for a batch run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max worker threads for per-object evaluation (clamped to object count)
    pub worker_threads: usize,
    /// Max concurrent file reads in the tag reader
    pub io_channels: usize,
    /// Max objects loaded into memory at once (clamped up to worker_threads)
    pub batch_size: usize,
    /// Evaluation step cap; exceeding it records a NonConvergence error
    pub step_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            io_channels: DEFAULT_IO_CHANNELS,
            batch_size: DEFAULT_BATCH_SIZE,
            step_cap: DEFAULT_STEP_CAP,
        }
    }
}

impl EngineConfig {
    /// Refill threshold for the tag reader: floor(limit * 5/6).
    /// New reads are dispatched only once the outstanding count drops
    /// below this (or reaches zero).
    pub fn io_refill_threshold(&self) -> usize {
        self.io_channels * 5 / 6
    }

    /// Effective batch size: never smaller than the worker count, so a
    /// full batch can keep every worker busy.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(self.worker_threads).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_knobs() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_threads, 16);
        assert_eq!(config.io_channels, 256);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.io_refill_threshold(), 213);
    }

    #[test]
    fn batch_size_clamps_up_to_workers() {
        let config = EngineConfig {
            worker_threads: 8,
            batch_size: 2,
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_batch_size(), 8);
    }
}
