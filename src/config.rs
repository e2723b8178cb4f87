use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tuning knobs for a [World](crate::World).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcsConfig {
    /// Target size in bytes of a single archetype chunk.
    pub chunk_byte_budget: usize,
    pub min_chunk_capacity: u16,
    pub max_chunk_capacity: u16,
    /// Freed entity indices are only recycled once more than this many are waiting.
    pub min_free_indices: usize,
    /// Number of workers for quantized parallel queries. `None` uses
    /// [std::thread::available_parallelism].
    pub worker_threads: Option<usize>,
    /// Row count below which a parallel query runs inline.
    pub min_parallel_rows: usize,
    /// Upper bound on how often a tick re-drains the deferred queue when callbacks keep
    /// enqueuing work.
    pub max_flush_iterations: usize,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            chunk_byte_budget: 16 * 1024,
            min_chunk_capacity: 16,
            max_chunk_capacity: 4096,
            min_free_indices: 1024,
            worker_threads: None,
            min_parallel_rows: 128,
            max_flush_iterations: 8,
        }
    }
}

impl EcsConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_chunk_capacity == 0 {
            return Err(ConfigError::Invalid("min_chunk_capacity must be non-zero".into()));
        }
        if self.min_chunk_capacity > self.max_chunk_capacity {
            return Err(ConfigError::Invalid(format!(
                "min_chunk_capacity ({}) exceeds max_chunk_capacity ({})",
                self.min_chunk_capacity, self.max_chunk_capacity
            )));
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::Invalid("worker_threads must be non-zero".into()));
        }
        Ok(())
    }

    /// Chunk capacity for an archetype with the given row stride. Never zero, even for a config
    /// that fails [EcsConfig::validate].
    pub fn chunk_capacity(&self, row_stride: usize) -> u16 {
        let min = self.min_chunk_capacity.max(1);
        let max = self.max_chunk_capacity.max(min);
        let capacity = self.chunk_byte_budget / row_stride.max(1);
        capacity.clamp(min as usize, max as usize) as u16
    }
}
