//! Engine configuration

use std::time::Duration;

/// Tunables for plan building and pipeline execution.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Item channel capacity; caps in-flight documents per stage.
    pub pipeline_cap: usize,
    /// Copies created by a Parallel fan-out.
    pub parallelism: usize,
    /// Batch size for datastore fetch and DML sends.
    pub batch_size: usize,
    /// Default per-query deadline.
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline_cap: 16,
            parallelism: 4,
            batch_size: 64,
            timeout: Duration::from_secs(75),
        }
    }
}

impl EngineConfig {
    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n.max(1);
        self
    }

    pub fn with_pipeline_cap(mut self, cap: usize) -> Self {
        self.pipeline_cap = cap.clamp(1, 64);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.pipeline_cap, 16);
        assert_eq!(c.parallelism, 4);
    }

    #[test]
    fn test_pipeline_cap_clamped() {
        assert_eq!(EngineConfig::default().with_pipeline_cap(0).pipeline_cap, 1);
        assert_eq!(
            EngineConfig::default().with_pipeline_cap(1000).pipeline_cap,
            64
        );
    }

    #[test]
    fn test_parallelism_floor() {
        assert_eq!(EngineConfig::default().with_parallelism(0).parallelism, 1);
    }
}
