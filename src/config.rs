/// Process-wide engine configuration.
///
/// Generation-time knobs (`GenerationOptions`, `SamplingConfig`) live in
/// `session` since they are per-call; this module only holds what the matmul
/// kernels need to size their thread pool.
use std::env;

/// Engine-wide configuration, currently just the worker thread count used by
/// `kernels::matmul`'s rayon dispatch.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub num_threads: Option<usize>,
}

impl EngineConfig {
    /// Read `SMALLMIND_NUM_THREADS` from the environment, falling back to the
    /// logical core count when unset or unparsable.
    pub fn from_env() -> Self {
        let num_threads = env::var("SMALLMIND_NUM_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0);
        Self { num_threads }
    }

    /// The thread count to actually use: the configured value, or the
    /// logical core count if unset.
    pub fn resolved_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(num_cpus::get)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_threads_falls_back_to_core_count() {
        let cfg = EngineConfig { num_threads: None };
        assert_eq!(cfg.resolved_threads(), num_cpus::get());
    }

    #[test]
    fn resolved_threads_uses_configured_value() {
        let cfg = EngineConfig {
            num_threads: Some(3),
        };
        assert_eq!(cfg.resolved_threads(), 3);
    }
}
