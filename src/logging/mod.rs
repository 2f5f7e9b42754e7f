/// Structured logging setup for the inference core.
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging with env-filtered directives, writing to stderr.
pub fn init_logging() {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("smallmind=info".parse().unwrap())
        .add_directive("info".parse().unwrap());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Initialize logging for tests, capturing output through the test harness.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_test_logging_does_not_panic() {
        init_test_logging();
        tracing::info!("logging initialized");
    }
}
