//! Logging setup built on the `tracing` crate.
//!
//! Every worker runs inside a `worker` span carrying its rank, so any message
//! emitted mid-training (including failures) is tagged with the rank that
//! produced it.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose configuration for debugging
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            include_target: true,
            ansi_colors: true,
        }
    }
}

/// Initialize global logging with the given configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(config: &LogConfig) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact()
        .finish();

    // A second init (e.g. from tests) keeps the existing subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize logging with default settings
pub fn init_default_logging() {
    init_logging(&LogConfig::default());
}

/// Span entered by every training worker, tagging records with its rank.
pub fn worker_span(rank: usize) -> tracing::Span {
    tracing::info_span!("worker", rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.ansi_colors);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_default_logging();
        init_default_logging();
    }
}
