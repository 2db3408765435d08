use thiserror::Error;

/// Why a metric could not be computed.
///
/// Returned by the metrics engine instead of a bare `None` so callers and
/// tests can assert on the reason, not just the absence of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MetricError {
    #[error("insufficient data: need {required} samples, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("degenerate input: {0}")]
    DegenerateInput(&'static str),
}

/// Configuration validation failure. Fatal at startup (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}
