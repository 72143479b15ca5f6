use thiserror::Error;

/// Errors raised while building a [`GzipHandler`](crate::GzipHandler).
///
/// These are surfaced at construction time; a handler that was built
/// successfully never fails because of its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The explicit compression level is outside `0..=9`.
    #[error("gzip: invalid compression level: {0}")]
    InvalidCompressionLevel(u32),
    /// The minimum content length must be positive.
    #[error("gzip: invalid minimum content length: {0}")]
    InvalidMinContentLength(usize),
}
