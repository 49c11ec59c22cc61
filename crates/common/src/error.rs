use thiserror::Error;

/// Canonical quarry error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QuarryError::Planning`]: plan shape/name/type issues discovered while
///   translating the optimizer tree, including wrapped catalog lookup failures
/// - [`QuarryError::InvalidConfig`]: session/catalog contract violations
/// - [`QuarryError::Unsupported`]: well-formed input the builder intentionally
///   rejects (e.g. joins keyed on a constant)
/// - [`QuarryError::Io`]: raw filesystem/network IO failures from std APIs
///
/// Invariant violations (a missing column binding, an impossible join
/// distribution branch) are not errors: they abort the build via panic, since
/// continuing would emit an incorrect distributed plan.
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Fragment translation failures.
    ///
    /// Examples:
    /// - unknown table/partition/tablet during scan range resolution
    /// - malformed distribution requirement from the optimizer
    #[error("planning error: {0}")]
    Planning(String),

    /// Invalid or inconsistent configuration state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for a construct the builder does not translate.
    ///
    /// Examples:
    /// - constant-only join equality conjuncts
    /// - set-operation kinds outside union/except/intersect
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard quarry result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;
