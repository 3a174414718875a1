use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Error taxonomy surfaced to callers of the pool engine.
///
/// Individual source or probe failures are swallowed into empty results and
/// invalid outcomes; only aggregate-level failures surface through this type.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The effective pool was empty when a selection was requested.
    #[error("no valid proxies available")]
    NoValidProxies,

    /// Every enabled source returned empty or errored, or the fetch
    /// pipeline could not be brought up at all.
    #[error("proxy fetch: {0}")]
    Fetch(String),

    /// A probe was invoked in a way that can never succeed, e.g. a SOCKS
    /// handshake against an HTTP proxy.
    #[error("invalid validation request: {0}")]
    Validation(String),

    /// The persisted proxy cache could not be read or written.
    #[error("proxy cache: {0}")]
    Cache(String),

    /// A deadline elapsed on a source fetch, probe, or outer call.
    #[error("deadline exceeded")]
    Timeout,

    /// An outer cancellation was observed; partial results were discarded.
    #[error("operation cancelled")]
    Cancelled,
}
