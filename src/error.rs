//! Error types surfaced to callers, and the internal transient-error channel
//! used by the background loops.
//!
//! Only [`ClusterError`] ever crosses the public API boundary. Backends
//! signal retryable conditions (a timed-out HTTP call, a dropped connection)
//! through [`Transient`], which the heartbeat and watch loops log and absorb
//! — it never becomes a `ClusterError` the application sees.

use thiserror::Error;

/// Errors returned by the public API.
///
/// Variant names track the spec's error codes directly: `NotPermitted`,
/// `Invalid`, `AllocFailed`, `BackendUnavailable`.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A state-machine violation, e.g. calling a setter while joined.
    #[error("not permitted: {0}")]
    NotPermitted(&'static str),

    /// A bad argument: invalid key/instance id, unsupported registry scheme, ...
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Resource exhaustion constructing cluster state.
    #[error("allocation failed")]
    AllocFailed,

    /// The registry was unreachable when a synchronous operation required it
    /// (e.g. the initial announce/balance performed during `join`).
    #[error("registry backend unavailable: {0}")]
    BackendUnavailable(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// A retryable backend failure. Never surfaced to the caller; the heartbeat
/// and watch loops catch it, log it, and retry per their own backoff policy.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Transient(#[from] pub anyhow::Error);

impl Transient {
    pub fn msg(text: impl Into<String>) -> Self {
        Transient(anyhow::anyhow!(text.into()))
    }
}
