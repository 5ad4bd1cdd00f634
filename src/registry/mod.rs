//! The registry adapter abstraction (spec §4.1, §9): a uniform contract the
//! rest of the engine consumes without ever branching on which backend is
//! behind it.

mod kv;
mod sql;
mod static_backend;

pub use kv::KvRegistry;
pub use sql::SqlRegistry;
pub use static_backend::StaticRegistry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RegistryEndpoint;
use crate::error::Transient;

/// Outcome of a single [`RegistryAdapter::await_change`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Changed,
    TimedOut,
}

/// Capability interface every registry backend implements (spec §9: "the
/// engine never branches on backend identity").
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    /// Idempotently assert this member's presence. The *initial* announce
    /// must succeed whether or not the entry already existed; subsequent
    /// heartbeats should require prior existence so an expired entry is
    /// detected as a failure and triggers the heartbeat's retry path.
    async fn announce(
        &self,
        instance_id: &str,
        workers: u32,
        ttl: Duration,
        require_existing: bool,
    ) -> Result<(), Transient>;

    /// Best-effort removal. Failure is the caller's to log, never fatal.
    async fn retract(&self, instance_id: &str) -> Result<(), Transient>;

    /// Entries matching this adapter's (key, environment, partition) scope,
    /// not yet expired, sorted ascending by `instance_id`.
    async fn snapshot(&self) -> Result<Vec<(String, u32)>, Transient>;

    /// Block (or poll) until the registry scope plausibly changed since
    /// `since`.
    async fn await_change(&self, since: DateTime<Utc>) -> Result<ChangeOutcome, Transient>;

    /// Apply any pending schema migration. A no-op for backends that need
    /// none (KV, static).
    async fn maybe_migrate_schema(&self) -> Result<(), Transient> {
        Ok(())
    }
}

/// Build the adapter selected by `endpoint`, scoped to `(key, environment,
/// partition)`.
pub async fn build(
    endpoint: &RegistryEndpoint,
    key: &str,
    environment: &str,
    partition: Option<&str>,
) -> Result<Box<dyn RegistryAdapter>, Transient> {
    match endpoint {
        RegistryEndpoint::Static => Ok(Box::new(StaticRegistry::new())),
        RegistryEndpoint::Kv(uri) => Ok(Box::new(KvRegistry::new(
            uri.clone(),
            key.to_string(),
            environment.to_string(),
            partition.map(str::to_string),
        )?)),
        RegistryEndpoint::Sql(uri) => Ok(Box::new(
            SqlRegistry::connect(uri, key, environment, partition).await?,
        )),
    }
}
