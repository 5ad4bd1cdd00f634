//! Static mode (spec §4.7): no registry at all. The engine trusts
//! caller-supplied `(static_index, static_total)` and fires exactly one
//! rebalance callback during `join`. `await_change` never resolves because
//! the watch loop is never spawned in this mode.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ChangeOutcome, RegistryAdapter};
use crate::error::Transient;

pub struct StaticRegistry;

impl StaticRegistry {
    pub fn new() -> Self {
        StaticRegistry
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryAdapter for StaticRegistry {
    async fn announce(
        &self,
        _instance_id: &str,
        _workers: u32,
        _ttl: Duration,
        _require_existing: bool,
    ) -> Result<(), Transient> {
        Ok(())
    }

    async fn retract(&self, _instance_id: &str) -> Result<(), Transient> {
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<(String, u32)>, Transient> {
        Ok(Vec::new())
    }

    async fn await_change(&self, _since: DateTime<Utc>) -> Result<ChangeOutcome, Transient> {
        std::future::pending().await
    }
}
