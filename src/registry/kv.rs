//! Hierarchical-KV registry backend (spec §4.1, §6): a nested directory
//! `/<key>/[<partition>/]<environment>/<instance_id>` with native per-entry
//! TTL and a recursive long-poll for change detection.
//!
//! The HTTP transport itself (`reqwest`) is the excluded "low-level HTTP
//! adapter" external collaborator (spec §1) — this module only encodes the
//! KV wire contract described in §6 on top of it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{ChangeOutcome, RegistryAdapter};
use crate::error::Transient;

/// One entry as returned by a directory listing.
#[derive(Debug, Deserialize)]
struct KvEntry {
    /// Final path segment — the instance id.
    key: String,
    /// Decimal worker count, stored as the value's string form.
    value: String,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    changed: bool,
}

pub struct KvRegistry {
    client: reqwest::Client,
    base_url: String,
    key: String,
    environment: String,
    partition: Option<String>,
}

impl KvRegistry {
    pub fn new(
        base_url: String,
        key: String,
        environment: String,
        partition: Option<String>,
    ) -> Result<Self, Transient> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Transient::msg(format!("building HTTP client: {e}")))?;
        Ok(KvRegistry {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
            environment,
            partition,
        })
    }

    /// `/<key>/[<partition>/]<environment>` — the directory this member's
    /// entry lives under.
    fn directory(&self) -> String {
        match &self.partition {
            Some(p) => format!("{}/{}/{}/{}", self.base_url, self.key, p, self.environment),
            None => format!("{}/{}/{}", self.base_url, self.key, self.environment),
        }
    }

    fn entry_url(&self, instance_id: &str) -> String {
        format!("{}/{}", self.directory(), instance_id)
    }
}

#[async_trait]
impl RegistryAdapter for KvRegistry {
    async fn announce(
        &self,
        instance_id: &str,
        workers: u32,
        ttl: Duration,
        require_existing: bool,
    ) -> Result<(), Transient> {
        let url = self.entry_url(instance_id);
        let resp = self
            .client
            .put(&url)
            .query(&[
                ("ttl", ttl.as_secs().to_string()),
                ("prev-exist", require_existing.to_string()),
            ])
            .body(workers.to_string())
            .send()
            .await
            .map_err(|e| Transient::msg(format!("announce {instance_id}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Transient::msg(format!(
                "announce {instance_id}: backend returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn retract(&self, instance_id: &str) -> Result<(), Transient> {
        let url = self.entry_url(instance_id);
        match self.client.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404 => Ok(()),
            Ok(resp) => Err(Transient::msg(format!(
                "retract {instance_id}: backend returned {}",
                resp.status()
            ))),
            Err(e) => Err(Transient::msg(format!("retract {instance_id}: {e}"))),
        }
    }

    async fn snapshot(&self) -> Result<Vec<(String, u32)>, Transient> {
        let url = self.directory();
        let resp = self
            .client
            .get(&url)
            .query(&[("recurse", "true")])
            .send()
            .await
            .map_err(|e| Transient::msg(format!("snapshot: {e}")))?;

        if !resp.status().is_success() {
            return Err(Transient::msg(format!(
                "snapshot: backend returned {}",
                resp.status()
            )));
        }

        let entries: Vec<KvEntry> = resp
            .json()
            .await
            .map_err(|e| Transient::msg(format!("snapshot: decoding response: {e}")))?;

        let mut pairs: Vec<(String, u32)> = Vec::with_capacity(entries.len());
        for entry in entries {
            let workers: u32 = entry.value.trim().parse().map_err(|_| {
                Transient::msg(format!(
                    "snapshot: non-numeric worker count {:?} for {}",
                    entry.value, entry.key
                ))
            })?;
            pairs.push((entry.key, workers));
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(pairs)
    }

    async fn await_change(&self, since: DateTime<Utc>) -> Result<ChangeOutcome, Transient> {
        let url = self.directory();
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("wait", "true"),
                ("recurse", "true"),
                ("since", &since.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|e| Transient::msg(format!("await_change: {e}")))?;

        if resp.status().as_u16() == 504 {
            return Ok(ChangeOutcome::TimedOut);
        }
        if !resp.status().is_success() {
            return Err(Transient::msg(format!(
                "await_change: backend returned {}",
                resp.status()
            )));
        }

        let body: WatchResponse = resp
            .json()
            .await
            .map_err(|e| Transient::msg(format!("await_change: decoding response: {e}")))?;
        Ok(if body.changed {
            ChangeOutcome::Changed
        } else {
            ChangeOutcome::TimedOut
        })
    }
}
