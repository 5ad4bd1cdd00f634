//! Relational registry backend (spec §4.1, §6): `cluster_node` with explicit
//! `expires` timestamps, emulating the KV backend's TTL/ordering/change
//! contract over a table. Grounded on the teacher crate's
//! `db::workers`/`db::jobs` transaction style (`pool.begin()` ...
//! `execute(&mut *tx)` ... `tx.commit()`), generalized from an
//! upsert-on-heartbeat table to the spec's delete-then-insert discipline so
//! `updated` always advances.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use super::{ChangeOutcome, RegistryAdapter};
use crate::error::Transient;

/// Registry scope a `SqlRegistry` is bound to.
struct Scope {
    key: String,
    environment: String,
    partition: Option<String>,
}

pub struct SqlRegistry {
    pool: PgPool,
    scope: Scope,
}

/// How long `await_change` polls before giving up and reporting a timeout.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Liveness cap: force a balance pass even with no observed row change, so
/// a missed update or silent expiry cannot wedge the watch loop forever.
const FORCED_BALANCE_CAP: Duration = Duration::from_secs(30);

impl SqlRegistry {
    pub async fn connect(
        uri: &str,
        key: &str,
        environment: &str,
        partition: Option<&str>,
    ) -> Result<Self, Transient> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(uri)
            .await
            .map_err(|e| Transient::msg(format!("connecting to SQL registry: {e}")))?;
        let registry = SqlRegistry {
            pool,
            scope: Scope {
                key: key.to_string(),
                environment: environment.to_string(),
                partition: partition.map(str::to_string),
            },
        };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> Result<(), Transient> {
        migrate_pool(&self.pool).await
    }
}

/// DDL steps applied in order, 1-indexed to match the spec's schema-version
/// numbering (1 creates the base table; 2-4 add indexes; 5 adds
/// `partition`; 6-7 add optional key-value side tables; 8 adds the job
/// table).
const MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        "CREATE TABLE cluster_node (
            id VARCHAR(32) NOT NULL,
            key VARCHAR(32) NOT NULL,
            env VARCHAR(32) NOT NULL,
            workers INT NOT NULL,
            updated TIMESTAMP NOT NULL,
            expires TIMESTAMP NOT NULL,
            PRIMARY KEY (id, key, env)
        )",
    ),
    (2, "CREATE INDEX cluster_node_key_env_idx ON cluster_node (key, env)"),
    (3, "CREATE INDEX cluster_node_expires_idx ON cluster_node (expires)"),
    (4, "CREATE INDEX cluster_node_updated_idx ON cluster_node (updated)"),
    (
        5,
        "ALTER TABLE cluster_node ADD COLUMN partition VARCHAR(32);
         CREATE INDEX cluster_node_partition_idx ON cluster_node (partition)",
    ),
    (
        6,
        "CREATE TABLE cluster_app_kv (
            key VARCHAR(32) NOT NULL,
            env VARCHAR(32) NOT NULL,
            name VARCHAR(64) NOT NULL,
            value TEXT,
            PRIMARY KEY (key, env, name)
        )",
    ),
    (
        7,
        "CREATE TABLE cluster_node_kv (
            id VARCHAR(32) NOT NULL,
            key VARCHAR(32) NOT NULL,
            env VARCHAR(32) NOT NULL,
            name VARCHAR(64) NOT NULL,
            value TEXT,
            PRIMARY KEY (id, key, env, name)
        )",
    ),
    (
        8,
        "CREATE TABLE cluster_job (
            id VARCHAR(32) PRIMARY KEY,
            cluster_key VARCHAR(32) NOT NULL,
            parent_id VARCHAR(32),
            name VARCHAR(64),
            tag VARCHAR(64),
            status VARCHAR(16) NOT NULL DEFAULT 'wait',
            progress BIGINT NOT NULL DEFAULT 0,
            total BIGINT NOT NULL DEFAULT 0,
            updated TIMESTAMP NOT NULL DEFAULT NOW()
        )",
    ),
];

async fn migrate_pool(pool: &PgPool) -> Result<(), Transient> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS cluster_schema_migrations (
            id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
            version INT NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| Transient::msg(format!("creating migrations table: {e}")))?;

    sqlx::query("INSERT INTO cluster_schema_migrations (id, version) VALUES (1, 0) ON CONFLICT (id) DO NOTHING")
        .execute(pool)
        .await
        .map_err(|e| Transient::msg(format!("seeding migrations table: {e}")))?;

    let current: i32 = sqlx::query_scalar("SELECT version FROM cluster_schema_migrations WHERE id = 1")
        .fetch_one(pool)
        .await
        .map_err(|e| Transient::msg(format!("reading schema version: {e}")))?;

    for (version, ddl) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Transient::msg(format!("starting migration {version}: {e}")))?;
        sqlx::query(ddl)
            .execute(&mut *tx)
            .await
            .map_err(|e| Transient::msg(format!("applying migration {version}: {e}")))?;
        sqlx::query("UPDATE cluster_schema_migrations SET version = $1 WHERE id = 1")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| Transient::msg(format!("recording migration {version}: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| Transient::msg(format!("committing migration {version}: {e}")))?;
    }
    Ok(())
}

#[async_trait]
impl RegistryAdapter for SqlRegistry {
    async fn announce(
        &self,
        instance_id: &str,
        workers: u32,
        ttl: Duration,
        require_existing: bool,
    ) -> Result<(), Transient> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Transient::msg(format!("announce {instance_id}: begin: {e}")))?;

        let deleted = sqlx::query(
            "DELETE FROM cluster_node WHERE id = $1 AND key = $2 AND env = $3",
        )
        .bind(instance_id)
        .bind(&self.scope.key)
        .bind(&self.scope.environment)
        .execute(&mut *tx)
        .await
        .map_err(|e| Transient::msg(format!("announce {instance_id}: delete: {e}")))?;

        if require_existing && deleted.rows_affected() == 0 {
            // Our entry is gone (expired or never created) — the spec
            // treats this as a semantic error that the next successful
            // announce will repair; here we still (re)create it below so
            // the member re-enters the registry, but report failure so the
            // heartbeat loop's retry/backoff path is exercised.
            tx.rollback().await.ok();
            return Err(Transient::msg(format!(
                "announce {instance_id}: entry missing, expected prior existence"
            )));
        }

        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(ttl.as_secs() as i64);
        sqlx::query(
            "INSERT INTO cluster_node (id, key, env, partition, workers, updated, expires)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(instance_id)
        .bind(&self.scope.key)
        .bind(&self.scope.environment)
        .bind(&self.scope.partition)
        .bind(workers as i32)
        .bind(now.naive_utc())
        .bind(expires.naive_utc())
        .execute(&mut *tx)
        .await
        .map_err(|e| Transient::msg(format!("announce {instance_id}: insert: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| Transient::msg(format!("announce {instance_id}: commit: {e}")))?;
        Ok(())
    }

    async fn retract(&self, instance_id: &str) -> Result<(), Transient> {
        sqlx::query("DELETE FROM cluster_node WHERE id = $1 AND key = $2 AND env = $3")
            .bind(instance_id)
            .bind(&self.scope.key)
            .bind(&self.scope.environment)
            .execute(&self.pool)
            .await
            .map_err(|e| Transient::msg(format!("retract {instance_id}: {e}")))?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<(String, u32)>, Transient> {
        let rows: Vec<PgRow> = sqlx::query(
            "SELECT id, workers FROM cluster_node
             WHERE key = $1 AND env = $2
               AND ($3::varchar IS NULL OR partition = $3)
               AND expires >= $4
             ORDER BY id ASC",
        )
        .bind(&self.scope.key)
        .bind(&self.scope.environment)
        .bind(&self.scope.partition)
        .bind(Utc::now().naive_utc())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Transient::msg(format!("snapshot: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let workers: i32 = row.get("workers");
                (id, workers.max(0) as u32)
            })
            .collect())
    }

    async fn await_change(&self, since: DateTime<Utc>) -> Result<ChangeOutcome, Transient> {
        let deadline = since + chrono::Duration::from_std(FORCED_BALANCE_CAP).unwrap();
        tokio::time::sleep(POLL_INTERVAL).await;

        let changed_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cluster_node
             WHERE key = $1 AND env = $2
               AND ($3::varchar IS NULL OR partition = $3)
               AND updated >= $4",
        )
        .bind(&self.scope.key)
        .bind(&self.scope.environment)
        .bind(&self.scope.partition)
        .bind(since.naive_utc())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Transient::msg(format!("await_change: polling: {e}")))?;

        if changed_count > 0 {
            return Ok(ChangeOutcome::Changed);
        }
        if Utc::now() >= deadline {
            // Liveness: force a balance pass even though nothing observably
            // changed, guarding against a missed update or a silent expiry.
            return Ok(ChangeOutcome::Changed);
        }
        Ok(ChangeOutcome::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_contiguous_from_one() {
        for (i, (version, _)) in MIGRATIONS.iter().enumerate() {
            assert_eq!(*version, (i + 1) as i32);
        }
    }
}
