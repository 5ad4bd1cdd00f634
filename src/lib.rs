//! # clustermesh
//!
//! Registry-coordinated cluster membership and worker balancing, without
//! peer-to-peer gossip. A set of cooperating processes each declare how many
//! workers they contribute; this crate assigns every process a contiguous
//! `(base, workers, total)` triple against a shared registry, keeps it fresh
//! while the process is alive, and notifies the host application whenever
//! either `base` or `total` changes. Applications partition work
//! deterministically by hashing keys into `0..total` and handling locally
//! the range `[base, base + workers)`.
//!
//! ## Module organization
//!
//! - [`config`] — member configuration, identifier generation and validation
//! - [`state`] — the readers-writer-locked membership state and the
//!   `ClusterState`/`RebalanceCallback` types handed to application code
//! - [`balance`] — the pure balance algorithm: snapshot in, `(base, total)`
//!   out
//! - [`registry`] — the registry adapter abstraction plus the KV, SQL and
//!   static backends
//! - [`job`] — the optional progress-tracking sidecar, independent of
//!   membership
//! - [`logging`] — the syslog-style logging callback, bridged onto `tracing`
//! - [`error`] — the public `ClusterError` and the internal `Transient`
//!   channel used by backends
//! - `fork` — the fork-safety protocol (crate-internal plumbing, driven
//!   through [`Cluster::fork_prepare`] and friends)
//! - `heartbeat`, `watch` — the two background loops (crate-internal; see
//!   [`Cluster::join`])
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() -> clustermesh::error::Result<()> {
//! use clustermesh::Cluster;
//!
//! let cluster = Cluster::new("my-service")?;
//! cluster.set_workers(4)?;
//! cluster.set_registry(Some("https://kv.example.com"))?;
//! cluster.set_rebalance_callback(|state| {
//!     println!("now responsible for {}..{} of {}", state.index, state.index + state.workers as i64, state.total);
//! })?;
//! cluster.join().await?;
//! // ... run the application; the callback fires on every membership change ...
//! cluster.leave().await?;
//! # Ok(())
//! # }
//! ```

pub mod balance;
pub mod config;
pub mod error;
mod fork;
mod heartbeat;
pub mod job;
pub mod logging;
pub mod registry;
pub mod state;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use config::{generate_hex_token, ForkPolicy, MemberConfig, Mode, RegistryEndpoint};
use error::{ClusterError, Result, Transient};
use logging::{LogCallback, Logger, Priority};
use state::{flag, ClusterState, RebalanceCallback, Shared};

fn backend_unavailable(Transient(cause): Transient) -> ClusterError {
    ClusterError::BackendUnavailable(cause.to_string())
}

/// A single process's membership in one cluster (spec §1, §3).
///
/// Cheap to construct, expensive to join: `new` only validates `key` and
/// fills in defaults. All setters except [`Cluster::set_verbose`] and
/// [`Cluster::set_logger`] return [`ClusterError::NotPermitted`] once the
/// cluster is joined (spec §6) — configuration is immutable for the
/// lifetime of a membership.
pub struct Cluster {
    config: Mutex<MemberConfig>,
    /// Indirected through a lock because the fork protocol must replace this
    /// with a fresh `Shared` in the child process, where the inherited
    /// lock's internal state is undefined (spec §4.6, §9).
    shared: RwLock<Arc<Shared>>,
    logger: Logger,
    callback: Mutex<Option<RebalanceCallback>>,
}

impl Cluster {
    /// `make_cluster(key)`. Validates `key` (<=32 alphanumeric/hyphen chars)
    /// and nothing else — every other field takes its spec-mandated default.
    pub fn new(key: &str) -> Result<Self> {
        Ok(Cluster {
            config: Mutex::new(MemberConfig::new(key)?),
            shared: RwLock::new(Arc::new(Shared::new())),
            logger: Logger::new(),
            callback: Mutex::new(None),
        })
    }

    fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared.read())
    }

    fn is_joined(&self) -> bool {
        self.shared().lock.read().has(flag::JOINED)
    }

    fn ensure_unjoined(&self) -> Result<()> {
        if self.is_joined() {
            return Err(ClusterError::NotPermitted(
                "configuration cannot change while the cluster is joined",
            ));
        }
        Ok(())
    }

    // ---- identity & config API (spec §6) ----

    pub fn key(&self) -> String {
        self.config.lock().key.clone()
    }

    pub fn environment(&self) -> String {
        self.config.lock().environment.clone()
    }

    pub fn instance_id(&self) -> String {
        self.config.lock().instance_id.clone()
    }

    pub fn partition(&self) -> Option<String> {
        self.config.lock().partition.clone()
    }

    pub fn set_environment(&self, environment: &str) -> Result<()> {
        self.ensure_unjoined()?;
        self.config.lock().environment = environment.to_string();
        Ok(())
    }

    pub fn set_instance_id(&self, instance_id: &str) -> Result<()> {
        self.ensure_unjoined()?;
        config::validate_instance_id(instance_id)?;
        self.config.lock().instance_id = instance_id.to_string();
        Ok(())
    }

    /// Replaces the instance id with a freshly generated 32-char hex token.
    pub fn reset_instance_id(&self) -> Result<()> {
        self.ensure_unjoined()?;
        self.config.lock().instance_id = generate_hex_token();
        Ok(())
    }

    pub fn set_partition(&self, partition: Option<&str>) -> Result<()> {
        self.ensure_unjoined()?;
        if let Some(p) = partition {
            config::validate_partition(p)?;
        }
        self.config.lock().partition = partition.map(str::to_string);
        Ok(())
    }

    pub fn set_workers(&self, workers: u32) -> Result<()> {
        self.ensure_unjoined()?;
        config::validate_workers(workers)?;
        self.config.lock().workers = workers;
        Ok(())
    }

    /// Selects the registry backend from a URI scheme, or clears it back to
    /// static mode when `endpoint` is `None` (spec §6).
    pub fn set_registry(&self, endpoint: Option<&str>) -> Result<()> {
        self.ensure_unjoined()?;
        let resolved = config::parse_registry_endpoint(endpoint)?;
        self.config.lock().registry_endpoint = resolved;
        Ok(())
    }

    pub fn set_fork_policy(&self, policy: ForkPolicy) -> Result<()> {
        self.ensure_unjoined()?;
        self.config.lock().fork_policy = policy;
        Ok(())
    }

    /// Static mode only (spec §4.7); same while-joined restriction as every
    /// other setter.
    pub fn set_static_index(&self, index: i64) -> Result<()> {
        self.ensure_unjoined()?;
        self.config.lock().static_index = Some(index);
        Ok(())
    }

    pub fn set_static_total(&self, total: u64) -> Result<()> {
        self.ensure_unjoined()?;
        self.config.lock().static_total = Some(total);
        Ok(())
    }

    /// Exempt from the while-joined restriction (spec §6).
    pub fn set_rebalance_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&ClusterState) + Send + Sync + 'static,
    {
        self.ensure_unjoined()?;
        *self.callback.lock() = Some(Arc::new(callback));
        Ok(())
    }

    /// Exempt from the while-joined restriction (spec §6): installs (or
    /// clears) the logging callback, which takes effect immediately for any
    /// already-running background loop.
    pub fn set_logger<F>(&self, callback: Option<F>)
    where
        F: Fn(Priority, &str) + Send + Sync + 'static,
    {
        self.logger
            .set_callback(callback.map(|cb| Arc::new(cb) as Arc<LogCallback>));
    }

    /// Exempt from the while-joined restriction (spec §6).
    pub fn set_verbose(&self, verbose: bool) {
        let shared = self.shared();
        let mut guard = shared.lock.write();
        if verbose {
            guard.set(flag::VERBOSE);
        } else {
            guard.clear(flag::VERBOSE);
        }
    }

    /// `{index, workers, total, passive}` for the current membership. `-1`
    /// for `index` means this member is not present in the current
    /// snapshot.
    pub fn state(&self) -> ClusterState {
        let cfg = self.config.lock();
        self.shared()
            .snapshot(cfg.workers, matches!(cfg.mode, Mode::Passive))
    }

    // ---- lifecycle (spec §4.5) ----

    /// Joins as an active member. A no-op returning success if already
    /// joined.
    pub async fn join(&self) -> Result<()> {
        self.join_as(Mode::Active).await
    }

    /// Joins as a passive observer: contributes zero workers, never
    /// heartbeats, and always observes `index = -1`.
    pub async fn join_passive(&self) -> Result<()> {
        self.join_as(Mode::Passive).await
    }

    async fn join_as(&self, mode: Mode) -> Result<()> {
        if self.is_joined() {
            return Ok(());
        }
        self.config.lock().mode = mode;
        self.do_join().await
    }

    /// Leaves the cluster. A no-op returning success if not joined.
    pub async fn leave(&self) -> Result<()> {
        let shared = self.shared();
        if !shared.lock.read().has(flag::JOINED) {
            return Ok(());
        }

        let (heartbeat_task, watch_task) = {
            let mut guard = shared.lock.write();
            guard.set(flag::LEAVING);
            (guard.heartbeat_task.take(), guard.watch_task.take())
        };
        let heartbeat_ran = heartbeat_task.is_some();

        if let Some(task) = heartbeat_task {
            let _ = task.await;
        }
        if let Some(task) = watch_task {
            let _ = task.await;
        }

        // The heartbeat loop performs the final retract on its own way out.
        // When it never ran at all (passive mode, static mode, or a join
        // that failed before spawning it), issue one synchronously; every
        // backend's `retract` tolerates an absent entry, so this is safe
        // even when nothing was ever announced.
        if !heartbeat_ran {
            let cfg = self.config.lock().clone();
            if !matches!(cfg.registry_endpoint, RegistryEndpoint::Static) {
                match registry::build(
                    &cfg.registry_endpoint,
                    &cfg.key,
                    &cfg.environment,
                    cfg.partition.as_deref(),
                )
                .await
                {
                    Ok(reg) => {
                        if let Err(Transient(cause)) = reg.retract(&cfg.instance_id).await {
                            self.logger.log(
                                Priority::Warning,
                                &format!("synchronous retract on leave failed: {cause}"),
                            );
                        }
                    }
                    Err(Transient(cause)) => self.logger.log(
                        Priority::Warning,
                        &format!("could not reach registry for synchronous retract: {cause}"),
                    ),
                }
            }
        }

        let mut guard = shared.lock.write();
        guard.clear(flag::JOINED);
        guard.clear(flag::LEAVING);
        guard.base_index = -1;
        guard.total_workers = 0;
        Ok(())
    }

    /// Implies `leave`, then drops `self`.
    pub async fn destroy(self) -> Result<()> {
        self.leave().await
    }

    fn fire_callback(&self, base: i64, total: u64, workers: u32, passive: bool) {
        if let Some(cb) = self.callback.lock().clone() {
            let state = ClusterState {
                index: base,
                workers: if base < 0 { 0 } else { workers },
                total,
                passive,
            };
            cb(&state);
        }
    }

    /// The shared body of `join`/`join_passive` and of fork recovery: one
    /// synchronous announce, one synchronous balance, then spawn the
    /// background loops (spec §4.5). Any failure here is equivalent to a
    /// full `leave` that tolerates partial state: whatever was already
    /// announced is retracted before the error is returned, and `JOINED` is
    /// never set, so a plain `leave()` call afterward is a no-op.
    async fn do_join(&self) -> Result<()> {
        let cfg = self.config.lock().clone();
        let shared = self.shared();

        if matches!(cfg.registry_endpoint, RegistryEndpoint::Static) {
            return self.join_static(&cfg, &shared);
        }

        let passive = matches!(cfg.mode, Mode::Passive);
        let ttl = Duration::from_secs(cfg.ttl_seconds);

        let registry_hb = registry::build(
            &cfg.registry_endpoint,
            &cfg.key,
            &cfg.environment,
            cfg.partition.as_deref(),
        )
        .await
        .map_err(backend_unavailable)?;
        registry_hb
            .maybe_migrate_schema()
            .await
            .map_err(backend_unavailable)?;

        if !passive {
            registry_hb
                .announce(&cfg.instance_id, cfg.workers, ttl, false)
                .await
                .map_err(backend_unavailable)?;
        }

        let snapshot = match registry_hb.snapshot().await {
            Ok(s) => s,
            Err(e) => {
                if !passive {
                    let _ = registry_hb.retract(&cfg.instance_id).await;
                }
                return Err(backend_unavailable(e));
            }
        };

        let registry_watch = match registry::build(
            &cfg.registry_endpoint,
            &cfg.key,
            &cfg.environment,
            cfg.partition.as_deref(),
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                if !passive {
                    let _ = registry_hb.retract(&cfg.instance_id).await;
                }
                return Err(backend_unavailable(e));
            }
        };

        let computed = balance::balance(&snapshot, &cfg.instance_id, passive);
        {
            let mut guard = shared.lock.write();
            guard.base_index = computed.base;
            guard.total_workers = computed.total;
        }
        self.fire_callback(computed.base, computed.total, cfg.workers, passive);

        let heartbeat_task = if passive {
            None
        } else {
            let params = heartbeat::HeartbeatParams {
                instance_id: cfg.instance_id.clone(),
                workers: cfg.workers,
                ttl,
                refresh: Duration::from_secs(cfg.refresh_seconds),
                mode: cfg.mode,
            };
            Some(tokio::spawn(heartbeat::run(
                Arc::clone(&shared),
                registry_hb,
                params,
                self.logger.clone(),
            )))
        };

        let watch_params = watch::WatchParams {
            instance_id: cfg.instance_id.clone(),
            workers: cfg.workers,
            mode: cfg.mode,
        };
        let callback = self
            .callback
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::new(|_: &ClusterState| {}));
        let watch_task = tokio::spawn(watch::run(
            Arc::clone(&shared),
            registry_watch,
            watch_params,
            callback,
            self.logger.clone(),
        ));

        let mut guard = shared.lock.write();
        guard.heartbeat_task = heartbeat_task;
        guard.watch_task = Some(watch_task);
        guard.set(flag::JOINED);
        Ok(())
    }

    /// Static mode (spec §4.7): no registry, no background loops, one
    /// immediate callback.
    fn join_static(&self, cfg: &MemberConfig, shared: &Arc<Shared>) -> Result<()> {
        let index = cfg
            .static_index
            .ok_or_else(|| ClusterError::Invalid("static_index is not set".to_string()))?;
        let total = cfg
            .static_total
            .ok_or_else(|| ClusterError::Invalid("static_total is not set".to_string()))?;
        if index < 0 || (index as u64).saturating_add(cfg.workers as u64) > total {
            return Err(ClusterError::Invalid(format!(
                "static_index {index} + workers {} exceeds static_total {total}",
                cfg.workers
            )));
        }
        {
            let mut guard = shared.lock.write();
            guard.base_index = index;
            guard.total_workers = total;
            guard.set(flag::JOINED);
        }
        self.fire_callback(index, total, cfg.workers, false);
        Ok(())
    }

    // ---- fork protocol (spec §4.6) ----

    /// Run before `fork()`. Quiesces both background loops and returns
    /// whether this member was joined beforehand — pass that value to
    /// [`Cluster::fork_parent_after`] or [`Cluster::fork_child_after`].
    pub async fn fork_prepare(&self) -> bool {
        let shared = self.shared();
        fork::prepare(&shared).await;
        let joined = shared.lock.read().has(flag::JOINED);
        joined
    }

    /// # Safety
    /// Must only be called after [`Cluster::fork_prepare`] has completed, so
    /// the membership lock is guaranteed not to be held at the moment of the
    /// fork (spec §4.6, §9).
    pub unsafe fn fork_raw(&self) -> i32 {
        fork::raw_fork()
    }

    /// Call in the parent immediately after a successful `fork_raw`.
    pub async fn fork_parent_after(&self, was_joined: bool) -> Result<()> {
        let policy = self.config.lock().fork_policy;
        match fork::parent_action(policy, was_joined) {
            fork::PostForkAction::Rejoin { .. } => self.do_join().await,
            fork::PostForkAction::StayUnjoined => {
                self.shared().lock.write().clear(flag::JOINED);
                Ok(())
            }
        }
    }

    /// Call in the child immediately after a successful `fork_raw`. Always
    /// rebuilds the membership lock from scratch first: its state across a
    /// fork is undefined (spec §4.6, §9).
    pub async fn fork_child_after(&self, was_joined: bool) -> Result<()> {
        *self.shared.write() = Arc::new(Shared::new());
        let policy = self.config.lock().fork_policy;
        match fork::child_action(policy, was_joined) {
            fork::PostForkAction::Rejoin { fresh_instance_id } => {
                if fresh_instance_id {
                    self.config.lock().instance_id = generate_hex_token();
                }
                self.do_join().await
            }
            fork::PostForkAction::StayUnjoined => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_cluster_is_unjoined_with_defaults() {
        let cluster = Cluster::new("mycluster").unwrap();
        assert_eq!(cluster.key(), "mycluster");
        assert_eq!(cluster.environment(), config::DEFAULT_ENVIRONMENT);
        assert!(cluster.partition().is_none());
        let state = cluster.state();
        assert_eq!(state.index, -1);
        assert_eq!(state.total, 0);
    }

    #[test]
    fn new_rejects_an_invalid_key() {
        assert!(Cluster::new("has a space").is_err());
    }

    #[test]
    fn setters_are_rejected_once_joined() {
        let cluster = Cluster::new("mycluster").unwrap();
        cluster.shared().lock.write().set(flag::JOINED);
        assert!(matches!(
            cluster.set_workers(3),
            Err(ClusterError::NotPermitted(_))
        ));
        assert!(matches!(
            cluster.set_environment("staging"),
            Err(ClusterError::NotPermitted(_))
        ));
        // Exempt from the restriction:
        cluster.set_verbose(true);
        cluster.set_logger::<fn(Priority, &str)>(None);
    }

    #[tokio::test]
    async fn static_mode_join_fires_one_immediate_callback() {
        let cluster = Cluster::new("mycluster").unwrap();
        cluster.set_workers(2).unwrap();
        cluster.set_static_index(3).unwrap();
        cluster.set_static_total(10).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(Mutex::new(None));
        let calls2 = Arc::clone(&calls);
        let observed2 = Arc::clone(&observed);
        cluster
            .set_rebalance_callback(move |s: &ClusterState| {
                calls2.fetch_add(1, Ordering::SeqCst);
                *observed2.lock() = Some(*s);
            })
            .unwrap();

        cluster.join().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *observed.lock(),
            Some(ClusterState {
                index: 3,
                workers: 2,
                total: 10,
                passive: false,
            })
        );
        assert_eq!(
            cluster.state(),
            ClusterState {
                index: 3,
                workers: 2,
                total: 10,
                passive: false,
            }
        );

        cluster.leave().await.unwrap();
        assert_eq!(cluster.state().index, -1);
    }

    #[tokio::test]
    async fn static_mode_join_rejects_overflowing_assignment() {
        let cluster = Cluster::new("mycluster").unwrap();
        cluster.set_workers(5).unwrap();
        cluster.set_static_index(8).unwrap();
        cluster.set_static_total(10).unwrap();
        assert!(matches!(
            cluster.join().await,
            Err(ClusterError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn join_is_idempotent_without_an_intervening_leave() {
        let cluster = Cluster::new("mycluster").unwrap();
        cluster.set_static_index(0).unwrap();
        cluster.set_static_total(1).unwrap();
        cluster.join().await.unwrap();
        cluster.join().await.unwrap();
        assert!(cluster.is_joined());
    }

    #[tokio::test]
    async fn leave_without_join_is_a_no_op() {
        let cluster = Cluster::new("mycluster").unwrap();
        cluster.leave().await.unwrap();
    }

    #[tokio::test]
    async fn join_fails_without_static_parameters() {
        let cluster = Cluster::new("mycluster").unwrap();
        assert!(matches!(
            cluster.join().await,
            Err(ClusterError::Invalid(_))
        ));
    }
}
