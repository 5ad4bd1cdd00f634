//! The watch/balance loop (spec §4.4): detects registry changes, recomputes
//! `(base, total)` via the balance algorithm, and fires the rebalance
//! callback exactly once per distinct transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::balance::{balance, Balance};
use crate::config::Mode;
use crate::error::Transient;
use crate::logging::{Logger, Priority};
use crate::registry::{ChangeOutcome, RegistryAdapter};
use crate::state::{flag, ClusterState, RebalanceCallback, Shared};

/// Compare `computed` against the stored `(base, total)` and, if either
/// differs, update both atomically under the write lock. Returns the
/// `(prior, new)` pair when a transition happened, `None` otherwise (spec
/// §4.4.1 commit discipline). Shared by the watch loop and by `join`'s
/// initial synchronous balance, so both paths fire the callback under the
/// same rule — including a resolved open question: `base` transitioning to
/// `-1` always counts as a transition, even if `total` is unchanged.
pub(crate) fn commit_balance(shared: &Shared, computed: Balance) -> Option<(Balance, Balance)> {
    let mut guard = shared.lock.write();
    if guard.has(flag::LEAVING) {
        return None;
    }
    let prior = Balance {
        base: guard.base_index,
        total: guard.total_workers,
    };
    if prior.base != computed.base || prior.total != computed.total {
        guard.base_index = computed.base;
        guard.total_workers = computed.total;
        Some((prior, computed))
    } else {
        None
    }
}

const ERROR_BACKOFF: Duration = Duration::from_secs(30);

pub struct WatchParams {
    pub instance_id: String,
    pub workers: u32,
    pub mode: Mode,
}

/// Runs until `LEAVING` is observed. Each iteration: wait for a plausible
/// registry change, recompute balance under the write lock, and — only if
/// `(base, total)` actually differ from the stored values — publish them,
/// release the lock, and invoke `callback` exactly once.
pub async fn run(
    shared: Arc<Shared>,
    registry: Box<dyn RegistryAdapter>,
    params: WatchParams,
    callback: RebalanceCallback,
    logger: Logger,
) {
    let passive = matches!(params.mode, Mode::Passive);
    let mut last_poll = Utc::now();

    loop {
        if shared.lock.read().has(flag::LEAVING) {
            break;
        }

        match registry.await_change(last_poll).await {
            // Deliberately do NOT advance `last_poll` here: it anchors the
            // SQL backend's forced-balance cap (§4.1) to the last
            // *confirmed* change, not to this call's own poll window. If we
            // reset it to `now()` on every timeout, `since` never ages past
            // a few seconds and the 30s liveness cap can never be reached.
            Ok(ChangeOutcome::TimedOut) => {
                continue;
            }
            Ok(ChangeOutcome::Changed) => {
                last_poll = Utc::now();
            }
            Err(Transient(cause)) => {
                logger.log(Priority::Warning, &format!("await_change failed: {cause}"));
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        }

        let snapshot = match registry.snapshot().await {
            Ok(s) => s,
            Err(Transient(cause)) => {
                logger.log(Priority::Warning, &format!("snapshot failed: {cause}"));
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        let computed = balance(&snapshot, &params.instance_id, passive);

        if let Some((prior, new)) = commit_balance(&shared, computed) {
            logger.log(
                Priority::Info,
                &format!(
                    "rebalanced: base {} -> {}, total {} -> {}",
                    prior.base, new.base, prior.total, new.total
                ),
            );
            let state = ClusterState {
                index: new.base,
                workers: if new.base < 0 { 0 } else { params.workers },
                total: new.total,
                passive,
            };
            callback(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChangeOutcome as CO;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A registry that reports one change, then hangs (so the test's
    /// spawned task can be dropped cleanly once we've observed the
    /// callback fire).
    struct OneShotRegistry {
        snapshot: Vec<(String, u32)>,
        delivered: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RegistryAdapter for OneShotRegistry {
        async fn announce(
            &self,
            _: &str,
            _: u32,
            _: Duration,
            _: bool,
        ) -> Result<(), Transient> {
            Ok(())
        }
        async fn retract(&self, _: &str) -> Result<(), Transient> {
            Ok(())
        }
        async fn snapshot(&self) -> Result<Vec<(String, u32)>, Transient> {
            Ok(self.snapshot.clone())
        }
        async fn await_change(&self, _since: DateTime<Utc>) -> Result<CO, Transient> {
            if self
                .delivered
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                Ok(CO::Changed)
            } else {
                std::future::pending().await
            }
        }
    }

    #[tokio::test]
    async fn callback_fires_once_on_transition() {
        let shared = Arc::new(Shared::new());
        let registry = Box::new(OneShotRegistry {
            snapshot: vec![("node1".into(), 2)],
            delivered: std::sync::atomic::AtomicBool::new(false),
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(Mutex::new(None));

        let calls2 = Arc::clone(&calls);
        let observed2 = Arc::clone(&observed);
        let callback: RebalanceCallback = Arc::new(move |s: &ClusterState| {
            calls2.fetch_add(1, Ordering::SeqCst);
            *observed2.lock().unwrap() = Some(*s);
        });

        let params = WatchParams {
            instance_id: "node1".into(),
            workers: 2,
            mode: Mode::Active,
        };

        let shared_for_task = Arc::clone(&shared);
        let handle = tokio::spawn(run(shared_for_task, registry, params, callback, Logger::new()));

        // Wait for the callback to land.
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *observed.lock().unwrap(),
            Some(ClusterState {
                index: 0,
                workers: 2,
                total: 2,
                passive: false,
            })
        );

        shared.lock.write().set(flag::LEAVING);
        handle.abort();
    }
}
