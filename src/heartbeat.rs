//! The heartbeat loop (spec §4.3): one cooperative task per joined cluster
//! whose only side effects are registry writes and, on exit, one delete.
//!
//! Grounded on the teacher's `start_heartbeat` background-loop shape
//! (`worker_client.rs`, `pg_worker.rs`: sleep-tick, read shared state,
//! write registry, check a shutdown flag) translated from an OS thread
//! blocking on HTTP/SQL calls to a `tokio::spawn`ed task driving an async
//! `RegistryAdapter`, since the spec's scheduling model is parallel
//! cooperative tasks, not OS threads (§5).

use std::sync::Arc;
use std::time::Duration;

use crate::config::Mode;
use crate::error::Transient;
use crate::logging::{Logger, Priority};
use crate::registry::RegistryAdapter;
use crate::state::{flag, Shared};

const ANNOUNCE_RETRY_DELAY: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_secs(1);

pub struct HeartbeatParams {
    pub instance_id: String,
    pub workers: u32,
    pub ttl: Duration,
    pub refresh: Duration,
    pub mode: Mode,
}

/// Runs until `LEAVING` is observed, then issues one `retract` and returns.
/// Passive members never call `announce`, but still run the sleep/LEAVING
/// protocol so shutdown latency is bounded the same way for every member.
pub async fn run(
    shared: Arc<Shared>,
    registry: Box<dyn RegistryAdapter>,
    params: HeartbeatParams,
    logger: Logger,
) {
    let passive = matches!(params.mode, Mode::Passive);
    let refresh_ticks = params.refresh.as_secs().max(1);
    let mut elapsed_ticks: u64 = 0;

    loop {
        tokio::time::sleep(TICK).await;

        if shared.lock.read().has(flag::LEAVING) {
            break;
        }

        if passive {
            continue;
        }

        elapsed_ticks += 1;
        if elapsed_ticks < refresh_ticks {
            continue;
        }

        match registry
            .announce(&params.instance_id, params.workers, params.ttl, true)
            .await
        {
            Ok(()) => {
                elapsed_ticks = 0;
            }
            Err(Transient(cause)) => {
                logger.log(
                    Priority::Err,
                    &format!("heartbeat announce failed: {cause}"),
                );
                tokio::time::sleep(ANNOUNCE_RETRY_DELAY).await;
                // Do not reset `elapsed_ticks`: the next tick retries the
                // announce immediately rather than waiting a full refresh
                // period again.
            }
        }
    }

    if !passive {
        if let Err(Transient(cause)) = registry.retract(&params.instance_id).await {
            logger.log(Priority::Warning, &format!("retract on exit failed: {cause}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn leaving_flag_stops_the_loop_promptly() {
        let shared = Arc::new(Shared::new());
        let params = HeartbeatParams {
            instance_id: "node1".into(),
            workers: 1,
            ttl: StdDuration::from_secs(120),
            refresh: StdDuration::from_secs(30),
            mode: Mode::Active,
        };

        let shared_for_task = Arc::clone(&shared);
        let handle = tokio::spawn(run(
            shared_for_task,
            Box::new(StaticRegistry::new()),
            params,
            Logger::new(),
        ));

        // Give the loop a moment to enter its sleep, then ask it to leave.
        tokio::time::advance(StdDuration::from_millis(500)).await;
        shared.lock.write().set(flag::LEAVING);
        tokio::time::advance(StdDuration::from_secs(2)).await;

        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .expect("heartbeat loop should exit promptly after LEAVING")
            .unwrap();
    }
}
