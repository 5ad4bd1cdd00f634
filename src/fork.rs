//! The fork protocol (spec §4.6, §9): quiesces both background loops around
//! `libc::fork`, then lets parent and/or child rejoin per `fork_policy`.
//!
//! Lock and task state are undefined across a fork — only the thread that
//! called `fork` survives in the child, and a `parking_lot::RwLock` may be
//! held (and forever poisoned from the child's view) by a thread that no
//! longer exists there. `prepare` drains both loops *before* the fork so
//! nothing is holding the lock at the fork point, and the child always
//! rebuilds a fresh `Shared` afterward rather than trying to reuse the
//! inherited one.

use crate::config::ForkPolicy;
use crate::state::flag;
use crate::state::Shared;
use std::sync::Arc;

/// Snapshot of what to do with this member after the fork, decided from
/// `fork_policy` and whether we were joined beforehand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostForkAction {
    /// Rejoin: re-announce, re-balance, respawn both loops.
    Rejoin { fresh_instance_id: bool },
    /// Leave untouched: mark unjoined without touching the registry.
    StayUnjoined,
}

/// Runs before `fork()`. Sets `LEAVING`, takes the background-task handles,
/// releases the lock, awaits both tasks, then re-acquires and clears
/// `(base, total)` and the task handles while restoring the flags the
/// caller had before `prepare` (i.e. `LEAVING` cleared, `JOINED` untouched).
pub async fn prepare(shared: &Arc<Shared>) {
    let (heartbeat_task, watch_task, was_joined) = {
        let mut guard = shared.lock.write();
        let was_joined = guard.has(flag::JOINED);
        guard.set(flag::LEAVING);
        (guard.heartbeat_task.take(), guard.watch_task.take(), was_joined)
    };

    if let Some(task) = heartbeat_task {
        let _ = task.await;
    }
    if let Some(task) = watch_task {
        let _ = task.await;
    }

    let mut guard = shared.lock.write();
    guard.base_index = -1;
    guard.total_workers = 0;
    guard.clear(flag::LEAVING);
    if was_joined {
        guard.set(flag::JOINED);
    } else {
        guard.clear(flag::JOINED);
    }
}

/// What the parent process should do once `fork()` has returned, given the
/// policy and whether this member was joined when `prepare` ran.
pub fn parent_action(policy: ForkPolicy, was_joined: bool) -> PostForkAction {
    if was_joined && matches!(policy, ForkPolicy::ParentOnly | ForkPolicy::Both) {
        PostForkAction::Rejoin {
            fresh_instance_id: false,
        }
    } else {
        PostForkAction::StayUnjoined
    }
}

/// What the child process should do once `fork()` has returned. Under
/// `Both`, the child generates a fresh `instance_id` so parent and child do
/// not collide in the registry (rationale: dual membership is opt-in
/// because it changes cluster totals — §4.6).
pub fn child_action(policy: ForkPolicy, was_joined: bool) -> PostForkAction {
    if !was_joined {
        return PostForkAction::StayUnjoined;
    }
    match policy {
        ForkPolicy::ChildOnly => PostForkAction::Rejoin {
            fresh_instance_id: false,
        },
        ForkPolicy::Both => PostForkAction::Rejoin {
            fresh_instance_id: true,
        },
        ForkPolicy::ParentOnly => PostForkAction::StayUnjoined,
    }
}

/// Wraps `libc::fork()`. Safety: the caller must treat everything about
/// locks, background tasks and the tokio runtime as undefined in the child
/// until `child_after_fork`-equivalent recovery has run; this crate never
/// calls this from within an async context holding a lock (`prepare` has
/// already released it by the time callers invoke this).
///
/// # Safety
/// Must only be called when no other thread in this process is holding a
/// lock this process's allocator or runtime depends on; in particular,
/// callers must have already run [`prepare`] so the membership lock is not
/// held at the moment of the fork.
pub unsafe fn raw_fork() -> i32 {
    libc::fork()
}
