//! Membership state (spec §4.2): a small value object guarded by a
//! readers-writer lock. Readers (status queries, the heartbeat loop
//! preparing a write) may hold it concurrently; writers (config setters,
//! balance commit) are exclusive. No I/O or sleep ever happens with the
//! lock held — callers acquire, read or mutate, and release before doing
//! anything that blocks.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

/// Bits of `MemberState::flags`. A plain `u8` bitset — the spec calls for
/// three independent flags and nothing more, so a dedicated crate is not
/// warranted.
pub mod flag {
    pub const JOINED: u8 = 1 << 0;
    pub const LEAVING: u8 = 1 << 1;
    pub const VERBOSE: u8 = 1 << 2;
}

/// The caller-facing snapshot handed to the rebalance callback: a plain
/// borrowed value, not a shared handle (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterState {
    pub index: i64,
    pub workers: u32,
    pub total: u64,
    pub passive: bool,
}

/// Invoked strictly after the new `(base, total)` are visible in shared
/// state, with no lock held (spec §5, §9).
pub type RebalanceCallback = Arc<dyn Fn(&ClusterState) + Send + Sync>;

pub(crate) struct MemberState {
    pub base_index: i64,
    pub total_workers: u64,
    pub flags: u8,
    pub heartbeat_task: Option<JoinHandle<()>>,
    pub watch_task: Option<JoinHandle<()>>,
}

impl MemberState {
    pub fn new() -> Self {
        MemberState {
            base_index: -1,
            total_workers: 0,
            flags: 0,
            heartbeat_task: None,
            watch_task: None,
        }
    }

    pub fn has(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    pub fn set(&mut self, bit: u8) {
        self.flags |= bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.flags &= !bit;
    }
}

/// The sole shared mutable object (spec §5), always guarded.
pub(crate) struct Shared {
    pub lock: RwLock<MemberState>,
}

impl Shared {
    pub fn new() -> Self {
        Shared {
            lock: RwLock::new(MemberState::new()),
        }
    }

    /// Snapshot `(base, total)` plus the member's configured worker count
    /// and passivity, for building a `ClusterState` to hand to callbacks or
    /// to `Cluster::state()`.
    pub fn snapshot(&self, workers: u32, passive: bool) -> ClusterState {
        let guard = self.lock.read();
        ClusterState {
            index: guard.base_index,
            workers: if guard.base_index < 0 { 0 } else { workers },
            total: guard.total_workers,
            passive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_clear_and_query() {
        let mut s = MemberState::new();
        assert!(!s.has(flag::JOINED));
        s.set(flag::JOINED);
        assert!(s.has(flag::JOINED));
        s.set(flag::LEAVING);
        assert!(s.has(flag::JOINED) && s.has(flag::LEAVING));
        s.clear(flag::LEAVING);
        assert!(s.has(flag::JOINED) && !s.has(flag::LEAVING));
    }

    #[test]
    fn fresh_state_is_not_a_member() {
        let s = MemberState::new();
        assert_eq!(s.base_index, -1);
        assert_eq!(s.total_workers, 0);
    }
}
