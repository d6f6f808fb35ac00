use std::array;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::MAX_LEVEL;

// ============================================================================
// Operation counters
// ============================================================================

/// Internal per-list counters, bumped by the thread that owns the respective
/// linearization point:
///
/// - `node_count` / `level_node_counts`: incremented by the inserter after the
///   level-0 link CAS, decremented by the deleter that wins the level-0 mark.
/// - `soft_deletes`: level-0 mark winners (logical removals).
/// - `insert_conflicts`: failed level-0 link attempts.
/// - `delete_conflicts`: helping CAS failures that forced a walk restart.
pub(crate) struct OpStats {
    node_count: AtomicI64,
    soft_deletes: AtomicU64,
    insert_conflicts: AtomicU64,
    delete_conflicts: AtomicU64,
    level_node_counts: [AtomicI64; MAX_LEVEL + 1],
}

impl OpStats {
    pub(crate) fn new() -> Self {
        OpStats {
            node_count: AtomicI64::new(0),
            soft_deletes: AtomicU64::new(0),
            insert_conflicts: AtomicU64::new(0),
            delete_conflicts: AtomicU64::new(0),
            level_node_counts: array::from_fn(|_| AtomicI64::new(0)),
        }
    }

    #[inline]
    pub(crate) fn node_linked(&self, level: usize) {
        self.node_count.fetch_add(1, Ordering::Relaxed);
        self.level_node_counts[level].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn soft_delete(&self, level: usize) {
        self.node_count.fetch_sub(1, Ordering::Relaxed);
        self.level_node_counts[level].fetch_sub(1, Ordering::Relaxed);
        self.soft_deletes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn insert_conflict(&self) {
        self.insert_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn delete_conflict(&self) {
        self.delete_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, top_level: usize) -> SkiplistStats {
        SkiplistStats {
            node_count: self.node_count.load(Ordering::Relaxed).max(0) as u64,
            soft_deletes: self.soft_deletes.load(Ordering::Relaxed),
            insert_conflicts: self.insert_conflicts.load(Ordering::Relaxed),
            delete_conflicts: self.delete_conflicts.load(Ordering::Relaxed),
            level_node_counts: array::from_fn(|i| {
                self.level_node_counts[i].load(Ordering::Relaxed).max(0) as u64
            }),
            top_level,
        }
    }
}

/// Point-in-time snapshot of a skiplist's counters.
///
/// Counters are exact when the list is quiescent; under concurrent mutation
/// they are approximate, since each is published independently.
#[derive(Clone, Debug)]
pub struct SkiplistStats {
    pub node_count: u64,
    pub soft_deletes: u64,
    pub insert_conflicts: u64,
    pub delete_conflicts: u64,
    pub level_node_counts: [u64; MAX_LEVEL + 1],
    pub top_level: usize,
}
