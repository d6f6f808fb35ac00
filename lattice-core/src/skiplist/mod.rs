use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crossbeam_epoch as epoch;

use crate::barrier::{AccessBarrier, SessionDestructor};

mod iterator;
mod node;
mod stats;

pub use iterator::Iter;
pub use stats::SkiplistStats;

pub(crate) use node::{Node, NodeItem};
use stats::OpStats;

/// Highest tower index a node may occupy. Towers have `level + 1` slots.
pub const MAX_LEVEL: usize = 32;

/// Probability of promoting a new node by one more level.
pub const LEVEL_PROBABILITY: f32 = 0.25;

// =============================================================================
// STRUCTURE & OPERATION INVARIANTS
// =============================================================================
//
// Skip list structure (sorted ascending, multiple levels, both ends closed by
// sentinels of full height):
//
// Level 2:  MIN ─────────────────────────► 30 ──────────────────────► MAX
// Level 1:  MIN ──────────► 10 ──────────► 30 ──────────────────────► MAX
// Level 0:  MIN ──────────► 10 ──► 20 ───► 30 ──► 40 ───────────────► MAX
//
// Successor reference: one word packing (pointer, deleted). The deleted flag
// on node.next[level] means the NODE is logically deleted at that level.
//
// INVARIANTS:
// 1. Each level chain from MIN reaches MAX through undeleted references.
// 2. A node present at level i > 0 is present at every level below i.
// 3. Level 0 is non-decreasing under the comparator; equal items form a run
//    ordered newest-first (inserts land at the head of the equal run).
// 4. A tower has exactly level + 1 slots; slots above are never touched.
// 5. Sentinels are never marked deleted.
//
// DELETE is two-phase:
//   Phase 1 (logical):  mark every outgoing edge, TOP-DOWN. Readers moving
//                       down a tower therefore never descend into a level
//                       where the node is linked while lower levels are gone.
//                       The level-0 mark is the linearization point.
//   Phase 2 (physical): any walk that observes a marked edge splices the
//                       owner out with CAS(prev.next: (node,0) -> (next,0)).
//                       There is no background reclaimer; helping during
//                       `find_path` is the only unlink mechanism.
//
// RECLAMATION RULE: the thread whose CAS removes a node from LEVEL 0 owns it
// and defers its destruction through the epoch collector. This is sound
// because a walk only reaches a node at level 0 after passing its position on
// every level above, splicing it there first if it was still linked - so a
// level-0 splice implies the node is unreachable at all higher levels. The
// one exception is an insert completing its tower concurrently with a delete;
// `insert_with_rand` detects the mark after linking and splices the level
// itself before returning.
//
// On helping-CAS failure the whole walk restarts from the head: the structure
// changed under us and recorded predecessors may be stale.
// =============================================================================

/// Total order over items, supplied by the caller.
///
/// Must be a total order; duplicates (`Ordering::Equal` between distinct
/// items) are permitted, the list is a multiset.
pub trait Compare<T>: Send + Sync {
    fn cmp(&self, a: &T, b: &T) -> Ordering;
}

/// Comparator for item types with an intrinsic total order.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrdComparator;

impl<T: Ord> Compare<T> for OrdComparator {
    #[inline]
    fn cmp(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

/// Construction-time configuration.
pub struct Config<C> {
    /// Total order for items.
    pub comparator: C,
    /// Attach an active access barrier. Iterators then hold a barrier session
    /// for their lifetime and callers may flush sessions carrying payloads.
    pub barrier_active: bool,
    /// Destructor invoked for each drained session payload.
    pub session_destructor: Option<SessionDestructor>,
}

impl<C> Config<C> {
    pub fn new(comparator: C) -> Self {
        Config {
            comparator,
            barrier_active: false,
            session_destructor: None,
        }
    }
}

// ============================================================================
// Skiplist
// ============================================================================

/// A lock-free ordered multiset.
///
/// Point operations are linearizable: insert at its level-0 link CAS, delete
/// at the first successful level-0 mark, contains at its observation of an
/// unmarked equal node. Iteration is weakly consistent (see [`Iter`]).
pub struct Skiplist<T, C = OrdComparator> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    top_level: AtomicUsize,
    comparator: C,
    barrier: AccessBarrier,
    stats: OpStats,
}

unsafe impl<T: Send, C: Send> Send for Skiplist<T, C> {}
unsafe impl<T: Send, C: Sync> Sync for Skiplist<T, C> {}

impl<T: Ord> Skiplist<T, OrdComparator> {
    /// Create a skiplist ordered by `T`'s own ordering, barrier inactive.
    pub fn new() -> Self {
        Self::with_config(Config::new(OrdComparator))
    }
}

impl<T: Ord> Default for Skiplist<T, OrdComparator> {
    fn default() -> Self {
        Self::new()
    }
}

type Path<T> = [*mut Node<T>; MAX_LEVEL + 1];

impl<T, C: Compare<T>> Skiplist<T, C> {
    /// Create a skiplist with a caller-supplied comparator, barrier inactive.
    pub fn with_comparator(comparator: C) -> Self {
        Self::with_config(Config::new(comparator))
    }

    pub fn with_config(config: Config<C>) -> Self {
        let head = Node::alloc_node(NodeItem::Min, MAX_LEVEL);
        let tail = Node::alloc_node(NodeItem::Max, MAX_LEVEL);
        unsafe {
            for i in 0..=MAX_LEVEL {
                (*head).store_next(i, tail);
            }
        }

        Skiplist {
            head,
            tail,
            top_level: AtomicUsize::new(0),
            comparator: config.comparator,
            barrier: AccessBarrier::new(config.barrier_active, config.session_destructor),
            stats: OpStats::new(),
        }
    }

    /// Pick a tower level for a new node.
    ///
    /// Repeatedly samples the supplied uniform `[0,1)` generator; each sample
    /// below [`LEVEL_PROBABILITY`] promotes one level. If the result exceeds
    /// the current top, one CAS attempt raises the top by a single level and
    /// the result is clamped to `top + 1` regardless of the CAS outcome, so
    /// the top grows at most one level per insertion.
    fn random_level<R: FnMut() -> f32>(&self, rand_fn: &mut R) -> usize {
        let mut level = 0;
        while level < MAX_LEVEL && rand_fn() < LEVEL_PROBABILITY {
            level += 1;
        }

        let top = self.top_level.load(AtomicOrdering::Acquire);
        if level > top {
            let _ = self.top_level.compare_exchange(
                top,
                top + 1,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            );
            level = top + 1;
        }

        level
    }

    /// Walk the list top-down, recording the predecessor and successor at
    /// every level and splicing out any logically deleted node encountered.
    ///
    /// Returns true iff the level-0 successor compares equal to `item`.
    /// Restarts from the head whenever a helping CAS fails.
    pub(crate) fn find_path(
        &self,
        item: &T,
        preds: &mut Path<T>,
        succs: &mut Path<T>,
    ) -> bool {
        'retry: loop {
            let mut prev = self.head;
            let top = self.top_level.load(AtomicOrdering::Acquire);
            let mut ord = Ordering::Greater;

            for i in (0..=top).rev() {
                let mut curr = unsafe { (*prev).load_next(i) }.as_ptr();

                loop {
                    let mut next = unsafe { (*curr).load_next(i) };

                    while next.is_deleted() {
                        // curr is logically deleted at this level: help splice
                        // it out before looking at its item.
                        if unsafe { (*prev).cas_next(i, curr, next.as_ptr()) }.is_err() {
                            self.stats.delete_conflict();
                            continue 'retry;
                        }
                        if i == 0 {
                            // Level-0 splice winner owns the node.
                            self.reclaim(curr);
                        }
                        curr = unsafe { (*prev).load_next(i) }.as_ptr();
                        next = unsafe { (*curr).load_next(i) };
                    }

                    ord = unsafe { (*curr).item() }.compare_with(&self.comparator, item);
                    if ord == Ordering::Less {
                        prev = curr;
                        curr = next.as_ptr();
                    } else {
                        break;
                    }
                }

                preds[i] = prev;
                succs[i] = curr;
            }

            return ord == Ordering::Equal;
        }
    }

    /// Insert an item, tower level drawn from the thread-local generator.
    pub fn insert(&self, item: T) {
        self.insert_with_rand(item, fastrand::f32);
    }

    /// Insert with a caller-supplied level sampler (deterministic tests).
    ///
    /// Equal items are placed at the head of their equal run, so iteration
    /// yields duplicates newest-first.
    pub fn insert_with_rand<R: FnMut() -> f32>(&self, item: T, mut rand_fn: R) {
        let _guard = epoch::pin();

        let level = self.random_level(&mut rand_fn);
        let node = Node::alloc_node(NodeItem::Value(item), level);

        let mut preds: Path<T> = [ptr::null_mut(); MAX_LEVEL + 1];
        let mut succs: Path<T> = [ptr::null_mut(); MAX_LEVEL + 1];

        unsafe {
            let item_ref = (*node).value();

            // Level 0 is the linearization point.
            loop {
                self.find_path(item_ref, &mut preds, &mut succs);
                (*node).store_next(0, succs[0]);
                if (*preds[0]).cas_next(0, succs[0], node).is_ok() {
                    break;
                }
                self.stats.insert_conflict();
            }
            self.stats.node_linked(level);

            // Raise the tower. A failure here never undoes the levels already
            // linked: the node is a member, only its height is incomplete.
            'tower: for i in 1..=level {
                loop {
                    let cur = (*node).load_next(i);
                    if cur.is_deleted() {
                        // A racing delete owns the node; stop raising.
                        break 'tower;
                    }
                    if (*node).cas_next(i, cur.as_raw(), succs[i]).is_err() {
                        continue;
                    }
                    if (*preds[i]).cas_next(i, succs[i], node).is_ok() {
                        if (*node).load_next(i).is_deleted() {
                            // Marked between our slot write and the link: the
                            // delete's unlink walks may already have passed
                            // this level, so splice it back out ourselves.
                            self.unlink_level(i, preds[i], node);
                            break 'tower;
                        }
                        continue 'tower;
                    }
                    self.find_path(item_ref, &mut preds, &mut succs);
                }
            }
        }
    }

    /// Logically delete one item comparing equal to `item`.
    ///
    /// Marks every outgoing edge of the target top-down, then re-walks so
    /// helping physically unlinks it at all levels. Returns true iff an equal
    /// item was found, even when a racing deleter set some of the marks.
    pub fn delete(&self, item: &T) -> bool {
        let _guard = epoch::pin();

        let mut preds: Path<T> = [ptr::null_mut(); MAX_LEVEL + 1];
        let mut succs: Path<T> = [ptr::null_mut(); MAX_LEVEL + 1];

        if !self.find_path(item, &mut preds, &mut succs) {
            return false;
        }

        let target = succs[0];
        unsafe {
            let target_level = (*target).level();
            let mut owned_level0 = false;

            for i in (0..=target_level).rev() {
                loop {
                    let next = (*target).load_next(i);
                    if next.is_deleted() {
                        break;
                    }
                    if (*target)
                        .cas_next(i, next.as_raw(), next.with_deleted().as_raw())
                        .is_ok()
                    {
                        if i == 0 {
                            owned_level0 = true;
                        }
                        break;
                    }
                }
            }

            if owned_level0 {
                self.stats.soft_delete(target_level);
            }
        }

        // Help the physical unlink along at every level.
        self.find_path(item, &mut preds, &mut succs);

        true
    }

    /// True iff an unmarked node comparing equal to `item` is present.
    pub fn contains(&self, item: &T) -> bool {
        let _guard = epoch::pin();

        let mut preds: Path<T> = [ptr::null_mut(); MAX_LEVEL + 1];
        let mut succs: Path<T> = [ptr::null_mut(); MAX_LEVEL + 1];
        self.find_path(item, &mut preds, &mut succs)
    }

    /// A weakly consistent forward iterator over the list.
    ///
    /// Holds a barrier session for its lifetime when the barrier is active.
    pub fn iter(&self) -> Iter<'_, T, C> {
        Iter::new(self)
    }

    /// Collect the current items in order. Weakly consistent, like [`iter`].
    ///
    /// [`iter`]: Skiplist::iter
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut out = Vec::new();
        let mut iter = self.iter();
        iter.seek_first();
        while iter.valid() {
            if let Some(item) = iter.item() {
                out.push(item.clone());
            }
            iter.next();
        }
        out
    }

    /// Number of items seen by a full level-0 scan.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut iter = self.iter();
        iter.seek_first();
        while iter.valid() {
            count += 1;
            iter.next();
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> SkiplistStats {
        self.stats
            .snapshot(self.top_level.load(AtomicOrdering::Acquire))
    }

    /// Splice `node` out of a single level, walking right from `pred`.
    ///
    /// Used by an inserter that linked a level after a racing delete marked
    /// it. Returns once the node is no longer reachable at this level.
    unsafe fn unlink_level(&self, level: usize, pred: *mut Node<T>, node: *mut Node<T>) {
        unsafe {
            let mut pred = pred;
            loop {
                let pred_next = (*pred).load_next(level);
                let pred_next_ptr = pred_next.as_ptr();

                if pred_next_ptr == node {
                    if pred_next.is_deleted() {
                        // pred itself is deleted; its edge can no longer be
                        // swung. Start the scan over from the head.
                        pred = self.head;
                        continue;
                    }
                    let next = (*node).load_next(level).as_ptr();
                    if (*pred).cas_next(level, node, next).is_ok() {
                        return;
                    }
                    continue;
                }

                if pred_next_ptr == self.tail {
                    // Reached the end without finding the node: some other
                    // walk already spliced it.
                    return;
                }
                pred = pred_next_ptr;
            }
        }
    }

    /// Defer destruction of a node this thread just removed from level 0.
    fn reclaim(&self, node: *mut Node<T>) {
        let guard = epoch::pin();
        unsafe {
            guard.defer_unchecked(move || Node::dealloc_node(node));
        }
    }
}

impl<T, C> Skiplist<T, C> {
    /// The access barrier attached to this list.
    pub fn access_barrier(&self) -> &AccessBarrier {
        &self.barrier
    }
}

impl<T, C> Drop for Skiplist<T, C> {
    fn drop(&mut self) {
        // Exclusive access: free everything still on the level-0 chain,
        // including logically deleted nodes that were never spliced. Nodes
        // already spliced from level 0 are owned by the epoch collector.
        unsafe {
            let mut curr = (*self.head).load_next(0).as_ptr();
            while curr != self.tail {
                let next = (*curr).load_next(0).as_ptr();
                Node::dealloc_node(curr);
                curr = next;
            }
            Node::dealloc_node(self.tail);
            Node::dealloc_node(self.head);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Force every node to a single level so chain shapes are deterministic.
    fn flat() -> impl FnMut() -> f32 {
        || 1.0
    }

    #[test]
    fn test_find_path_reports_membership() {
        let list: Skiplist<i32> = Skiplist::new();
        for i in [10, 20, 30] {
            list.insert_with_rand(i, flat());
        }

        let mut preds: Path<i32> = [std::ptr::null_mut(); MAX_LEVEL + 1];
        let mut succs: Path<i32> = [std::ptr::null_mut(); MAX_LEVEL + 1];

        assert!(list.find_path(&20, &mut preds, &mut succs));
        assert!(!list.find_path(&25, &mut preds, &mut succs));
        unsafe {
            // Successor of the miss is the first larger item.
            assert_eq!(*(*succs[0]).value(), 30);
        }
    }

    #[test]
    fn test_helping_unlinks_marked_node() {
        // A node marked at all levels but never walked by its deleter must be
        // physically removed by an unrelated operation's traversal.
        let list: Skiplist<i32> = Skiplist::new();
        for i in [10, 20, 30] {
            list.insert_with_rand(i, flat());
        }

        let mut preds: Path<i32> = [std::ptr::null_mut(); MAX_LEVEL + 1];
        let mut succs: Path<i32> = [std::ptr::null_mut(); MAX_LEVEL + 1];
        assert!(list.find_path(&20, &mut preds, &mut succs));
        let target = succs[0];

        // Mark every edge, as delete does, but skip the cleanup walk.
        unsafe {
            for i in (0..=(*target).level()).rev() {
                loop {
                    let next = (*target).load_next(i);
                    if next.is_deleted() {
                        break;
                    }
                    if (*target)
                        .cas_next(i, next.as_raw(), next.with_deleted().as_raw())
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }

        // An independent insert of a larger item walks past the marked node
        // and must splice it out.
        list.insert_with_rand(40, flat());

        assert!(!list.contains(&20));
        assert_eq!(list.to_vec(), vec![10, 30, 40]);

        // The level-0 chain no longer visits the marked node.
        unsafe {
            let mut curr = (*list.head).load_next(0).as_ptr();
            while curr != list.tail {
                assert!(curr != target);
                curr = (*curr).load_next(0).as_ptr();
            }
        }
    }

    #[test]
    fn test_top_level_grows_one_per_insert() {
        let list: Skiplist<i32> = Skiplist::new();
        // A sampler that always promotes would request MAX_LEVEL every time;
        // the top may still only grow by one per insertion.
        for i in 0..5 {
            list.insert_with_rand(i, || 0.0);
            assert!(list.stats().top_level <= (i + 1) as usize);
        }
    }

    #[test]
    fn test_equal_items_are_newest_first() {
        struct ByKey;
        impl Compare<(i32, u32)> for ByKey {
            fn cmp(&self, a: &(i32, u32), b: &(i32, u32)) -> Ordering {
                a.0.cmp(&b.0)
            }
        }

        let list: Skiplist<(i32, u32), ByKey> = Skiplist::with_comparator(ByKey);
        for tag in 0..3 {
            list.insert_with_rand((7, tag), flat());
        }
        list.insert_with_rand((5, 99), flat());

        let tags: Vec<u32> = list.to_vec().into_iter().map(|(_, t)| t).collect();
        assert_eq!(tags, vec![99, 2, 1, 0]);
    }
}
