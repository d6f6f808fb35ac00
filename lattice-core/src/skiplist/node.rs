use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering as AtomicOrdering};

use super::Compare;
use crate::internal::MarkedPtr;

/// Item slot of a node.
///
/// The head and tail sentinels compare structurally: `Min` is strictly less
/// than and `Max` strictly greater than every user item, so the traversal
/// hot path never null-checks list ends and never hands a sentinel to the
/// caller's comparator.
pub(crate) enum NodeItem<T> {
    Min,
    Value(T),
    Max,
}

impl<T> NodeItem<T> {
    #[inline]
    pub(crate) fn compare_with<C: Compare<T>>(&self, comparator: &C, other: &T) -> Ordering {
        match self {
            NodeItem::Min => Ordering::Less,
            NodeItem::Value(v) => comparator.cmp(v, other),
            NodeItem::Max => Ordering::Greater,
        }
    }
}

// ============================================================================
// Node - item plus a tower of marked successor references
// ============================================================================

/// A skiplist node.
///
/// Uses the flexible array member pattern for efficient memory layout:
/// - Single allocation per node (no separate heap allocation for the tower)
/// - Successor slots are inline after the struct fields
/// - Layout: [next[0], next[1], ..., next[level]] - exactly `level + 1` slots
///
/// The item is set once at construction and never mutated; the node's level
/// is chosen at insertion time and never changes. Each successor slot stores
/// a `MarkedPtr` word: pointer plus the deleted flag for that outgoing edge.
#[repr(C)]
pub(crate) struct Node<T> {
    item: NodeItem<T>,
    level: usize,
    // Flexible array: successor references are allocated inline.
    tower: [AtomicPtr<Node<T>>; 0],
}

impl<T> Node<T> {
    /// Calculate the layout for a node of the given level (`level + 1` slots).
    fn layout(level: usize) -> Layout {
        Layout::new::<Self>()
            .extend(Layout::array::<AtomicPtr<Self>>(level + 1).unwrap())
            .unwrap()
            .0
            .pad_to_align()
    }

    /// Allocate and initialize a node. All successor slots start null.
    pub(crate) fn alloc_node(item: NodeItem<T>, level: usize) -> *mut Self {
        unsafe {
            let layout = Self::layout(level);
            let ptr = alloc(layout) as *mut Self;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }

            ptr::write(&mut (*ptr).item, item);
            ptr::write(&mut (*ptr).level, level);

            let tower_base = (*ptr).tower.as_ptr() as *mut AtomicPtr<Self>;
            for i in 0..=level {
                ptr::write(tower_base.add(i), AtomicPtr::new(ptr::null_mut()));
            }

            ptr
        }
    }

    /// Deallocate a node, dropping its item.
    ///
    /// # Safety
    /// The pointer must have been allocated by `alloc_node` and must not be
    /// reachable from any list level.
    pub(crate) unsafe fn dealloc_node(ptr: *mut Self) {
        unsafe {
            let layout = Self::layout((*ptr).level);
            ptr::drop_in_place(&mut (*ptr).item);
            dealloc(ptr as *mut u8, layout);
        }
    }

    #[inline]
    pub(crate) fn level(&self) -> usize {
        self.level
    }

    #[inline]
    pub(crate) fn item(&self) -> &NodeItem<T> {
        &self.item
    }

    /// The user item stored in this node.
    #[inline]
    pub(crate) fn value(&self) -> &T {
        match &self.item {
            NodeItem::Value(v) => v,
            _ => panic!("sentinel nodes carry no item"),
        }
    }

    /// Get the successor slot at the given level.
    ///
    /// # Safety
    /// `level` must be within this node's tower (`level <= self.level`).
    #[inline]
    unsafe fn slot(&self, level: usize) -> &AtomicPtr<Node<T>> {
        debug_assert!(level <= self.level);
        unsafe { &*self.tower.as_ptr().add(level) }
    }

    /// Load the successor reference at a level (Acquire ordering).
    #[inline]
    pub(crate) fn load_next(&self, level: usize) -> MarkedPtr<Node<T>> {
        MarkedPtr::new(unsafe { self.slot(level).load(AtomicOrdering::Acquire) })
    }

    /// Store a clean (unmarked) successor at a level (Release ordering).
    ///
    /// Only valid while the node is not yet reachable at this level.
    #[inline]
    pub(crate) fn store_next(&self, level: usize, ptr: *mut Node<T>) {
        unsafe { self.slot(level).store(ptr, AtomicOrdering::Release) }
    }

    /// CAS the raw successor word at a level.
    ///
    /// Expected and new carry their mark bits, so this atomically swaps the
    /// whole (pointer, deleted) pair.
    #[inline]
    pub(crate) fn cas_next(
        &self,
        level: usize,
        expected: *mut Node<T>,
        new: *mut Node<T>,
    ) -> Result<*mut Node<T>, *mut Node<T>> {
        unsafe {
            self.slot(level).compare_exchange(
                expected,
                new,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
        }
    }
}
