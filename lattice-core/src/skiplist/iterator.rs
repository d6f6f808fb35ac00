use std::ptr;

use crossbeam_epoch::{self as epoch, Guard};

use super::{Compare, MAX_LEVEL, Node, OrdComparator, Skiplist};
use crate::barrier::BarrierSession;

/// A weakly consistent forward iterator.
///
/// The scan observes every item present for its whole duration, may or may
/// not observe items inserted after it started, and skips logically deleted
/// nodes encountered in flight. It is positioned by [`seek_first`] or
/// [`seek`] and advanced with [`next`].
///
/// The iterator pins the epoch for its lifetime and, when the list's barrier
/// is active, holds a barrier session that is released on [`close`] or drop -
/// on every exit path.
///
/// [`seek_first`]: Iter::seek_first
/// [`seek`]: Iter::seek
/// [`next`]: Iter::next
/// [`close`]: Iter::close
pub struct Iter<'a, T, C = OrdComparator> {
    list: &'a Skiplist<T, C>,
    curr: *mut Node<T>,
    // Scratch path buffers reused across seeks.
    preds: [*mut Node<T>; MAX_LEVEL + 1],
    succs: [*mut Node<T>; MAX_LEVEL + 1],
    session: *mut BarrierSession,
    guard: Option<Guard>,
}

impl<'a, T, C: Compare<T>> Iter<'a, T, C> {
    pub(crate) fn new(list: &'a Skiplist<T, C>) -> Self {
        let guard = epoch::pin();
        let session = list.access_barrier().acquire();
        Iter {
            list,
            curr: ptr::null_mut(),
            preds: [ptr::null_mut(); MAX_LEVEL + 1],
            succs: [ptr::null_mut(); MAX_LEVEL + 1],
            session,
            guard: Some(guard),
        }
    }

    /// Position at the first item.
    pub fn seek_first(&mut self) {
        let first = unsafe { (*self.list.head).load_next(0) }.as_ptr();
        self.curr = self.skip_deleted(first);
    }

    /// Position at the first item `>= item`. Returns true on an exact match.
    pub fn seek(&mut self, item: &T) -> bool {
        let found = self.list.find_path(item, &mut self.preds, &mut self.succs);
        self.curr = self.succs[0];
        found
    }

    /// True while positioned on an item.
    pub fn valid(&self) -> bool {
        !self.curr.is_null() && self.curr != self.list.tail
    }

    /// The item at the current position.
    pub fn item(&self) -> Option<&T> {
        if self.valid() {
            Some(unsafe { (*self.curr).value() })
        } else {
            None
        }
    }

    /// Advance to the next item, skipping nodes deleted in flight.
    pub fn next(&mut self) {
        if !self.valid() {
            return;
        }
        let next = unsafe { (*self.curr).load_next(0) }.as_ptr();
        self.curr = self.skip_deleted(next);
    }

    /// Release the barrier session and epoch pin. Idempotent; also runs on
    /// drop, so abandoning the iterator on any path releases the session.
    pub fn close(&mut self) {
        if self.guard.take().is_some() {
            if !self.session.is_null() {
                self.list.access_barrier().release(self.session);
                self.session = ptr::null_mut();
            }
            self.curr = ptr::null_mut();
        }
    }

    /// Walk forward past logically deleted nodes.
    fn skip_deleted(&self, mut curr: *mut Node<T>) -> *mut Node<T> {
        unsafe {
            while curr != self.list.tail {
                let next = (*curr).load_next(0);
                if !next.is_deleted() {
                    break;
                }
                curr = next.as_ptr();
            }
        }
        curr
    }
}

impl<T, C> Drop for Iter<'_, T, C> {
    fn drop(&mut self) {
        if self.guard.take().is_some() && !self.session.is_null() {
            self.list.access_barrier().release(self.session);
        }
    }
}
