use std::cmp::Ordering;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, AtomicU64, Ordering as AtomicOrdering};

use crossbeam_epoch as epoch;

use crate::skiplist::{Compare, Skiplist};

// =============================================================================
// Access barrier: session-ordered safe memory reclamation.
//
// Even after a node is fully unlinked, readers that entered the structure
// before the unlink may still hold references into it. The barrier groups all
// live readers into the current *session*; each reader increments the
// session's live count on entry and decrements it on exit. When a removal (or
// batch of removals) completes, the caller closes the session: the current
// session reference is swapped for a fresh one and the closed session keeps
// counting down its remaining readers.
//
// Closing races with readers still entering through the stale reference. The
// close adds a large offset to the live count; an acquirer whose increment
// lands above the offset knows the session closed under it, steps back out
// and enters the replacement. Whoever decrements the count down to exactly
// the offset is the last reader out and takes responsibility for the
// session's destruction.
//
// Several closed sessions may be draining at once, and a reader from an older
// session can still reach objects removed during a newer one. Sessions are
// therefore queued by seqno and destructed strictly in order: session S runs
// its destructor only after every session older than S has.
//
// The queue is itself a skiplist, instantiated with its barrier inactive to
// break the recursion.
// =============================================================================

/// Bias added to a session's live count when it closes. Any acquirer that
/// observes a count above this backs off and retries on the new session.
pub const BARRIER_FLUSH_OFFSET: i32 = 1 << 30;

/// Destructor invoked for each drained session's payload.
pub type SessionDestructor = Box<dyn Fn(*mut ()) + Send + Sync>;

/// A cohort of readers tracked together.
///
/// Handles returned by [`AccessBarrier::acquire`] point at the barrier's
/// current session; the session stays alive at least until its last reader
/// releases.
pub struct BarrierSession {
    live_count: AtomicI32,
    object_ref: AtomicPtr<()>,
    seqno: AtomicU64,
    closed: AtomicI32,
}

impl BarrierSession {
    fn alloc() -> *mut BarrierSession {
        Box::into_raw(Box::new(BarrierSession {
            live_count: AtomicI32::new(0),
            object_ref: AtomicPtr::new(ptr::null_mut()),
            seqno: AtomicU64::new(0),
            closed: AtomicI32::new(0),
        }))
    }

    /// Current reader count; above [`BARRIER_FLUSH_OFFSET`] once closed.
    pub fn live_count(&self) -> i32 {
        self.live_count.load(AtomicOrdering::Acquire)
    }

    /// Ordinal assigned when the session was flushed; 0 while open.
    pub fn seqno(&self) -> u64 {
        self.seqno.load(AtomicOrdering::Acquire)
    }
}

/// Queue item: sessions are ordered by their flush seqno.
#[derive(Clone, Copy)]
pub(crate) struct SessionRef(pub(crate) *mut BarrierSession);

unsafe impl Send for SessionRef {}

pub(crate) struct SessionSeqnoCompare;

impl Compare<SessionRef> for SessionSeqnoCompare {
    fn cmp(&self, a: &SessionRef, b: &SessionRef) -> Ordering {
        let sa = unsafe { (*a.0).seqno.load(AtomicOrdering::Acquire) };
        let sb = unsafe { (*b.0).seqno.load(AtomicOrdering::Acquire) };
        sa.cmp(&sb)
    }
}

/// Counters for an access barrier.
#[derive(Clone, Copy, Debug)]
pub struct BarrierStats {
    pub allocated_sessions: i64,
    pub freed_sessions: i64,
    pub pending_in_freeq: u64,
    pub free_seqno: u64,
}

/// The SMR gate in front of a concurrent structure.
///
/// Inactive barriers turn every operation into a no-op and
/// [`acquire`](AccessBarrier::acquire) returns null, so callers can keep a
/// single code path.
pub struct AccessBarrier {
    active: bool,
    session: AtomicPtr<BarrierSession>,
    destructor: Option<SessionDestructor>,

    freeq: Option<Box<Skiplist<SessionRef, SessionSeqnoCompare>>>,
    free_seqno: AtomicU64,
    destructor_running: AtomicI32,

    num_allocated: AtomicI64,
    num_freed: AtomicI64,

    // Serializes flushes; the guarded value is the active seqno. Never held
    // across a destructor call or a release.
    flush_lock: Mutex<u64>,
}

impl AccessBarrier {
    pub fn new(active: bool, destructor: Option<SessionDestructor>) -> Self {
        AccessBarrier {
            active,
            session: AtomicPtr::new(BarrierSession::alloc()),
            destructor,
            freeq: active.then(|| Box::new(Skiplist::with_comparator(SessionSeqnoCompare))),
            free_seqno: AtomicU64::new(0),
            destructor_running: AtomicI32::new(0),
            num_allocated: AtomicI64::new(1),
            num_freed: AtomicI64::new(0),
            flush_lock: Mutex::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Enter the current session. Returns null when the barrier is inactive.
    ///
    /// The returned handle must be released exactly once, on every exit path.
    pub fn acquire(&self) -> *mut BarrierSession {
        if !self.active {
            return ptr::null_mut();
        }

        // Pinned so a laggard increment cannot land on a session the drain
        // already handed to the collector.
        let _guard = epoch::pin();
        loop {
            let bs = self.session.load(AtomicOrdering::Acquire);
            let live = unsafe { (*bs).live_count.fetch_add(1, AtomicOrdering::AcqRel) } + 1;
            if live > BARRIER_FLUSH_OFFSET {
                // The session closed between the load and our increment; step
                // back out and enter the replacement.
                self.release(bs);
                continue;
            }
            return bs;
        }
    }

    /// Leave a session previously entered through [`acquire`].
    ///
    /// The last reader out of a closed session queues it for destruction and
    /// drains the queue.
    ///
    /// # Panics
    ///
    /// Panics on a double release or a mis-paired handle: once the count goes
    /// negative or eats into the flush offset, memory safety is already lost
    /// and recovery is impossible.
    ///
    /// [`acquire`]: AccessBarrier::acquire
    pub fn release(&self, bs: *mut BarrierSession) {
        if !self.active {
            return;
        }

        let live = unsafe { (*bs).live_count.fetch_sub(1, AtomicOrdering::AcqRel) } - 1;
        if live == BARRIER_FLUSH_OFFSET {
            // Readers that entered a closed session step down automatically,
            // but they may race us to close it for good.
            if unsafe {
                (*bs)
                    .closed
                    .compare_exchange(0, 1, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            }
            .is_ok()
            {
                if let Some(freeq) = &self.freeq {
                    freeq.insert(SessionRef(bs));
                }
                if self
                    .destructor_running
                    .compare_exchange(0, 1, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                    .is_ok()
                {
                    self.do_cleanup();
                    let _ = self.destructor_running.compare_exchange(
                        1,
                        0,
                        AtomicOrdering::AcqRel,
                        AtomicOrdering::Acquire,
                    );
                }
            }
        } else if live < 0 || live == BARRIER_FLUSH_OFFSET - 1 {
            panic!("unsafe memory reclamation: mis-paired barrier session release");
        }
    }

    /// Close the current session, associate it with `object_ref`, and open a
    /// fresh session.
    ///
    /// The payload's destructor runs once every reader of this session and of
    /// all earlier sessions has left.
    pub fn flush_session(&self, object_ref: *mut ()) {
        if !self.active {
            return;
        }

        let old;
        {
            let mut active_seqno = self.flush_lock.lock().unwrap();

            old = self.session.load(AtomicOrdering::Acquire);
            let fresh = BarrierSession::alloc();
            let _ = self.session.compare_exchange(
                old,
                fresh,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            );
            self.num_allocated.fetch_add(1, AtomicOrdering::Relaxed);

            *active_seqno += 1;
            unsafe {
                (*old).object_ref.store(object_ref, AtomicOrdering::Release);
                (*old).seqno.store(*active_seqno, AtomicOrdering::Release);
                // Drive in-flight acquires to back off; the +1 is our own
                // synthetic reader, released below outside the lock.
                (*old)
                    .live_count
                    .fetch_add(BARRIER_FLUSH_OFFSET + 1, AtomicOrdering::AcqRel);
            }
        }

        self.release(old);
    }

    /// Drain the queue in seqno order, stopping at the first gap.
    ///
    /// Runs under the `destructor_running` flag, so each session's destructor
    /// runs exactly once and only after every earlier session's.
    fn do_cleanup(&self) {
        let Some(freeq) = &self.freeq else {
            return;
        };

        let mut iter = freeq.iter();
        iter.seek_first();
        while iter.valid() {
            let Some(&SessionRef(bs)) = iter.item() else {
                return;
            };
            let seqno = unsafe { (*bs).seqno.load(AtomicOrdering::Acquire) };
            if seqno != self.free_seqno.load(AtomicOrdering::Acquire) + 1 {
                // An earlier session is still draining.
                return;
            }

            self.free_seqno.store(seqno, AtomicOrdering::Release);
            let obj = unsafe { (*bs).object_ref.load(AtomicOrdering::Acquire) };
            if let Some(callb) = &self.destructor {
                callb(obj);
            }
            freeq.delete(&SessionRef(bs));
            self.num_freed.fetch_add(1, AtomicOrdering::Relaxed);

            // A laggard acquirer may still hold a raw reference to this
            // session; hand it to the collector instead of freeing in place.
            let guard = epoch::pin();
            unsafe { guard.defer_unchecked(move || drop(Box::from_raw(bs))) };

            iter.next();
        }
    }

    pub fn stats(&self) -> BarrierStats {
        BarrierStats {
            allocated_sessions: self.num_allocated.load(AtomicOrdering::Relaxed),
            freed_sessions: self.num_freed.load(AtomicOrdering::Relaxed),
            pending_in_freeq: self
                .freeq
                .as_ref()
                .map_or(0, |freeq| freeq.stats().node_count),
            free_seqno: self.free_seqno.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Drop for AccessBarrier {
    fn drop(&mut self) {
        // Exclusive access: whatever closed sessions remain drain now, in
        // seqno order since the queue is seqno-ordered.
        if let Some(freeq) = &self.freeq {
            let mut iter = freeq.iter();
            iter.seek_first();
            while iter.valid() {
                if let Some(&SessionRef(bs)) = iter.item() {
                    unsafe {
                        let obj = (*bs).object_ref.load(AtomicOrdering::Acquire);
                        if let Some(callb) = &self.destructor {
                            callb(obj);
                        }
                        drop(Box::from_raw(bs));
                    }
                }
                iter.next();
            }
        }

        // The open session never carried a payload.
        let current = *self.session.get_mut();
        if !current.is_null() {
            unsafe { drop(Box::from_raw(current)) };
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
