//! Concurrent in-memory index primitives.
//!
//! Two cooperating pieces:
//!
//! - [`skiplist`] - a lock-free ordered multiset keyed by a caller-supplied
//!   total order, with non-blocking insert/delete/contains and cooperative
//!   helping on contention.
//! - [`barrier`] - an access barrier that defers destruction of objects
//!   removed during a reader session until every reader of that session (and
//!   of all earlier sessions) has left.
//!
//! Unlinked skiplist nodes themselves are reclaimed through epoch-based
//! deferral; the barrier orders destruction of caller payloads by session.

#![allow(dead_code)]

pub mod barrier;
pub(crate) mod internal;
pub mod skiplist;

pub use barrier::{
    AccessBarrier, BARRIER_FLUSH_OFFSET, BarrierSession, BarrierStats, SessionDestructor,
};
pub use skiplist::{
    Compare, Config, Iter, LEVEL_PROBABILITY, MAX_LEVEL, OrdComparator, Skiplist, SkiplistStats,
};
