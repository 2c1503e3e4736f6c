//! Public handles to scheduled work.
//!
//! Handles hold a generational key plus a weak back-reference to the
//! scheduler, so a stale handle (fired, cleared, or outliving the scheduler)
//! degrades every operation to a no-op instead of touching someone else's
//! slot. Dropping a handle does not cancel anything.

use std::fmt;
use std::rc::Weak;

use crate::state::{ImmediateKey, SchedulerInner, TimerKey};

/// A timer created by [`Scheduler::set_timeout`](crate::Scheduler::set_timeout)
/// or [`Scheduler::set_interval`](crate::Scheduler::set_interval).
pub struct Timeout {
    pub(crate) key: TimerKey,
    pub(crate) sched: Weak<SchedulerInner>,
}

impl Timeout {
    /// Makes the timer keep the process alive again after [`unref`](Timeout::unref).
    ///
    /// Only meaningful for a timer that holds a private native handle; timers
    /// in shared buckets are refed already. A no-op on fired or cleared
    /// timers.
    pub fn ref_(&self) {
        if let Some(sched) = self.sched.upgrade() {
            sched.ref_timeout(self.key);
        }
    }

    /// Stops the timer from keeping the process alive.
    ///
    /// Shared bucket handles cannot be ref-counted per item, so the timer is
    /// migrated onto a private unrefed native handle armed for its remaining
    /// delay. An already-fired one-shot is unenrolled instead.
    pub fn unref(&self) {
        if let Some(sched) = self.sched.upgrade() {
            sched.unref_timeout(self.key);
        }
    }

    /// Cancels the timer and releases its resources. Idempotent.
    pub fn close(&self) {
        if let Some(sched) = self.sched.upgrade() {
            sched.close_timeout(self.key);
        }
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout").field("key", &self.key).finish()
    }
}

/// An item adopted through the low-level
/// [`enroll`](crate::Scheduler::enroll)/[`active`](crate::Scheduler::active)
/// protocol.
pub struct TimerRef {
    pub(crate) key: TimerKey,
    pub(crate) sched: Weak<SchedulerInner>,
}

impl TimerRef {
    /// Cancels the item and frees its slot. After this, every operation on
    /// clones of the underlying key is a no-op.
    pub fn release(self) {
        if let Some(sched) = self.sched.upgrade() {
            sched.unenroll(self.key);
            sched.timers.borrow_mut().remove(self.key);
        }
    }
}

impl fmt::Debug for TimerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRef").field("key", &self.key).finish()
    }
}

/// A callback scheduled by [`Scheduler::set_immediate`](crate::Scheduler::set_immediate)
/// for the next event-loop turn.
pub struct Immediate {
    pub(crate) key: ImmediateKey,
    pub(crate) sched: Weak<SchedulerInner>,
}

impl fmt::Debug for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Immediate").field("key", &self.key).finish()
    }
}
