//! Scheduler state: the timer arena, the duration-bucket registries, and the
//! enroll/active/unenroll lifecycle.
//!
//! A *bucket* pairs one native timer handle with the list of every armed
//! timer sharing a duration, so ten thousand `set_timeout(_, 100)` calls cost
//! one handle. The list is kept in activation order; the head therefore has
//! the earliest deadline and the handle is always armed for it.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use slotmap::{SlotMap, new_key_type};
use tern_driver::{Driver, TimerHandle};

use crate::TIMEOUT_MAX;
use crate::domain::Domain;
use crate::error::{CallbackError, EnrollError};
use crate::list::{self, Linked, Links};

new_key_type! {
    pub(crate) struct TimerKey;
    pub(crate) struct ImmediateKey;
}

pub(crate) type TimerCallback = Box<dyn FnMut() -> Result<(), CallbackError>>;
pub(crate) type NextTickFn = Box<dyn FnOnce() -> Result<(), CallbackError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemKind {
    /// Built by `set_timeout`/`set_interval`; `clear_timeout` closes it.
    Api,
    /// Adopted through the `enroll` protocol; `clear` unenrolls, the embedder
    /// owns reclamation.
    Enrolled,
    /// A bucket or queue anchor, never scheduled.
    Sentinel,
}

pub(crate) struct TimerItem {
    /// Arming duration in ms; `-1` means inactive until re-enrolled.
    pub idle_timeout: i64,
    /// When the item was last activated, in clock ms.
    pub idle_start: Option<u64>,
    /// The user callback; `None` once fired-and-done or cancelled.
    pub callback: Option<TimerCallback>,
    /// Re-arm period for intervals.
    pub repeat: Option<u64>,
    /// Has fired at least once.
    pub called: bool,
    pub links: Links<TimerKey>,
    /// Private native handle, only for items migrated off a shared bucket by
    /// `unref`.
    pub handle: Option<TimerHandle>,
    /// Error-isolation context captured at scheduling time.
    pub domain: Option<Rc<dyn Domain>>,
    pub kind: ItemKind,
}

impl TimerItem {
    pub(crate) fn sentinel(key: TimerKey) -> Self {
        Self {
            idle_timeout: -1,
            idle_start: None,
            callback: None,
            repeat: None,
            called: false,
            links: Links::detached(key),
            handle: None,
            domain: None,
            kind: ItemKind::Sentinel,
        }
    }
}

impl Linked<TimerKey> for TimerItem {
    fn links(&self) -> &Links<TimerKey> {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links<TimerKey> {
        &mut self.links
    }
}

pub(crate) struct ImmediateItem {
    pub callback: Option<Box<dyn FnOnce() -> Result<(), CallbackError>>>,
    pub domain: Option<Rc<dyn Domain>>,
    pub links: Links<ImmediateKey>,
}

impl ImmediateItem {
    pub(crate) fn sentinel(key: ImmediateKey) -> Self {
        Self {
            callback: None,
            domain: None,
            links: Links::detached(key),
        }
    }
}

impl Linked<ImmediateKey> for ImmediateItem {
    fn links(&self) -> &Links<ImmediateKey> {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links<ImmediateKey> {
        &mut self.links
    }
}

/// One native handle plus the activation-ordered list of items sharing a
/// duration.
pub(crate) struct Bucket {
    pub msecs: u64,
    pub handle: TimerHandle,
    pub sentinel: TimerKey,
    pub unrefed: bool,
}

pub(crate) struct SchedulerInner {
    pub driver: Driver,
    pub timers: RefCell<SlotMap<TimerKey, TimerItem>>,
    pub refed_buckets: RefCell<HashMap<u64, Bucket>>,
    pub unrefed_buckets: RefCell<HashMap<u64, Bucket>>,
    pub immediates: RefCell<SlotMap<ImmediateKey, ImmediateItem>>,
    /// Sentinel of the live immediate queue. Swapped for a fresh one at the
    /// start of each drain.
    pub immediate_queue: Cell<ImmediateKey>,
    pub need_immediate: Cell<bool>,
    /// Deferred work the host runs at the top of the next turn.
    pub next_tick: RefCell<VecDeque<NextTickFn>>,
    pub current_domain: RefCell<Option<Rc<dyn Domain>>>,
}

/// Clamps a public-API duration: anything outside `[1, TIMEOUT_MAX]`,
/// including NaN, becomes 1 ms.
pub(crate) fn coerce_after(after: f64) -> i64 {
    if after >= 1.0 && after <= TIMEOUT_MAX as f64 {
        after as i64
    } else {
        1
    }
}

impl SchedulerInner {
    pub(crate) fn registry(&self, unrefed: bool) -> &RefCell<HashMap<u64, Bucket>> {
        if unrefed {
            &self.unrefed_buckets
        } else {
            &self.refed_buckets
        }
    }

    pub(crate) fn new_api_timer(
        &self,
        callback: TimerCallback,
        after: f64,
        repeating: bool,
    ) -> TimerKey {
        let after = coerce_after(after);
        let domain = self.current_domain.borrow().clone();
        self.timers.borrow_mut().insert_with_key(|key| TimerItem {
            idle_timeout: after,
            idle_start: None,
            callback: Some(callback),
            repeat: repeating.then_some(after as u64),
            called: false,
            links: Links::detached(key),
            handle: None,
            domain,
            kind: ItemKind::Api,
        })
    }

    pub(crate) fn adopt(&self, callback: TimerCallback) -> TimerKey {
        let domain = self.current_domain.borrow().clone();
        self.timers.borrow_mut().insert_with_key(|key| TimerItem {
            idle_timeout: -1,
            idle_start: None,
            callback: Some(callback),
            repeat: None,
            called: false,
            links: Links::detached(key),
            handle: None,
            domain,
            kind: ItemKind::Enrolled,
        })
    }

    /// Stamps the activation time and appends the item to the bucket for its
    /// duration, creating the bucket (and arming its handle) if this is the
    /// first item. A negative `idle_timeout` makes this a no-op: cancelled
    /// items fail safe.
    pub(crate) fn insert(self: &Rc<Self>, key: TimerKey, unrefed: bool) {
        let msecs = match self.timers.borrow().get(key) {
            Some(item) if item.idle_timeout >= 0 => item.idle_timeout as u64,
            _ => return,
        };
        let now = self.driver.now_ms();
        let registry = self.registry(unrefed);
        let sentinel = registry.borrow().get(&msecs).map(|bucket| bucket.sentinel);
        let sentinel = match sentinel {
            Some(sentinel) => sentinel,
            None => {
                let bucket = self.new_bucket(msecs, unrefed);
                let sentinel = bucket.sentinel;
                registry.borrow_mut().insert(msecs, bucket);
                sentinel
            }
        };
        {
            let mut timers = self.timers.borrow_mut();
            timers[key].idle_start = Some(now);
            list::append(&mut timers, sentinel, key);
        }
        // A bucket whose drain was abandoned (disposed domain) sits with an
        // unarmed handle; the activation that touches it next re-arms it for
        // the head item's remaining delay. The head may be an overdue
        // survivor, in which case the delay clamps to zero and the next pass
        // sweeps it.
        let registry = self.registry(unrefed).borrow();
        if let Some(bucket) = registry.get(&msecs) {
            if !bucket.handle.is_armed() {
                let timers = self.timers.borrow();
                let head_start = list::peek(&timers, bucket.sentinel)
                    .and_then(|head| timers[head].idle_start)
                    .unwrap_or(now);
                bucket.handle.arm((head_start + msecs).saturating_sub(now));
            }
        }
    }

    fn new_bucket(self: &Rc<Self>, msecs: u64, unrefed: bool) -> Bucket {
        let sentinel = self
            .timers
            .borrow_mut()
            .insert_with_key(TimerItem::sentinel);
        let handle = TimerHandle::new(&self.driver);
        if unrefed {
            handle.unref();
        }
        let sched = Rc::downgrade(self);
        handle.set_callback(move || match sched.upgrade() {
            Some(sched) => sched.on_fire(msecs, unrefed).map_err(Into::into),
            None => Ok(()),
        });
        handle.arm(msecs);
        log::debug!(
            "created {msecs}ms {} bucket",
            if unrefed { "unrefed" } else { "refed" }
        );
        Bucket {
            msecs,
            handle,
            sentinel,
            unrefed,
        }
    }

    /// Closes the bucket's handle and drops it from its registry. Only called
    /// once the bucket's list is empty.
    pub(crate) fn collapse_bucket(&self, msecs: u64, unrefed: bool) {
        let Some(bucket) = self.registry(unrefed).borrow_mut().remove(&msecs) else {
            return;
        };
        self.timers.borrow_mut().remove(bucket.sentinel);
        log::debug!(
            "collapsed {}ms {} bucket",
            bucket.msecs,
            if bucket.unrefed { "unrefed" } else { "refed" }
        );
        drop(bucket);
    }

    /// The strict low-level arming-duration setter. Detaches the item from
    /// any list first; does not arm anything.
    pub(crate) fn enroll(&self, key: TimerKey, msecs: f64) -> Result<(), EnrollError> {
        if !msecs.is_finite() {
            return Err(EnrollError::NotFinite(msecs));
        }
        if msecs < 0.0 {
            return Err(EnrollError::Negative(msecs));
        }
        let msecs = if msecs > TIMEOUT_MAX as f64 {
            TIMEOUT_MAX
        } else {
            msecs as u64
        };
        if self.timers.borrow().get(key).is_none() {
            return Ok(());
        }
        if list::is_linked(&self.timers.borrow(), key) {
            self.unenroll(key);
        }
        let mut timers = self.timers.borrow_mut();
        timers[key].idle_timeout = msecs as i64;
        list::init(&mut timers, key);
        Ok(())
    }

    /// Detaches the item and marks it inactive. If this empties a refed
    /// bucket of the same duration, the bucket is collapsed at once; unrefed
    /// buckets are left for the dispatch loop to collapse.
    pub(crate) fn unenroll(&self, key: TimerKey) {
        let msecs = {
            let mut timers = self.timers.borrow_mut();
            let Some(item) = timers.get(key) else {
                return;
            };
            let msecs = item.idle_timeout;
            if list::is_linked(&timers, key) {
                list::remove(&mut timers, key);
            }
            msecs
        };
        if msecs >= 0 {
            let msecs = msecs as u64;
            let now_empty = self
                .refed_buckets
                .borrow()
                .get(&msecs)
                .is_some_and(|bucket| list::is_empty(&self.timers.borrow(), bucket.sentinel));
            if now_empty {
                self.collapse_bucket(msecs, false);
            }
        }
        self.timers.borrow_mut()[key].idle_timeout = -1;
    }

    /// Frees the arena slot once the item can never fire again: callback
    /// gone, no private handle, not in any list.
    pub(crate) fn reclaim_if_garbage(&self, key: TimerKey) {
        let mut timers = self.timers.borrow_mut();
        if let Some(item) = timers.get(key) {
            if item.callback.is_none() && item.handle.is_none() && !list::is_linked(&timers, key) {
                timers.remove(key);
            }
        }
    }

    /// `Timeout::ref_`: only meaningful for items that were migrated to a
    /// private handle; shared buckets are refed already.
    pub(crate) fn ref_timeout(&self, key: TimerKey) {
        let timers = self.timers.borrow();
        if let Some(item) = timers.get(key) {
            if let Some(handle) = &item.handle {
                handle.ref_();
            }
        }
    }

    /// `Timeout::unref`: migrates the item out of its shared refed bucket
    /// onto a private unrefed handle armed for the remaining delay.
    ///
    /// Reuses the bucket's native handle when removing this item empties the
    /// bucket, sparing a spurious event-loop turn. An already-fired one-shot
    /// is simply unenrolled; a later `ref_` finds no handle and is a no-op.
    pub(crate) fn unref_timeout(self: &Rc<Self>, key: TimerKey) {
        let (idle_start, idle_timeout, called, repeating) = {
            let timers = self.timers.borrow();
            let Some(item) = timers.get(key) else {
                return;
            };
            if let Some(handle) = &item.handle {
                handle.unref();
                return;
            }
            // The callback slot may be empty right now because the item's own
            // callback is executing (dispatch holds it); the item is still live.
            (
                item.idle_start,
                item.idle_timeout.max(0) as u64,
                item.called,
                item.repeat.is_some(),
            )
        };
        let now = self.driver.now_ms();
        let idle_start = match idle_start {
            Some(start) => start,
            None => {
                self.timers.borrow_mut()[key].idle_start = Some(now);
                now
            }
        };
        let delay = (idle_start + idle_timeout).saturating_sub(now);
        // A one-shot that already ran must not run again just because it was
        // unrefed from inside its own callback.
        if called && !repeating {
            self.unenroll(key);
            return;
        }
        let handle = match self.reuse(key) {
            Some(handle) => handle,
            None => TimerHandle::new(&self.driver),
        };
        let sched = Rc::downgrade(self);
        handle.set_callback(move || match sched.upgrade() {
            Some(sched) => sched.on_private_fire(key).map_err(Into::into),
            None => Ok(()),
        });
        handle.arm(delay);
        handle.unref();
        self.timers.borrow_mut()[key].handle = Some(handle);
    }

    /// Detaches the item; if that empties the refed bucket for its duration,
    /// deregisters the bucket and hands back its stopped native handle for
    /// reuse.
    fn reuse(&self, key: TimerKey) -> Option<TimerHandle> {
        let msecs = {
            let mut timers = self.timers.borrow_mut();
            let item = timers.get(key)?;
            let msecs = item.idle_timeout;
            if list::is_linked(&timers, key) {
                list::remove(&mut timers, key);
            }
            msecs
        };
        if msecs < 0 {
            return None;
        }
        let msecs = msecs as u64;
        let now_empty = self
            .refed_buckets
            .borrow()
            .get(&msecs)
            .is_some_and(|bucket| list::is_empty(&self.timers.borrow(), bucket.sentinel));
        if !now_empty {
            return None;
        }
        let bucket = self.refed_buckets.borrow_mut().remove(&msecs)?;
        bucket.handle.stop();
        self.timers.borrow_mut().remove(bucket.sentinel);
        Some(bucket.handle)
    }

    /// `clear_interval`: stops the repetition first, then closes. Does
    /// nothing unless the item actually repeats.
    pub(crate) fn clear_interval_key(&self, key: TimerKey) {
        {
            let mut timers = self.timers.borrow_mut();
            let Some(item) = timers.get_mut(key) else {
                return;
            };
            if item.repeat.take().is_none() {
                return;
            }
        }
        self.close_timeout(key);
    }

    /// `Timeout::close`: nulls the callback, then either closes the private
    /// handle or unenrolls from the shared bucket, and reclaims the slot.
    pub(crate) fn close_timeout(&self, key: TimerKey) {
        let handle = {
            let mut timers = self.timers.borrow_mut();
            let Some(item) = timers.get_mut(key) else {
                return;
            };
            item.callback = None;
            item.handle.take()
        };
        match handle {
            Some(handle) => drop(handle),
            None => self.unenroll(key),
        }
        self.reclaim_if_garbage(key);
    }

    /// Number of timer items excluding bucket sentinels.
    pub(crate) fn live_timer_count(&self) -> usize {
        self.timers.borrow().len()
            - self.refed_buckets.borrow().len()
            - self.unrefed_buckets.borrow().len()
    }
}
