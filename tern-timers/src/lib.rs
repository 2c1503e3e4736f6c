//! Timer scheduling core for the tern event loop.
//!
//! Deadline-based callback registration (`set_timeout`, `set_interval`,
//! `set_immediate`, and the lower-level `enroll`/`active`/`unenroll`
//! protocol) with FIFO ordering per duration, O(1) scheduling and
//! cancellation, and ref/unref process-liveness accounting.
//!
//! Timers sharing a duration share one native handle: every armed duration
//! owns a *bucket* holding an activation-ordered intrusive list, so tens of
//! thousands of 30-second timeouts cost a single native timer. The bucket's
//! handle is always armed for the head item, re-armed when a fire finds the
//! head not yet due, and closed the moment the list empties.
//!
//! # Example
//!
//! ```
//! use tern_driver::{Driver, ManualClock};
//! use tern_timers::Scheduler;
//!
//! let clock = ManualClock::new();
//! let driver = Driver::new(clock.clone());
//! let sched = Scheduler::new(driver.clone());
//!
//! sched.set_timeout(|| {
//!     println!("ding");
//!     Ok(())
//! }, 100.0);
//!
//! clock.advance(100);
//! driver.run_due().unwrap();
//! ```
//!
//! All state is single-threaded; callbacks run on the thread that drives the
//! [`Driver`]. A callback may freely schedule or cancel other timers,
//! including its own siblings: a cancelled sibling is either still in the
//! bucket list (and removed at once) or already dequeued (and skipped by the
//! null-callback check in the drain).

#![warn(
    elided_lifetimes_in_paths,
    missing_debug_implementations,
    missing_docs,
    unsafe_op_in_unsafe_fn
)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use slotmap::{Key, SlotMap};
use tern_driver::Driver;

mod dispatch;
mod domain;
mod error;
mod handle;
mod immediates;
mod list;
mod state;

pub use domain::Domain;
pub use error::{CallbackError, EnrollError};
pub use handle::{Immediate, TimerRef, Timeout};

use state::{ImmediateItem, SchedulerInner};

/// The largest representable timer duration in milliseconds (`2^31 - 1`).
///
/// The public API coerces anything outside `[1, TIMEOUT_MAX]` to 1 ms;
/// [`Scheduler::enroll`] clamps larger finite values to this instead.
pub const TIMEOUT_MAX: u64 = 2_147_483_647;

/// The timer scheduler: owns the duration buckets, the immediate queue, and
/// the deferred (next-tick) queue for one event loop.
///
/// Cloning is cheap; clones share state. Construct one per event loop and
/// thread it through explicitly; there is no global scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("timers", &self.live_timer_count())
            .field("refed_buckets", &self.refed_bucket_count())
            .field("unrefed_buckets", &self.unrefed_bucket_count())
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler over the given driver.
    pub fn new(driver: Driver) -> Self {
        let inner = Rc::new(SchedulerInner {
            driver,
            timers: RefCell::new(SlotMap::with_key()),
            refed_buckets: RefCell::new(HashMap::new()),
            unrefed_buckets: RefCell::new(HashMap::new()),
            immediates: RefCell::new(SlotMap::with_key()),
            immediate_queue: Cell::new(Key::null()),
            need_immediate: Cell::new(false),
            next_tick: RefCell::new(VecDeque::new()),
            current_domain: RefCell::new(None),
        });
        let queue = inner
            .immediates
            .borrow_mut()
            .insert_with_key(ImmediateItem::sentinel);
        inner.immediate_queue.set(queue);
        Self { inner }
    }

    /// The driver this scheduler arms its native handles on.
    pub fn driver(&self) -> &Driver {
        &self.inner.driver
    }

    /// Schedules `callback` to run once, `after_ms` milliseconds from now.
    ///
    /// Durations outside `[1, TIMEOUT_MAX]` (including NaN and 0) are
    /// coerced to 1 ms. Timers of equal duration fire in scheduling order.
    pub fn set_timeout(
        &self,
        callback: impl FnMut() -> Result<(), CallbackError> + 'static,
        after_ms: f64,
    ) -> Timeout {
        let key = self.inner.new_api_timer(Box::new(callback), after_ms, false);
        self.inner.insert(key, false);
        Timeout {
            key,
            sched: Rc::downgrade(&self.inner),
        }
    }

    /// Schedules `callback` to run every `every_ms` milliseconds.
    ///
    /// The period is re-armed from each fire, not from callback completion,
    /// so a slow callback does not accumulate drift. Coercion rules match
    /// [`set_timeout`](Scheduler::set_timeout).
    pub fn set_interval(
        &self,
        callback: impl FnMut() -> Result<(), CallbackError> + 'static,
        every_ms: f64,
    ) -> Timeout {
        let key = self.inner.new_api_timer(Box::new(callback), every_ms, true);
        self.inner.insert(key, false);
        Timeout {
            key,
            sched: Rc::downgrade(&self.inner),
        }
    }

    /// Cancels a timeout. A no-op on fired, cleared, or foreign timers.
    pub fn clear_timeout(&self, timer: &Timeout) {
        timer.close();
    }

    /// Cancels an interval: stops the repetition, then cancels like
    /// [`clear_timeout`](Scheduler::clear_timeout). A no-op on one-shots.
    pub fn clear_interval(&self, timer: &Timeout) {
        if let Some(sched) = timer.sched.upgrade() {
            sched.clear_interval_key(timer.key);
        }
    }

    /// Schedules `callback` to run on the next event-loop turn, ahead of any
    /// timer.
    pub fn set_immediate(
        &self,
        callback: impl FnOnce() -> Result<(), CallbackError> + 'static,
    ) -> Immediate {
        let key = self.inner.set_immediate(Box::new(callback));
        Immediate {
            key,
            sched: Rc::downgrade(&self.inner),
        }
    }

    /// Cancels an immediate. A no-op once it has run.
    pub fn clear_immediate(&self, immediate: &Immediate) {
        if let Some(sched) = immediate.sched.upgrade() {
            sched.clear_immediate(immediate.key);
        }
    }

    /// Whether the host must call [`run_immediates`](Scheduler::run_immediates)
    /// this turn.
    pub fn needs_immediate(&self) -> bool {
        self.inner.need_immediate.get()
    }

    /// Drains the immediate queue. The host calls this at most once per
    /// event-loop turn; immediates scheduled during the drain wait for the
    /// next one.
    pub fn run_immediates(&self) -> Result<(), CallbackError> {
        self.inner.run_immediates()
    }

    /// Runs deferred work scheduled by failing drains. The host calls this
    /// at the top of every turn.
    pub fn run_next_tick(&self) -> Result<(), CallbackError> {
        self.inner.run_next_tick()
    }

    /// Whether any deferred work is queued.
    pub fn has_pending_next_tick(&self) -> bool {
        !self.inner.next_tick.borrow().is_empty()
    }

    /// Installs the domain captured by subsequently scheduled timers and
    /// immediates. The scheduler only routes through domains; it never
    /// creates them.
    pub fn set_domain(&self, domain: Option<Rc<dyn Domain>>) {
        *self.inner.current_domain.borrow_mut() = domain;
    }

    /// Adopts a bare item for the low-level protocol. The item is inactive
    /// until [`enroll`](Scheduler::enroll)ed and [`active`](Scheduler::active)d.
    pub fn adopt(&self, callback: impl FnMut() -> Result<(), CallbackError> + 'static) -> TimerRef {
        let key = self.inner.adopt(Box::new(callback));
        TimerRef {
            key,
            sched: Rc::downgrade(&self.inner),
        }
    }

    /// Sets the item's arming duration without scheduling it.
    ///
    /// Detaches the item from any list first. Rejects non-finite and negative
    /// durations; clamps anything above [`TIMEOUT_MAX`] down to it.
    pub fn enroll(&self, item: &TimerRef, msecs: f64) -> Result<(), EnrollError> {
        self.inner.enroll(item.key, msecs)
    }

    /// Activates the item: stamps its start time and appends it to the refed
    /// bucket for its duration. Silently does nothing while unenrolled.
    pub fn active(&self, item: &TimerRef) {
        self.inner.insert(item.key, false);
    }

    /// Like [`active`](Scheduler::active), but the backing bucket does not
    /// keep the process alive.
    pub fn unref_active(&self, item: &TimerRef) {
        self.inner.insert(item.key, true);
    }

    /// Deactivates the item until it is re-enrolled. Collapses the refed
    /// bucket for its duration if the item was its last occupant.
    pub fn unenroll(&self, item: &TimerRef) {
        self.inner.unenroll(item.key);
    }

    /// Number of refed duration buckets currently armed.
    pub fn refed_bucket_count(&self) -> usize {
        self.inner.refed_buckets.borrow().len()
    }

    /// Number of unrefed duration buckets currently armed.
    pub fn unrefed_bucket_count(&self) -> usize {
        self.inner.unrefed_buckets.borrow().len()
    }

    /// Number of timer items alive in the scheduler, buckets excluded.
    pub fn live_timer_count(&self) -> usize {
        self.inner.live_timer_count()
    }
}
