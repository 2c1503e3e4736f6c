//! Native timer handles and the monotonic clock for the tern event loop.
//!
//! This crate is the bottom of the timer stack: it knows nothing about
//! durations shared between timers, callbacks queues, or liveness policy.
//! It owns a registry of *handles*, each of which can be armed for a single
//! fire at `now + delay`, and invokes the handle's callback when
//! [`Driver::run_due`] is called at or after that deadline.
//!
//! ```
//! use tern_driver::{Driver, ManualClock, TimerHandle};
//!
//! let clock = ManualClock::new();
//! let driver = Driver::new(clock.clone());
//! let handle = TimerHandle::new(&driver);
//! handle.set_callback(|| {
//!     println!("fired");
//!     Ok(())
//! });
//! handle.arm(10);
//! clock.advance(10);
//! driver.run_due().unwrap();
//! ```

#![warn(
    elided_lifetimes_in_paths,
    missing_debug_implementations,
    missing_docs,
    unsafe_op_in_unsafe_fn
)]

use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use slotmap::{SlotMap, new_key_type};

mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

/// The result a fire callback returns to the driver.
///
/// An `Err` aborts the current [`Driver::run_due`] pass and propagates to the
/// host; handles that were also due remain armed and fire on the next pass.
pub type FireResult = Result<(), Box<dyn Error>>;

type FireFn = dyn Fn() -> FireResult;

new_key_type! {
    struct HandleKey;
}

struct HandleSlot {
    /// Absolute fire time in clock milliseconds. `None` when not armed.
    deadline: Option<u64>,
    /// Arming sequence number, for deterministic order among equal deadlines.
    seq: u64,
    /// Whether this handle contributes to process liveness.
    refed: bool,
    callback: Option<Rc<FireFn>>,
}

struct DriverInner {
    clock: Box<dyn Clock>,
    /// Loop time: the clock reading cached at the last [`Driver::update_time`].
    /// Frozen while callbacks run, so every timer decision inside one
    /// [`Driver::run_due`] pass sees the same instant.
    cached_now: Cell<u64>,
    handles: RefCell<SlotMap<HandleKey, HandleSlot>>,
    next_seq: Cell<u64>,
}

/// A single-threaded registry of native timer handles over a [`Clock`].
///
/// Cloning is cheap and clones share state. All methods must be called from
/// the thread that created the driver; there is no synchronization.
#[derive(Clone)]
pub struct Driver {
    inner: Rc<DriverInner>,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("clock", &self.inner.clock)
            .field("handles", &self.inner.handles.borrow().len())
            .finish()
    }
}

impl Driver {
    /// Creates a driver over the given clock.
    pub fn new(clock: impl Clock + 'static) -> Self {
        let cached_now = Cell::new(clock.now_ms());
        Self {
            inner: Rc::new(DriverInner {
                clock: Box::new(clock),
                cached_now,
                handles: RefCell::new(SlotMap::with_key()),
                next_seq: Cell::new(0),
            }),
        }
    }

    /// Creates a driver over a [`MonotonicClock`] starting now.
    pub fn system() -> Self {
        Self::new(MonotonicClock::new())
    }

    /// The loop time in milliseconds: the clock reading cached at the last
    /// [`update_time`](Driver::update_time) or [`run_due`](Driver::run_due).
    ///
    /// Frozen while callbacks run. An interval re-armed from inside its own
    /// callback therefore measures from the fire time, not from whenever the
    /// callback finished, and accumulates no drift.
    pub fn now_ms(&self) -> u64 {
        self.inner.cached_now.get()
    }

    /// Refreshes the loop time from the underlying clock.
    pub fn update_time(&self) {
        let fresh = self.inner.clock.now_ms();
        if fresh > self.inner.cached_now.get() {
            self.inner.cached_now.set(fresh);
        }
    }

    /// The earliest armed deadline, refed or not.
    pub fn next_deadline(&self) -> Option<u64> {
        self.inner
            .handles
            .borrow()
            .values()
            .filter_map(|slot| slot.deadline)
            .min()
    }

    /// The earliest armed deadline among refed handles.
    pub fn next_refed_deadline(&self) -> Option<u64> {
        self.inner
            .handles
            .borrow()
            .values()
            .filter(|slot| slot.refed)
            .filter_map(|slot| slot.deadline)
            .min()
    }

    /// How many handles are both armed and refed.
    ///
    /// The host loop stays alive while this is nonzero.
    pub fn armed_refed_count(&self) -> usize {
        self.inner
            .handles
            .borrow()
            .values()
            .filter(|slot| slot.refed && slot.deadline.is_some())
            .count()
    }

    /// Total number of open handles, armed or not.
    pub fn open_handle_count(&self) -> usize {
        self.inner.handles.borrow().len()
    }

    /// Fires every handle whose deadline is at or before the current clock
    /// reading, in deadline order (arming order among equals).
    ///
    /// Each handle's deadline is cleared before its callback runs, so a fire
    /// is one-shot; the callback may re-arm. Handles armed *during* the pass
    /// are not fired until the next pass, even with a delay of zero. The
    /// first callback error aborts the pass and is returned; handles that
    /// were due but not yet fired stay armed.
    pub fn run_due(&self) -> FireResult {
        self.update_time();
        let now = self.now_ms();
        let mut due: Vec<(u64, u64, HandleKey)> = self
            .inner
            .handles
            .borrow()
            .iter()
            .filter_map(|(key, slot)| {
                slot.deadline
                    .filter(|&deadline| deadline <= now)
                    .map(|deadline| (deadline, slot.seq, key))
            })
            .collect();
        due.sort_unstable();
        for (deadline, seq, key) in due {
            // An earlier callback may have stopped, re-armed, or closed this
            // handle; fire only if the snapshot still describes it.
            let callback = {
                let mut handles = self.inner.handles.borrow_mut();
                let Some(slot) = handles.get_mut(key) else {
                    continue;
                };
                if slot.deadline != Some(deadline) || slot.seq != seq {
                    continue;
                }
                slot.deadline = None;
                slot.callback.clone()
            };
            // The registry borrow is released: the callback may arm, stop,
            // or close any handle, including this one.
            if let Some(callback) = callback {
                callback()?;
            }
        }
        Ok(())
    }

    fn alloc(&self) -> HandleKey {
        self.inner.handles.borrow_mut().insert(HandleSlot {
            deadline: None,
            seq: 0,
            refed: true,
            callback: None,
        })
    }
}

/// An owned native timer handle.
///
/// Carries one callback slot and at most one pending fire. Dropping the
/// handle closes it.
pub struct TimerHandle {
    key: HandleKey,
    driver: Driver,
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.is_armed())
            .field("refed", &self.is_refed())
            .finish()
    }
}

impl TimerHandle {
    /// Opens a new handle on the driver. Unarmed, refed, no callback.
    pub fn new(driver: &Driver) -> Self {
        Self {
            key: driver.alloc(),
            driver: driver.clone(),
        }
    }

    /// Installs the fire callback, replacing any previous one.
    pub fn set_callback(&self, callback: impl Fn() -> FireResult + 'static) {
        if let Some(slot) = self.driver.inner.handles.borrow_mut().get_mut(self.key) {
            slot.callback = Some(Rc::new(callback));
        }
    }

    /// Schedules one fire at `now + delay_ms`, replacing any pending fire.
    ///
    /// A delay of zero fires on the next [`Driver::run_due`] pass, never
    /// synchronously.
    pub fn arm(&self, delay_ms: u64) {
        let now = self.driver.now_ms();
        let seq = self.driver.inner.next_seq.get();
        self.driver.inner.next_seq.set(seq + 1);
        let mut handles = self.driver.inner.handles.borrow_mut();
        match handles.get_mut(self.key) {
            Some(slot) => {
                slot.deadline = Some(now + delay_ms);
                slot.seq = seq;
            }
            None => log::debug!("arm on a closed timer handle ignored"),
        }
    }

    /// Cancels the pending fire, if any, without releasing the handle.
    pub fn stop(&self) {
        if let Some(slot) = self.driver.inner.handles.borrow_mut().get_mut(self.key) {
            slot.deadline = None;
        }
    }

    /// Marks the handle as keeping the process alive while armed. Default.
    pub fn ref_(&self) {
        if let Some(slot) = self.driver.inner.handles.borrow_mut().get_mut(self.key) {
            slot.refed = true;
        }
    }

    /// Marks the handle as not keeping the process alive.
    pub fn unref(&self) {
        if let Some(slot) = self.driver.inner.handles.borrow_mut().get_mut(self.key) {
            slot.refed = false;
        }
    }

    /// Whether the handle currently contributes to process liveness.
    pub fn is_refed(&self) -> bool {
        self.driver
            .inner
            .handles
            .borrow()
            .get(self.key)
            .is_some_and(|slot| slot.refed)
    }

    /// Whether a fire is pending.
    pub fn is_armed(&self) -> bool {
        self.driver
            .inner
            .handles
            .borrow()
            .get(self.key)
            .is_some_and(|slot| slot.deadline.is_some())
    }

    /// Stops and releases the handle. Further calls on it are no-ops.
    pub fn close(&self) {
        self.driver.inner.handles.borrow_mut().remove(self.key);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.close();
    }
}
