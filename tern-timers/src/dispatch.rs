//! The dispatch loop: drains a bucket when its native handle fires.
//!
//! The drain must leave every invariant intact in the face of callbacks that
//! cancel siblings, cancel themselves, schedule new timers of the same
//! duration, or fail. The callback is taken out of the arena before it runs
//! and restored afterwards, so no arena borrow is ever held across user code.

use std::rc::Rc;

use crate::error::CallbackError;
use crate::list;
use crate::state::{ItemKind, SchedulerInner, TimerCallback, TimerKey};

impl SchedulerInner {
    /// Fire entry point for the shared bucket `(msecs, unrefed)`.
    ///
    /// Drains due items in activation order. Stops early to re-arm when the
    /// head is not yet due, and collapses the bucket when the list empties.
    /// A failing callback defers the rest of the drain to the next tick and
    /// propagates the error, so siblings are neither starved nor run in the
    /// failing stack frame.
    pub(crate) fn on_fire(self: &Rc<Self>, msecs: u64, unrefed: bool) -> Result<(), CallbackError> {
        let now = self.driver.now_ms();
        loop {
            let head = {
                let registry = self.registry(unrefed).borrow();
                // A callback earlier in this drain may have collapsed the
                // bucket (cancelled the last sibling); nothing left to do.
                let Some(bucket) = registry.get(&msecs) else {
                    return Ok(());
                };
                list::peek(&self.timers.borrow(), bucket.sentinel)
            };
            let Some(key) = head else {
                self.collapse_bucket(msecs, unrefed);
                return Ok(());
            };

            let idle_start = {
                let timers = self.timers.borrow();
                timers[key].idle_start.unwrap_or(now)
            };
            let diff = now.saturating_sub(idle_start);
            if diff < msecs {
                // Head activated after the handle was armed; wait out the
                // remainder.
                let registry = self.registry(unrefed).borrow();
                if let Some(bucket) = registry.get(&msecs) {
                    bucket.handle.arm(msecs - diff);
                }
                return Ok(());
            }

            let (callback, domain) = {
                let mut timers = self.timers.borrow_mut();
                list::remove(&mut timers, key);
                let item = &mut timers[key];
                (item.callback.take(), item.domain.clone())
            };
            // Cancelled after this drain started: skip it.
            let Some(mut callback) = callback else {
                self.reclaim_if_garbage(key);
                continue;
            };
            if let Some(domain) = &domain {
                if domain.is_disposed() {
                    // Disposal is terminal: abandon the drain without
                    // re-arming. A later activation of this duration heals
                    // the bucket.
                    log::debug!("domain disposed, abandoning {msecs}ms drain");
                    if let Some(item) = self.timers.borrow_mut().get_mut(key) {
                        item.callback = Some(callback);
                    }
                    return Ok(());
                }
                domain.enter();
            }
            if let Some(item) = self.timers.borrow_mut().get_mut(key) {
                item.called = true;
            }

            match callback() {
                Ok(()) => {
                    if let Some(domain) = &domain {
                        domain.exit();
                    }
                    self.after_callback(key, callback, true);
                }
                Err(error) => {
                    let error = match &domain {
                        Some(domain) => domain.intercept(error),
                        None => Some(error),
                    };
                    match error {
                        // Swallowed by the domain: the drain continues on
                        // this tick. The interval re-arm is skipped either
                        // way; the callback did not complete.
                        None => {
                            if let Some(domain) = &domain {
                                domain.exit();
                            }
                            self.after_callback(key, callback, false);
                        }
                        Some(error) => {
                            log::warn!(
                                "timer callback failed, deferring rest of {msecs}ms drain to next tick"
                            );
                            self.after_callback(key, callback, false);
                            let sched = Rc::clone(self);
                            self.next_tick.borrow_mut().push_back(Box::new(move || {
                                sched.on_fire(msecs, unrefed)
                            }));
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Fire entry point for a private handle created by `unref` migration.
    pub(crate) fn on_private_fire(self: &Rc<Self>, key: TimerKey) -> Result<(), CallbackError> {
        let (callback, domain) = {
            let mut timers = self.timers.borrow_mut();
            let Some(item) = timers.get_mut(key) else {
                return Ok(());
            };
            (item.callback.take(), item.domain.clone())
        };
        let Some(mut callback) = callback else {
            return Ok(());
        };
        if let Some(domain) = &domain {
            if domain.is_disposed() {
                if let Some(item) = self.timers.borrow_mut().get_mut(key) {
                    item.callback = Some(callback);
                }
                return Ok(());
            }
            domain.enter();
        }
        if let Some(item) = self.timers.borrow_mut().get_mut(key) {
            item.called = true;
        }
        match callback() {
            Ok(()) => {
                if let Some(domain) = &domain {
                    domain.exit();
                }
                self.finish_private(key, callback, true);
                Ok(())
            }
            Err(error) => {
                let error = match &domain {
                    Some(domain) => domain.intercept(error),
                    None => Some(error),
                };
                match error {
                    None => {
                        if let Some(domain) = &domain {
                            domain.exit();
                        }
                        self.finish_private(key, callback, false);
                        Ok(())
                    }
                    Some(error) => {
                        self.finish_private(key, callback, false);
                        Err(error)
                    }
                }
            }
        }
    }

    /// Puts the taken callback back and restarts intervals. The callback may
    /// have cleared its own item, in which case the slot is already gone and
    /// there is nothing to restore.
    fn after_callback(self: &Rc<Self>, key: TimerKey, callback: TimerCallback, rearm: bool) {
        enum Next {
            Nothing,
            ArmPrivate(u64),
            Activate,
            Reclaim,
        }
        let next = {
            let mut timers = self.timers.borrow_mut();
            let Some(item) = timers.get_mut(key) else {
                return;
            };
            match item.repeat {
                Some(period) => {
                    item.callback = Some(callback);
                    if !rearm {
                        Next::Nothing
                    } else if item.handle.is_some() {
                        // Migrated to a private handle mid-callback.
                        Next::ArmPrivate(period)
                    } else {
                        item.idle_timeout = period as i64;
                        Next::Activate
                    }
                }
                None => match item.kind {
                    // Enrolled items are reusable: the embedder may `active`
                    // the same record again.
                    ItemKind::Enrolled => {
                        item.callback = Some(callback);
                        Next::Nothing
                    }
                    _ => Next::Reclaim,
                },
            }
        };
        match next {
            Next::Nothing => {}
            Next::ArmPrivate(period) => {
                let timers = self.timers.borrow();
                if let Some(handle) = timers[key].handle.as_ref() {
                    handle.arm(period);
                }
            }
            Next::Activate => self.insert(key, false),
            Next::Reclaim => {
                self.timers.borrow_mut().remove(key);
            }
        }
    }

    /// Post-fire bookkeeping for the private-handle path: re-arm intervals,
    /// close finished one-shots.
    fn finish_private(&self, key: TimerKey, callback: TimerCallback, rearm: bool) {
        let mut timers = self.timers.borrow_mut();
        let Some(item) = timers.get_mut(key) else {
            return;
        };
        match item.repeat {
            Some(period) => {
                item.callback = Some(callback);
                if rearm {
                    if let Some(handle) = &item.handle {
                        handle.arm(period);
                    }
                }
            }
            None => {
                // Dropping the item drops (and closes) its private handle.
                timers.remove(key);
            }
        }
    }

    /// Drains the deferred (next-tick) queue the host polls at the top of
    /// every turn. Stops at the first error; the rest of the queue survives.
    pub(crate) fn run_next_tick(&self) -> Result<(), CallbackError> {
        loop {
            let thunk = self.next_tick.borrow_mut().pop_front();
            let Some(thunk) = thunk else {
                return Ok(());
            };
            thunk()?;
        }
    }
}
