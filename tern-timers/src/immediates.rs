//! The immediate queue: callbacks that run on the next event-loop turn,
//! bypassing the duration buckets entirely.
//!
//! The queue is drained at most once per turn. The drain snapshots the live
//! queue and installs a fresh one, so immediates scheduled *during* a drain
//! always wait for the next turn.

use std::rc::Rc;

use crate::error::CallbackError;
use crate::list::{self, Links};
use crate::state::{ImmediateItem, ImmediateKey, SchedulerInner};

impl SchedulerInner {
    pub(crate) fn set_immediate(
        self: &Rc<Self>,
        callback: Box<dyn FnOnce() -> Result<(), CallbackError>>,
    ) -> ImmediateKey {
        let domain = self.current_domain.borrow().clone();
        let mut immediates = self.immediates.borrow_mut();
        let key = immediates.insert_with_key(|key| ImmediateItem {
            callback: Some(callback),
            domain,
            links: Links::detached(key),
        });
        list::append(&mut immediates, self.immediate_queue.get(), key);
        self.need_immediate.set(true);
        key
    }

    pub(crate) fn clear_immediate(&self, key: ImmediateKey) {
        let mut immediates = self.immediates.borrow_mut();
        if immediates.contains_key(key) {
            immediates[key].callback = None;
            // Works whether the item sits in the live queue or in a drain's
            // snapshot; the splice is ring-agnostic.
            list::remove(&mut immediates, key);
            immediates.remove(key);
        }
        if list::is_empty(&immediates, self.immediate_queue.get()) {
            self.need_immediate.set(false);
        }
    }

    /// Drains the immediate queue once.
    ///
    /// On a callback error, unprocessed items are put back in front of
    /// anything scheduled during the drain, a resumption is deferred to the
    /// next tick, and the error propagates.
    pub(crate) fn run_immediates(self: &Rc<Self>) -> Result<(), CallbackError> {
        // Snapshot: `queue` is what we drain; a fresh ring goes live.
        let queue = self.immediate_queue.get();
        let fresh = self
            .immediates
            .borrow_mut()
            .insert_with_key(ImmediateItem::sentinel);
        self.immediate_queue.set(fresh);

        loop {
            let key = {
                let mut immediates = self.immediates.borrow_mut();
                list::shift(&mut immediates, queue)
            };
            let Some(key) = key else {
                break;
            };
            let (callback, domain) = {
                let mut immediates = self.immediates.borrow_mut();
                let item = &mut immediates[key];
                let taken = (item.callback.take(), item.domain.clone());
                immediates.remove(key);
                taken
            };
            let Some(callback) = callback else {
                continue;
            };
            if let Some(domain) = &domain {
                domain.enter();
            }
            match callback() {
                Ok(()) => {
                    if let Some(domain) = &domain {
                        domain.exit();
                    }
                }
                Err(error) => {
                    let error = match &domain {
                        Some(domain) => domain.intercept(error),
                        None => Some(error),
                    };
                    let Some(error) = error else {
                        if let Some(domain) = &domain {
                            domain.exit();
                        }
                        continue;
                    };
                    log::warn!("immediate callback failed, deferring rest of queue to next tick");
                    {
                        let mut immediates = self.immediates.borrow_mut();
                        if list::is_empty(&immediates, queue) {
                            // Nothing left from the snapshot; the fresh ring
                            // stays live.
                            immediates.remove(queue);
                        } else {
                            // Unprocessed snapshot items come first, then
                            // whatever the drain scheduled; that ring goes
                            // back to being the live queue.
                            let live = self.immediate_queue.get();
                            while let Some(moved) = list::shift(&mut immediates, live) {
                                list::append(&mut immediates, queue, moved);
                            }
                            immediates.remove(live);
                            self.immediate_queue.set(queue);
                        }
                    }
                    let sched = Rc::clone(self);
                    self.next_tick
                        .borrow_mut()
                        .push_back(Box::new(move || sched.run_immediates()));
                    return Err(error);
                }
            }
        }

        {
            let mut immediates = self.immediates.borrow_mut();
            immediates.remove(queue);
            if list::is_empty(&immediates, self.immediate_queue.get()) {
                self.need_immediate.set(false);
            }
        }
        Ok(())
    }
}
