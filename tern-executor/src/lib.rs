//! The host event loop for the tern timer core.
//!
//! One *turn* of the loop is: run deferred (next-tick) work, fire due native
//! timers, then drain the immediate queue, the latter exactly once per turn,
//! so immediates scheduled during a drain always wait for the next turn. [`EventLoop::run`] repeats turns, sleeping until the next refed
//! deadline, and returns once nothing refed remains to keep the process
//! alive.
//!
//! ```no_run
//! use tern_driver::Driver;
//! use tern_executor::EventLoop;
//! use tern_timers::Scheduler;
//!
//! let driver = Driver::system();
//! let sched = Scheduler::new(driver.clone());
//! sched.set_timeout(|| {
//!     println!("one second later");
//!     Ok(())
//! }, 1000.0);
//! EventLoop::new(driver, sched).run().unwrap();
//! ```

#![warn(
    elided_lifetimes_in_paths,
    missing_debug_implementations,
    missing_docs,
    unsafe_op_in_unsafe_fn
)]

use std::error::Error;
use std::thread;
use std::time::Duration;

use tern_driver::Driver;
use tern_timers::{CallbackError, Scheduler};

/// A failure surfaced by one turn of the loop.
///
/// The turn aborts at the first error; queued work (deferred drains,
/// still-armed handles, unprocessed immediates) survives for later turns.
#[derive(thiserror::Error, Debug)]
pub enum TurnError {
    /// A deferred (next-tick) task failed.
    #[error("deferred task failed")]
    NextTick(#[source] CallbackError),
    /// A timer callback failed during dispatch.
    #[error("timer dispatch failed")]
    Timer(#[source] Box<dyn Error + 'static>),
    /// An immediate callback failed.
    #[error("immediate dispatch failed")]
    Immediate(#[source] CallbackError),
}

/// A single-threaded cooperative event loop over a driver and a scheduler.
#[derive(Debug)]
pub struct EventLoop {
    driver: Driver,
    scheduler: Scheduler,
}

impl EventLoop {
    /// Builds a loop over the given driver and scheduler. The scheduler must
    /// have been constructed over the same driver.
    pub fn new(driver: Driver, scheduler: Scheduler) -> Self {
        Self { driver, scheduler }
    }

    /// The scheduler this loop polls.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The driver this loop fires.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Whether anything refed remains: armed refed handles, pending
    /// immediates, or deferred work. Unrefed timers alone do not count.
    pub fn is_alive(&self) -> bool {
        self.driver.armed_refed_count() > 0
            || self.scheduler.needs_immediate()
            || self.scheduler.has_pending_next_tick()
    }

    /// Executes one turn: deferred work, due timers, then immediates once.
    pub fn turn(&self) -> Result<(), TurnError> {
        self.scheduler.run_next_tick().map_err(TurnError::NextTick)?;
        self.driver.run_due().map_err(TurnError::Timer)?;
        if self.scheduler.needs_immediate() {
            self.scheduler
                .run_immediates()
                .map_err(TurnError::Immediate)?;
        }
        Ok(())
    }

    /// Runs turns until nothing keeps the process alive, sleeping between
    /// turns until the next refed deadline.
    ///
    /// Meant for drivers over a real clock; with a
    /// [`ManualClock`](tern_driver::ManualClock) the deadline never
    /// approaches on its own; advance the clock and call
    /// [`turn`](EventLoop::turn) instead.
    pub fn run(&self) -> Result<(), TurnError> {
        while self.is_alive() {
            if !self.scheduler.has_pending_next_tick() && !self.scheduler.needs_immediate() {
                if let Some(deadline) = self.driver.next_refed_deadline() {
                    let now = self.driver.now_ms();
                    if deadline > now {
                        thread::sleep(Duration::from_millis(deadline - now));
                    }
                }
            }
            self.turn()?;
        }
        log::debug!("event loop drained, exiting");
        Ok(())
    }
}
