#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tern_driver::{Driver, ManualClock};
use tern_timers::{CallbackError, Domain, Scheduler};

pub fn setup() -> (ManualClock, Driver, Scheduler) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = ManualClock::new();
    let driver = Driver::new(clock.clone());
    let sched = Scheduler::new(driver.clone());
    (clock, driver, sched)
}

/// Shared event log the test callbacks append to.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.borrow_mut().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.borrow().clone()
    }
}

/// A host domain that counts boundary crossings and can be told to swallow
/// errors or report itself disposed.
#[derive(Default)]
pub struct TestDomain {
    pub entered: Cell<usize>,
    pub exited: Cell<usize>,
    pub disposed: Cell<bool>,
    pub swallow: Cell<bool>,
}

impl Domain for TestDomain {
    fn enter(&self) {
        self.entered.set(self.entered.get() + 1);
    }

    fn exit(&self) {
        self.exited.set(self.exited.get() + 1);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    fn intercept(&self, error: CallbackError) -> Option<CallbackError> {
        if self.swallow.get() { None } else { Some(error) }
    }
}
