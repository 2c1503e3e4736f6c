use std::error::Error;
use std::fmt;

/// Errors from [`Scheduler::enroll`](crate::Scheduler::enroll).
///
/// The public `set_timeout`/`set_interval` entry points never return these;
/// they coerce out-of-range durations to 1 ms instead. `enroll` is the strict
/// low-level path and rejects what it cannot represent.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    /// The duration was NaN or infinite.
    #[error("timer duration must be finite, got {0}")]
    NotFinite(f64),
    /// The duration was negative.
    #[error("timer duration must be non-negative, got {0}")]
    Negative(f64),
}

/// The error a user callback reports back to the scheduler.
///
/// The core does not interpret the payload; it preserves sibling progress
/// (deferring the rest of the drain to the next tick) and propagates the
/// error to the host, unless a [`Domain`](crate::Domain) swallows it first.
#[derive(thiserror::Error, Debug)]
#[error("timer callback failed: {source}")]
pub struct CallbackError {
    #[source]
    source: Box<dyn Error + 'static>,
}

impl CallbackError {
    /// Wraps an arbitrary error value.
    pub fn new(source: impl Into<Box<dyn Error + 'static>>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Wraps a plain message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::new(message.to_string())
    }
}
