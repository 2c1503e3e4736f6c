use crate::error::CallbackError;

/// An error-isolation context supplied by the host runtime.
///
/// The scheduler never creates domains; it captures the current one (see
/// [`Scheduler::set_domain`](crate::Scheduler::set_domain)) when a timer or
/// immediate is scheduled, and routes dispatch through it:
///
/// - [`enter`](Domain::enter) is called before the callback, [`exit`](Domain::exit)
///   after it completes or its error is swallowed. A propagating error skips
///   `exit`; unwinding the domain stack is the host's business.
/// - A callback error is offered to [`intercept`](Domain::intercept) first.
///   Returning `None` swallows it and the drain continues on the same tick.
/// - A [disposed](Domain::is_disposed) domain aborts the drain that reaches
///   one of its timers, without re-arming the bucket. Surviving items in that
///   bucket fire only once a later activation of the same duration re-creates
///   the backing timer. Disposal is terminal by design.
pub trait Domain {
    /// Installs this domain as the error boundary for the callback about to run.
    fn enter(&self);

    /// Uninstalls this domain after a callback completed without propagating.
    fn exit(&self);

    /// Whether the domain has been torn down.
    fn is_disposed(&self) -> bool {
        false
    }

    /// Offered every error a callback under this domain produces.
    ///
    /// Return `None` to swallow the error, or `Some` (possibly transformed)
    /// to let it propagate to the host.
    fn intercept(&self, error: CallbackError) -> Option<CallbackError> {
        Some(error)
    }
}
