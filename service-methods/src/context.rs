use std::mem;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::token::ContextToken;
use crate::unit::ExecutionUnit;
use crate::{Completion, MethodError, StartParameters};

/// A cooperative cancellation signal shared between the broker and a running
/// method body.
///
/// Cancelling never interrupts a method, it's up to the method body to poll
/// `is_cancelled()` (or `check()`) at points where it can safely give up, or
/// to race its work against `cancelled()`.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    token: CancellationToken,
}

impl Cancellation {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Convenience for method bodies: `cancellation.check()?` bails out
    /// with `MethodError::Aborted` once cancellation has been requested.
    pub fn check(&self) -> std::result::Result<(), MethodError> {
        if self.is_cancelled() {
            Err(MethodError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug)]
pub(crate) enum ContextState {
    // The method body is still running
    Pending,

    // The context was removed by cancel() before the method body finished
    // so whatever the body produces has to be thrown away
    Detached,

    // Status + results have been written and are waiting for end()
    Ready(Completion),

    // Terminal: results were either consumed by end() or discarded
    Released,
}

impl ContextState {
    // Nothing left for end() to wait for: either results are ready or the
    // context has been cancelled out from under the waiter
    fn is_settled(&self) -> bool {
        !matches!(self, ContextState::Pending)
    }
}

/// What happened to a method body's results when its execution unit
/// finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    CancelledNoop,
}

#[derive(Clone, Debug)]
pub(crate) struct InvocationContext {
    inner: Arc<InvocationContextInner>,
}
impl Deref for InvocationContext {
    type Target = InvocationContextInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug)]
pub(crate) struct InvocationContextInner {
    token: ContextToken,
    parameters: StartParameters,
    cancellation: Cancellation,

    // Note: the watch channel is both the storage for the status/results and
    // the completion signal. Writes go through send_modify() which serializes
    // the execution unit's write against a concurrent cancel() and gives
    // end() release/acquire ordering once it observes a settled state.
    //
    // The receiving half isn't stored, waiters subscribe() on demand.
    state: watch::Sender<ContextState>,

    unit: Mutex<UnitSlot>,
}

#[derive(Debug)]
enum UnitSlot {
    // start() hasn't attached the worker yet
    Empty,
    Attached(ExecutionUnit),

    // end() or cancel() has already been and gone. A unit attached after
    // this point is handed straight back to start() to detach.
    Retired,
}

impl InvocationContext {
    pub(crate) fn new(token: ContextToken, parameters: StartParameters) -> Self {
        debug!("Creating context {} for method {}", token, parameters.method);
        let (state, _) = watch::channel(ContextState::Pending);
        InvocationContext {
            inner: Arc::new(InvocationContextInner {
                token,
                parameters,
                cancellation: Cancellation::new(),
                state,
                unit: Mutex::new(UnitSlot::Empty),
            }),
        }
    }

    pub(crate) fn token(&self) -> &ContextToken {
        &self.token
    }

    pub(crate) fn parameters(&self) -> &StartParameters {
        &self.parameters
    }

    pub(crate) fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    fn unit_guard(&self) -> MutexGuard<'_, UnitSlot> {
        // Nothing can be left half-updated behind this lock (it only
        // ever holds a mem::replace() of the slot) so poisoning is benign
        self.unit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the worker to this context. Returns the unit back if the
    /// context was already consumed, in which case nobody else will ever
    /// take it.
    pub(crate) fn attach(&self, unit: ExecutionUnit) -> Option<ExecutionUnit> {
        let mut slot = self.unit_guard();
        match *slot {
            UnitSlot::Retired => Some(unit),
            _ => {
                *slot = UnitSlot::Attached(unit);
                None
            }
        }
    }

    /// Takes the worker out of the context for joining or detaching. Any
    /// later attach() is refused.
    pub(crate) fn take_unit(&self) -> Option<ExecutionUnit> {
        match mem::replace(&mut *self.unit_guard(), UnitSlot::Retired) {
            UnitSlot::Attached(unit) => Some(unit),
            UnitSlot::Empty | UnitSlot::Retired => None,
        }
    }

    /// Called exactly once by the bound execution unit when the method body
    /// has finished.
    pub(crate) fn complete(&self, completion: Completion) -> Outcome {
        let mut outcome = Outcome::CancelledNoop;
        self.state.send_modify(|state| {
            outcome = match mem::replace(state, ContextState::Released) {
                ContextState::Pending => {
                    *state = ContextState::Ready(completion);
                    Outcome::Completed
                }
                ContextState::Detached => Outcome::CancelledNoop,
                other => {
                    // Only the bound execution unit writes results so this
                    // would imply complete() was called twice
                    log::error!("Spurious completion for context {} in state {:?}",
                                self.token, other);
                    *state = other;
                    Outcome::CancelledNoop
                }
            };
        });
        trace!("Context {} completed: {:?}", self.token, outcome);
        outcome
    }

    /// Marks the context as no longer reachable and asks the method body to
    /// stop. Any results already written (or written later) are dropped.
    pub(crate) fn detach(&self) {
        self.cancellation.cancel();
        self.state.send_modify(|state| match state {
            ContextState::Pending => *state = ContextState::Detached,
            ContextState::Ready(_) => *state = ContextState::Released,
            ContextState::Detached | ContextState::Released => {}
        });
        trace!("Context {} detached", self.token);
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.state.borrow().is_settled()
    }

    /// Resolves once the execution unit has stored its results or the
    /// context has been detached.
    pub(crate) async fn settled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self` so this can't see a closed
        // channel. The returned borrow is dropped straight away so we never
        // hold the state lock across anything else.
        let _ = receiver.wait_for(ContextState::is_settled).await;
    }

    /// Hands out the results exactly once.
    pub(crate) fn take_completion(&self) -> Option<Completion> {
        let mut completion = None;
        self.state.send_if_modified(|state| {
            if let ContextState::Ready(_) = state {
                if let ContextState::Ready(ready) = mem::replace(state, ContextState::Released) {
                    completion = Some(ready);
                }
                true
            } else {
                false
            }
        });
        completion
    }
}
