use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{mpsc, Arc};
use std::thread;

use futures::FutureExt;
use log::{trace, warn};
use tokio::sync::broadcast;

use crate::context::{InvocationContext, Outcome};
use crate::handler::{Invocation, MethodHandler};
use crate::token::ContextToken;
use crate::{BrokerEvent, Completion, Error, MethodError, Result};

#[derive(Clone, Debug)]
pub(crate) struct LaunchOptions {
    pub(crate) thread_name: String,
    pub(crate) stack_size: Option<usize>,
}

/// One dedicated worker thread running the method body for a single
/// invocation.
///
/// The unit is owned by the context it's bound to, and the worker thread
/// holds a reference back to that context until it exits. The unit itself
/// only keeps the token (for logging) so there's no reference cycle.
///
/// Whoever takes the unit out of the context decides the thread's fate:
/// `end()` joins it, `cancel()` detaches it.
#[derive(Debug)]
pub(crate) struct ExecutionUnit {
    token: ContextToken,
    worker: thread::JoinHandle<()>,
}

impl ExecutionUnit {
    /// Spawns the worker thread and waits until it's ready to run the method
    /// body.
    ///
    /// The worker builds its own runtime before doing anything else and
    /// reports back whether that worked, so a failure to set up the thread
    /// is returned here instead of being recorded as a method failure.
    pub(crate) fn launch(context: InvocationContext, handler: Arc<dyn MethodHandler>,
                         event_bus: broadcast::Sender<BrokerEvent>, options: &LaunchOptions)
                         -> Result<Self> {
        let token = context.token().clone();

        let mut builder = thread::Builder::new().name(options.thread_name.clone());
        if let Some(stack_size) = options.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let worker = builder.spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => {
                    let _ = ready_tx.send(Ok(()));
                    runtime
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            ExecutionUnit::run(context, handler, event_bus, runtime);
        });
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                warn!("Failed to spawn worker thread for {}: {}", token, err);
                return Err(Error::Initialization(format!("failed to spawn worker thread: {}", err)));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                trace!("Launched {:?} for {}", options.thread_name, token);
                Ok(ExecutionUnit { token, worker })
            }
            Ok(Err(err)) => {
                let _ = worker.join();
                warn!("Failed to create runtime for {}: {}", token, err);
                Err(Error::Initialization(format!("failed to create worker runtime: {}", err)))
            }
            Err(_) => {
                let _ = worker.join();
                Err(Error::Initialization("worker thread exited before starting".to_string()))
            }
        }
    }

    fn run(context: InvocationContext, handler: Arc<dyn MethodHandler>,
           event_bus: broadcast::Sender<BrokerEvent>, runtime: tokio::runtime::Runtime) {
        let token = context.token().clone();
        trace!("Running method {} for {}", context.parameters().method, token);

        let invocation = Invocation::new(context.clone());
        let result = runtime.block_on(AssertUnwindSafe(handler.invoke(&invocation)).catch_unwind());
        // Blocking tasks the method body spawned and never awaited must not
        // hold up the join in end()
        runtime.shutdown_background();
        let completion = match result {
            Ok(Ok(results)) => Completion::succeeded(results),
            Ok(Err(err)) => Completion::failed(err),
            Err(panic) => {
                let message = panic_message(&*panic);
                warn!("Method body for {} panicked: {}", token, message);
                Completion::failed(MethodError::Panicked(message))
            }
        };
        let succeeded = completion.status.is_success();

        match context.complete(completion) {
            Outcome::Completed => {
                // No subscribers is fine, the host can always poll
                let _ = event_bus.send(BrokerEvent::MethodCompleted { token, succeeded });
            }
            Outcome::CancelledNoop => {
                trace!("Discarding results for cancelled invocation {}", token);
            }
        }
    }

    pub(crate) fn join(self) {
        trace!("Joining worker for {}", self.token);
        // Method panics are caught inside the worker so this can only fail
        // if the bookkeeping after the method body panicked
        if self.worker.join().is_err() {
            warn!("Worker thread for {} panicked", self.token);
        }
    }

    pub(crate) fn detach(self) {
        trace!("Detaching worker for {}", self.token);
        drop(self.worker);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::{MethodStatus, Payload, StartParameters};
    use uuid::Uuid;

    fn options() -> LaunchOptions {
        LaunchOptions { thread_name: "service-method-test".to_string(), stack_size: None }
    }

    fn launch(handler: Arc<dyn MethodHandler>, arguments: &str)
              -> (InvocationContext, ExecutionUnit, broadcast::Receiver<BrokerEvent>) {
        let (event_bus, events) = broadcast::channel(16);
        let context = InvocationContext::new(ContextToken::generate(),
                                             StartParameters::new(Uuid::nil(), arguments));
        let unit = ExecutionUnit::launch(context.clone(), handler, event_bus, &options()).unwrap();
        (context, unit, events)
    }

    #[test]
    fn runs_to_completion() {
        let handler = Arc::new(handler_fn(|invocation| async move {
            assert_eq!(std::thread::current().name(), Some("service-method-test"));
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(Payload::from(format!("{:?}", invocation.arguments())))
        }));
        let (context, unit, mut events) = launch(handler, "ping");
        unit.join();

        let completion = context.take_completion().unwrap();
        assert_eq!(completion.results, Some(Payload::from("Payload(\"ping\")")));
        assert!(matches!(events.try_recv(),
                         Ok(BrokerEvent::MethodCompleted { succeeded: true, .. })));
    }

    #[test]
    fn panic_is_captured_as_status() {
        let handler = Arc::new(handler_fn(|_| async move {
            if true {
                panic!("bad things");
            }
            Ok(Payload::new())
        }));
        let (context, unit, _events) = launch(handler, "ping");
        unit.join();

        let completion = context.take_completion().unwrap();
        assert_eq!(completion.status,
                   MethodStatus::Failed(MethodError::Panicked("bad things".to_string())));
        assert_eq!(completion.results, None);
    }

    #[test]
    fn detached_context_gets_no_event() {
        let handler = Arc::new(handler_fn(|invocation| async move {
            invocation.cancellation().cancelled().await;
            Ok(Payload::from("late"))
        }));
        let (context, unit, mut events) = launch(handler, "slow");
        context.detach();
        unit.join();

        assert!(context.is_settled());
        assert!(context.take_completion().is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn attach_after_retire_hands_unit_back() {
        let handler = Arc::new(handler_fn(|_| async move { Ok(Payload::from("pong")) }));
        let (context, unit, _events) = launch(handler, "ping");

        // end() or cancel() got to the context before start() attached it
        assert!(context.take_unit().is_none());
        let unit = context.attach(unit).expect("unit should be refused");
        unit.join();
        assert!(context.take_unit().is_none());
    }

    #[test]
    fn attached_unit_is_taken_once() {
        let handler = Arc::new(handler_fn(|_| async move { Ok(Payload::from("pong")) }));
        let (context, unit, _events) = launch(handler, "ping");

        assert!(context.attach(unit).is_none());
        context.take_unit().expect("unit should be attached").join();
        assert!(context.take_unit().is_none());
    }
}
