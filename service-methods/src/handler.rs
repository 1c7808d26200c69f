use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::trace;
use uuid::Uuid;

use crate::context::{Cancellation, InvocationContext};
use crate::token::ContextToken;
use crate::{Error, MethodError, Payload, Result};

/// The body of a service method.
///
/// Each invocation runs on its own worker thread which drives `invoke()` on
/// a private single-threaded tokio runtime (with timers enabled), so
/// handlers are free to `.await` tokio timers and other runtime-agnostic
/// futures.
///
/// Any error returned (and any panic) is recorded as the status of the
/// invocation and handed back to the host via `MethodBroker::end()`.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn invoke(&self, invocation: &Invocation) -> std::result::Result<Payload, MethodError>;
}

/// A method body's view of the invocation it's running for
#[derive(Clone, Debug)]
pub struct Invocation {
    context: InvocationContext,
}

impl Invocation {
    pub(crate) fn new(context: InvocationContext) -> Self {
        Invocation { context }
    }

    pub fn token(&self) -> &ContextToken {
        self.context.token()
    }

    pub fn method(&self) -> Uuid {
        self.context.parameters().method
    }

    pub fn arguments(&self) -> &Payload {
        &self.context.parameters().arguments
    }

    pub fn cancellation(&self) -> &Cancellation {
        self.context.cancellation()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }
}

/// Routes invocations to per-method handlers based on the method id
/// carried in the start parameters.
///
/// Invoking a method that hasn't been registered fails the invocation
/// with `MethodError::UnknownMethod`.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<Uuid, Arc<dyn MethodHandler>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, method: Uuid, handler: H) -> Result<&mut Self>
        where H: MethodHandler + 'static
    {
        if self.methods.contains_key(&method) {
            return Err(Error::DuplicateMethod(method));
        }
        self.methods.insert(method, Arc::new(handler));
        Ok(self)
    }

    pub fn contains(&self, method: Uuid) -> bool {
        self.methods.contains_key(&method)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

#[async_trait]
impl MethodHandler for MethodTable {
    async fn invoke(&self, invocation: &Invocation) -> std::result::Result<Payload, MethodError> {
        let method = invocation.method();
        match self.methods.get(&method) {
            Some(handler) => {
                trace!("Dispatching {} to method {}", invocation.token(), method);
                handler.invoke(invocation).await
            }
            None => Err(MethodError::UnknownMethod(method)),
        }
    }
}

/// Adapts an async closure into a `MethodHandler`
///
/// ```no_run
/// # use service_methods::handler::handler_fn;
/// let echo = handler_fn(|invocation| async move {
///     Ok(invocation.arguments().clone())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
    where F: Fn(Invocation) -> Fut + Send + Sync,
          Fut: Future<Output = std::result::Result<Payload, MethodError>> + Send + 'static
{
    FnHandler { f }
}

pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
    where F: Fn(Invocation) -> Fut + Send + Sync,
          Fut: Future<Output = std::result::Result<Payload, MethodError>> + Send + 'static
{
    async fn invoke(&self, invocation: &Invocation) -> std::result::Result<Payload, MethodError> {
        (self.f)(invocation.clone()).await
    }
}
