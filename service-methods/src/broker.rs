use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use log::{debug, trace};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::context::InvocationContext;
use crate::handler::MethodHandler;
use crate::token::ContextToken;
use crate::unit::{ExecutionUnit, LaunchOptions};
use crate::{BrokerEvent, Completion, Error, Result, StartParameters};

const DEFAULT_THREAD_NAME: &str = "service-method";
const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Bridges a host's start/end/cancel method calls onto background workers.
///
/// `start()` returns a token straight away while the method body runs on a
/// dedicated thread. The token can later be handed to `end()` to collect the
/// results (waiting for them if necessary) or to `cancel()`. Each token can
/// be consumed exactly once, by either `end()` or `cancel()`.
///
/// A `MethodBroker` is a cheap, clonable handle and all clones share the
/// same table of in-flight invocations. When the last handle is dropped any
/// outstanding invocations are cancelled.
#[derive(Clone, Debug)]
pub struct MethodBroker {
    inner: Arc<BrokerInner>,
}
impl PartialEq for MethodBroker {
    fn eq(&self, other: &MethodBroker) -> bool {
        Arc::<BrokerInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for MethodBroker {}
impl Hash for MethodBroker {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<BrokerInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for MethodBroker {
    type Target = BrokerInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but there's no
// public API on BrokerInner so nothing leaks
pub struct BrokerInner {
    handler: Arc<dyn MethodHandler>,

    // The context table. A token is present from just before its worker is
    // launched until the end() or cancel() that consumes it.
    //
    // Note: inserts and removes are atomic per token and no shard lock is
    // ever held while waiting for a method to complete, so slow methods
    // never block start/end/cancel for other tokens.
    contexts: DashMap<ContextToken, InvocationContext>,

    // Number of table slots handed out, including starts that are still
    // launching their worker. Only used to enforce max_in_flight.
    reserved: AtomicUsize,
    max_in_flight: Option<usize>,

    next_worker_index: AtomicU64,
    thread_name: String,
    stack_size: Option<usize>,

    event_bus: broadcast::Sender<BrokerEvent>,
}

impl fmt::Debug for BrokerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerInner")
            .field("in_flight", &self.contexts.len())
            .field("max_in_flight", &self.max_in_flight)
            .field("thread_name", &self.thread_name)
            .finish()
    }
}

#[cfg(test)]
#[test]
fn broker_eq() {
    use crate::handler::handler_fn;
    use crate::Payload;

    let handler = || handler_fn(|_| async { Ok(Payload::new()) });
    let broker0 = MethodBroker::new(handler()).unwrap();
    let broker1 = MethodBroker::new(handler()).unwrap();
    assert_ne!(broker0, broker1);
    assert_eq!(broker0, broker0.clone());
}

pub struct BrokerConfig {
    thread_name: String,
    stack_size: Option<usize>,
    max_in_flight: Option<usize>,
    event_capacity: usize,
}

impl BrokerConfig {
    pub fn new() -> BrokerConfig {
        BrokerConfig {
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
            max_in_flight: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Worker threads are named `"{prefix}-{n}"`
    pub fn set_thread_name(&mut self, prefix: &str) -> &mut Self {
        self.thread_name = prefix.to_string();
        self
    }

    pub fn set_stack_size(&mut self, bytes: usize) -> &mut Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Limits how many invocations can be in the context table at once.
    ///
    /// Once the limit is reached `start()` fails with `Error::Initialization`
    /// until an invocation is consumed via `end()` or `cancel()`.
    pub fn set_max_in_flight(&mut self, max: usize) -> &mut Self {
        self.max_in_flight = Some(max);
        self
    }

    /// Capacity of the broadcast bus behind `MethodBroker::events()`. Slow
    /// subscribers miss events once they lag behind by more than this.
    pub fn set_event_capacity(&mut self, capacity: usize) -> &mut Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build<H>(&self, handler: H) -> Result<MethodBroker>
        where H: MethodHandler + 'static
    {
        MethodBroker::build(self, Arc::new(handler))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodBroker {
    /// Creates a broker with the default configuration
    pub fn new<H>(handler: H) -> Result<Self>
        where H: MethodHandler + 'static
    {
        BrokerConfig::new().build(handler)
    }

    fn build(config: &BrokerConfig, handler: Arc<dyn MethodHandler>) -> Result<Self> {
        if config.event_capacity == 0 {
            return Err(Error::Initialization("event capacity must be non-zero".to_string()));
        }
        let (event_bus, _) = broadcast::channel(config.event_capacity);

        Ok(MethodBroker {
            inner: Arc::new(BrokerInner {
                handler,
                contexts: DashMap::new(),
                reserved: AtomicUsize::new(0),
                max_in_flight: config.max_in_flight,
                next_worker_index: AtomicU64::new(0),
                thread_name: config.thread_name.clone(),
                stack_size: config.stack_size,
                event_bus,
            }),
        })
    }

    /// Starts a new method invocation and returns its token without
    /// waiting for the method to run.
    ///
    /// If the invocation can't be set up (no free slot, or the worker
    /// thread can't be created) this fails with `Error::Initialization` and
    /// nothing is left behind in the context table.
    pub fn start(&self, parameters: StartParameters) -> Result<ContextToken> {
        self.reserve_slot()?;
        self.launch(parameters)
    }

    fn launch(&self, parameters: StartParameters) -> Result<ContextToken> {
        let token = ContextToken::generate();
        let context = InvocationContext::new(token.clone(), parameters);

        // The token has to be in the table before the worker can run, so a
        // host reacting to MethodCompleted always finds it. end() or cancel()
        // may therefore consume the context before the unit is attached, in
        // which case attach() hands the unit back and it's detached here.
        self.contexts.insert(token.clone(), context.clone());

        let index = self.next_worker_index.fetch_add(1, Ordering::Relaxed);
        let options = LaunchOptions {
            thread_name: format!("{}-{}", self.thread_name, index),
            stack_size: self.stack_size,
        };
        let unit = match ExecutionUnit::launch(context.clone(),
                                               self.handler.clone(),
                                               self.event_bus.clone(),
                                               &options) {
            Ok(unit) => unit,
            Err(err) => {
                // The slot goes with the entry, unless shutdown got there first
                self.remove(&token);
                return Err(err);
            }
        };
        if let Some(unit) = context.attach(unit) {
            unit.detach();
        }

        debug!("Started method invocation {}", token);
        Ok(token)
    }

    fn reserve_slot(&self) -> Result<()> {
        match self.max_in_flight {
            Some(max) => {
                self.reserved
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire,
                                  |n| if n < max { Some(n + 1) } else { None })
                    .map_err(|n| {
                        Error::Initialization(format!("too many method invocations in flight ({})", n))
                    })?;
            }
            None => {
                self.reserved.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    fn release_slot(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    fn lookup(&self, token: &ContextToken) -> Result<InvocationContext> {
        self.contexts
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::InvalidContext(token.clone()))
    }

    fn remove(&self, token: &ContextToken) -> Option<InvocationContext> {
        let (_, context) = self.contexts.remove(token)?;
        self.release_slot();
        Some(context)
    }

    /// Consumes the token of a settled invocation and hands back its
    /// results.
    ///
    /// Whoever manages to remove the entry from the table owns the results;
    /// anyone racing with them (another end() or a cancel()) gets
    /// `InvalidContext`.
    fn retire(&self, token: &ContextToken) -> Result<Completion> {
        let context = self.remove(token)
                          .ok_or_else(|| Error::InvalidContext(token.clone()))?;
        let completion = context.take_completion()
                                .ok_or_else(|| Error::InvalidContext(token.clone()))?;

        // The worker has already let go of its runtime by the time it
        // publishes results, so this join doesn't wait on anything the
        // method body left running
        if let Some(unit) = context.take_unit() {
            unit.join();
        }

        trace!("Retired method invocation {}: {:?}", token, completion.status);
        Ok(completion)
    }

    /// Waits for the invocation to complete and returns its status and
    /// results, removing it from the context table.
    ///
    /// Fails with `Error::InvalidContext` if the token is unknown or has
    /// already been consumed (including by a `cancel()` that happens while
    /// waiting).
    pub async fn end(&self, token: &ContextToken) -> Result<Completion> {
        let context = self.lookup(token)?;
        context.settled().await;
        self.retire(token)
    }

    /// Blocking version of `end()` for callers that aren't running async
    /// code.
    ///
    /// Note: this parks the calling thread, so shouldn't be called from
    /// within an async runtime.
    pub fn end_blocking(&self, token: &ContextToken) -> Result<Completion> {
        let context = self.lookup(token)?;
        futures::executor::block_on(context.settled());
        self.retire(token)
    }

    /// Like `end()` but gives up with `Error::Timeout` if the method
    /// doesn't complete in time, in which case the invocation is left
    /// in place (to be cancelled, or ended later).
    ///
    /// This relies on tokio's timer so must be called from within a tokio
    /// runtime with time enabled.
    pub async fn end_timeout(&self, token: &ContextToken, timeout: Duration) -> Result<Completion> {
        let context = self.lookup(token)?;
        tokio::time::timeout(timeout, context.settled())
            .await
            .map_err(|_| Error::Timeout)?;
        self.retire(token)
    }

    /// Non-blocking poll: returns `Ok(None)` if the method is still running,
    /// in which case the invocation is left in place.
    pub fn try_end(&self, token: &ContextToken) -> Result<Option<Completion>> {
        let context = self.lookup(token)?;
        if !context.is_settled() {
            return Ok(None);
        }
        self.retire(token).map(Some)
    }

    /// Requests cancellation of an invocation and forgets about it.
    ///
    /// This doesn't wait for the method body to stop (cancellation is only
    /// advisory) but the token is consumed immediately and any results the
    /// method goes on to produce are discarded.
    pub fn cancel(&self, token: &ContextToken) -> Result<()> {
        let context = self.remove(token)
                          .ok_or_else(|| Error::InvalidContext(token.clone()))?;
        context.detach();
        if let Some(unit) = context.take_unit() {
            unit.detach();
        }

        debug!("Cancelled method invocation {}", token);
        let _ = self.event_bus.send(BrokerEvent::MethodCancelled { token: token.clone() });
        Ok(())
    }

    /// Whether the method body for `token` has finished and its results are
    /// waiting to be collected.
    pub fn is_complete(&self, token: &ContextToken) -> Result<bool> {
        Ok(self.lookup(token)?.is_settled())
    }

    pub fn contains(&self, token: &ContextToken) -> bool {
        self.contexts.contains_key(token)
    }

    /// The number of invocations in the context table (running, or
    /// completed but not yet collected)
    pub fn in_flight(&self) -> usize {
        self.contexts.len()
    }

    pub fn events(&self) -> Result<impl Stream<Item = BrokerEvent>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             if let Ok(x) = x {
                                                 Some(x)
                                             } else {
                                                 None
                                             }
                                         }))
    }

    /// Cancels every outstanding invocation and waits for all of their
    /// worker threads to exit.
    ///
    /// Method bodies only stop once they notice they've been cancelled so
    /// this blocks for as long as the slowest of them takes to do that.
    pub fn shutdown(self) {
        for unit in self.inner.cancel_all() {
            unit.join();
        }
    }
}

impl BrokerInner {
    fn cancel_all(&self) -> Vec<ExecutionUnit> {
        let tokens: Vec<ContextToken> = self.contexts.iter().map(|entry| entry.key().clone()).collect();

        let mut units = vec![];
        for token in tokens {
            if let Some((_, context)) = self.contexts.remove(&token) {
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                context.detach();
                if let Some(unit) = context.take_unit() {
                    units.push(unit);
                }
                let _ = self.event_bus.send(BrokerEvent::MethodCancelled { token });
            }
        }
        units
    }
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        let units = self.cancel_all();
        if !units.is_empty() {
            trace!("Detaching {} outstanding workers", units.len());
        }
        for unit in units {
            unit.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Invocation};
    use crate::{MethodError, MethodStatus, Payload};
    use uuid::Uuid;

    async fn wait_for_cancel(invocation: Invocation) -> std::result::Result<Payload, MethodError> {
        invocation.cancellation().cancelled().await;
        Err(MethodError::Aborted)
    }

    fn echo_broker() -> MethodBroker {
        MethodBroker::new(handler_fn(|invocation| async move {
            Ok(invocation.arguments().clone())
        })).unwrap()
    }

    #[test]
    fn thread_names_use_prefix() {
        let broker = BrokerConfig::new()
            .set_thread_name("gatt-method")
            .build(handler_fn(|_| async move {
                Ok(Payload::from(std::thread::current().name().unwrap_or_default()))
            }))
            .unwrap();

        let token = broker.start(StartParameters::new(Uuid::nil(), "")).unwrap();
        let completion = broker.end_blocking(&token).unwrap();
        assert_eq!(completion.results, Some(Payload::from("gatt-method-0")));
    }

    #[test]
    fn zero_event_capacity_rejected() {
        let result = BrokerConfig::new()
            .set_event_capacity(0)
            .build(handler_fn(|_| async { Ok(Payload::new()) }));
        assert!(matches!(result, Err(Error::Initialization(_))));
    }

    #[test]
    fn try_end_polls_without_consuming() {
        let broker = MethodBroker::new(handler_fn(wait_for_cancel)).unwrap();
        let token = broker.start(StartParameters::new(Uuid::nil(), "slow")).unwrap();

        assert!(matches!(broker.try_end(&token), Ok(None)));
        assert_eq!(broker.is_complete(&token).unwrap(), false);
        assert!(broker.contains(&token));

        broker.cancel(&token).unwrap();
        assert!(matches!(broker.try_end(&token), Err(Error::InvalidContext(_))));
    }

    #[test]
    fn try_end_collects_completed() {
        let broker = echo_broker();
        let token = broker.start(StartParameters::new(Uuid::nil(), "ping")).unwrap();
        while !broker.is_complete(&token).unwrap() {
            std::thread::sleep(Duration::from_millis(1));
        }
        let completion = broker.try_end(&token).unwrap().unwrap();
        assert_eq!(completion.status, MethodStatus::Succeeded);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn end_timeout_leaves_invocation_in_place() {
        let broker = MethodBroker::new(handler_fn(wait_for_cancel)).unwrap();
        let token = broker.start(StartParameters::new(Uuid::nil(), "slow")).unwrap();

        let result = broker.end_timeout(&token, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(broker.contains(&token));

        broker.cancel(&token).unwrap();
        assert!(!broker.contains(&token));
    }

    #[test]
    fn shutdown_cancels_and_joins() {
        let broker = MethodBroker::new(handler_fn(wait_for_cancel)).unwrap();
        let tokens: Vec<ContextToken> =
            (0..4).map(|_| broker.start(StartParameters::new(Uuid::nil(), "slow")).unwrap())
                  .collect();
        assert_eq!(broker.in_flight(), 4);

        let other_handle = broker.clone();
        broker.shutdown();
        assert_eq!(other_handle.in_flight(), 0);
        for token in &tokens {
            assert!(matches!(other_handle.end_blocking(token), Err(Error::InvalidContext(_))));
        }
    }

    #[tokio::test]
    async fn events_report_completion_and_cancellation() {
        let broker = MethodBroker::new(handler_fn(|invocation| async move {
            if invocation.arguments().as_bytes() == b"slow" {
                wait_for_cancel(invocation).await
            } else {
                Ok(Payload::from("pong"))
            }
        })).unwrap();
        let events = broker.events().unwrap();
        tokio::pin!(events);

        let fast = broker.start(StartParameters::new(Uuid::nil(), "ping")).unwrap();
        match events.next().await {
            Some(BrokerEvent::MethodCompleted { token, succeeded, .. }) => {
                assert_eq!(token, fast);
                assert!(succeeded);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let slow = broker.start(StartParameters::new(Uuid::nil(), "slow")).unwrap();
        broker.cancel(&slow).unwrap();
        match events.next().await {
            Some(BrokerEvent::MethodCancelled { token, .. }) => assert_eq!(token, slow),
            other => panic!("unexpected event {:?}", other),
        }

        assert!(broker.end(&fast).await.is_ok());
    }
}
