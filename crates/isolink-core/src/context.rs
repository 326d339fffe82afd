//! Context and dispatcher
//!
//! A Context is the per-execution-unit endpoint of the bridge. It owns:
//! - The inbound port registered with the native backend
//! - The channel registry
//! - The pending-reply table and its reply-id counter
//! - A cooperative run loop executing the dispatcher and channel handlers
//!
//! All of this state is single-threaded. Contexts on different threads run
//! in parallel and only meet inside the backend's function table.

use crate::codec::CodecOptions;
use crate::envelope::{Envelope, ReplyId};
use crate::error::{ContextError, HandleError, PostMessageError, SendMessageError};
use crate::handle::{HandleId, HandleRef, NativeResource};
use crate::registry::{ChannelEntry, ChannelRegistry};
use crate::run_loop::{RunLoop, RunLoopSender, ScheduledTask};
use crate::table::{BackendToken, ExecutionUnitId, FunctionTable, Packet};
use crate::value::Value;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

thread_local! {
    // Deduplication cache: one Context per backend on each thread
    static CONTEXTS: RefCell<FxHashMap<BackendToken, Weak<ContextInner>>> =
        RefCell::new(FxHashMap::default());
}

/// Configuration applied when a Context is created
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Codec nesting limit for messages sent and received
    pub max_depth: usize,

    /// Name included in log events
    pub debug_name: Option<String>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_depth: crate::codec::DEFAULT_MAX_DEPTH,
            debug_name: None,
        }
    }
}

impl ContextOptions {
    /// Set the codec nesting limit
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the name used in log events
    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }

    /// Codec options derived from these settings
    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions::default().with_max_depth(self.max_depth)
    }
}

type PendingReply = oneshot::Sender<Result<Value, SendMessageError>>;

struct EventRoute {
    id: u64,
    events: mpsc::UnboundedSender<Value>,
}

struct ContextInner {
    unit: ExecutionUnitId,
    table: Arc<dyn FunctionTable>,
    options: ContextOptions,
    codec: CodecOptions,
    run_loop: RunLoop,
    channels: RefCell<ChannelRegistry>,
    pending: RefCell<FxHashMap<ReplyId, PendingReply>>,
    next_reply_id: Cell<i64>,
    // Event streams by channel name, then by the unit posting the events;
    // the newest route of a pair receives
    event_routes: RefCell<FxHashMap<String, FxHashMap<ExecutionUnitId, Vec<EventRoute>>>>,
    next_route_id: Cell<u64>,
    closed: Cell<bool>,
}

/// Per-execution-unit channel endpoint
///
/// Cheap to clone; clones refer to the same Context. The execution unit is
/// unregistered on [`Context::shutdown`] or when the last clone is dropped.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    /// Get this thread's Context for `table`, creating it on first use
    ///
    /// Fails with `ContextError::NotInitialized` if the backend is not up.
    pub fn get_or_init(table: &Arc<dyn FunctionTable>) -> Result<Self, ContextError> {
        Self::get_or_init_with(table, ContextOptions::default())
    }

    /// Like [`Context::get_or_init`]; `options` apply only if a Context is created
    pub fn get_or_init_with(
        table: &Arc<dyn FunctionTable>,
        options: ContextOptions,
    ) -> Result<Self, ContextError> {
        let token = table.token();
        let cached = CONTEXTS.with(|contexts| contexts.borrow().get(&token).and_then(Weak::upgrade));
        if let Some(inner) = cached {
            return Ok(Self { inner });
        }

        let context = Self::new(table.clone(), options)?;
        CONTEXTS.with(|contexts| {
            contexts
                .borrow_mut()
                .insert(token, Rc::downgrade(&context.inner))
        });
        Ok(context)
    }

    /// Create a Context with its own execution unit, bypassing the cache
    ///
    /// Lets one thread host several units; most callers want
    /// [`Context::get_or_init`].
    pub fn new(table: Arc<dyn FunctionTable>, options: ContextOptions) -> Result<Self, ContextError> {
        let (port, receiver) = mpsc::unbounded::<Packet>();
        let unit = table.register_execution_unit(Box::new(port))?;

        let inner = Rc::new(ContextInner {
            unit,
            table,
            codec: options.codec_options(),
            options,
            run_loop: RunLoop::new(),
            channels: RefCell::new(ChannelRegistry::new()),
            pending: RefCell::new(FxHashMap::default()),
            next_reply_id: Cell::new(1),
            event_routes: RefCell::new(FxHashMap::default()),
            next_route_id: Cell::new(1),
            closed: Cell::new(false),
        });
        inner
            .run_loop
            .spawn(dispatch(Rc::downgrade(&inner), receiver));

        tracing::debug!(
            target: "isolink::context",
            unit = %unit,
            name = inner.options.debug_name.as_deref().unwrap_or(""),
            "context initialized"
        );
        Ok(Self { inner })
    }

    /// Execution unit this Context receives on
    pub fn unit(&self) -> ExecutionUnitId {
        self.inner.unit
    }

    /// Options the Context was created with
    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    /// Backend this Context is registered with
    pub fn table(&self) -> &Arc<dyn FunctionTable> {
        &self.inner.table
    }

    /// Check whether the Context was shut down
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Number of calls still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    // ===== Messaging =====

    /// Send a request and get a future for its reply
    ///
    /// The request is posted before this returns; awaiting the future only
    /// waits for the reply. Dropping the future abandons the call.
    pub fn send_message(
        &self,
        target: ExecutionUnitId,
        channel: &str,
        value: impl Into<Value>,
    ) -> ReplyFuture {
        let inner = &self.inner;
        if inner.closed.get() {
            return ReplyFuture::failed(SendMessageError::ContextClosed);
        }

        let reply_id = ReplyId::new(inner.next_reply_id.get());
        inner.next_reply_id.set(reply_id.as_i64() + 1);

        let (sender, receiver) = oneshot::channel();
        inner.pending.borrow_mut().insert(reply_id, sender);

        let envelope = Envelope::Message {
            reply_id,
            channel: channel.to_string(),
            value: value.into(),
        };
        if let Err(e) = inner.post_envelope(target, envelope) {
            inner.pending.borrow_mut().remove(&reply_id);
            tracing::debug!(target: "isolink::context", %reply_id, "send failed: {}", e);
            return ReplyFuture::failed(e.into());
        }

        tracing::trace!(target: "isolink::context", %reply_id, channel, to = %target, "message sent");
        ReplyFuture {
            reply_id: Some(reply_id),
            state: ReplyState::Pending(receiver),
        }
    }

    /// Post a fire-and-forget message
    pub fn post_message(
        &self,
        target: ExecutionUnitId,
        channel: &str,
        value: impl Into<Value>,
    ) -> Result<(), PostMessageError> {
        self.inner.post_envelope(
            target,
            Envelope::PostMessage {
                channel: channel.to_string(),
                value: value.into(),
            },
        )
    }

    // ===== Handles =====

    /// Attach a native resource under a fresh handle id
    pub fn attach_handle(&self, resource: NativeResource) -> Result<HandleRef, HandleError> {
        let id = self.inner.table.next_handle_id();
        self.attach_handle_with_id(id, resource)
    }

    /// Attach a native resource under `id`, or get the live proxy for it
    pub fn attach_handle_with_id(
        &self,
        id: HandleId,
        resource: NativeResource,
    ) -> Result<HandleRef, HandleError> {
        if self.inner.closed.get() {
            return Err(HandleError::ContextClosed);
        }
        self.inner
            .table
            .attach_weak_handle(self.inner.unit, id, resource)
    }

    // ===== Run Loop =====

    /// Queue a task on this Context's run loop
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.inner.run_loop.spawn(future);
    }

    /// Run `callback` on this Context's loop once `delay` has elapsed
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + 'static) -> ScheduledTask {
        self.inner.run_loop.schedule(delay, callback)
    }

    /// Thread-safe handle for queuing closures onto this Context's loop
    ///
    /// Closures sent after the Context is dropped fail with
    /// `ContextError::Closed`.
    pub fn sender(&self) -> RunLoopSender {
        self.inner.run_loop.sender()
    }

    /// Process inbound envelopes and tasks until nothing is ready
    pub fn run_until_stalled(&self) {
        self.inner.run_loop.run_until_stalled();
    }

    /// Process inbound envelopes and tasks until `future` completes
    ///
    /// # Panics
    /// Panics if called from a task running on this Context.
    pub fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.inner.run_loop.run_until(future)
    }

    // ===== Lifecycle =====

    /// Tear the Context down
    ///
    /// Unregisters the execution unit and resolves every pending call with
    /// `ContextClosed`. Later sends, posts and attaches fail with
    /// `ContextClosed`. Calling it again has no effect.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.replace(true) {
            return;
        }
        inner.table.unregister_execution_unit(inner.unit);

        // Ends every event stream listening through this Context
        inner.event_routes.borrow_mut().clear();

        let pending: Vec<_> = inner.pending.borrow_mut().drain().collect();
        for (_, sender) in pending {
            let _ = sender.send(Err(SendMessageError::ContextClosed));
        }

        let token = inner.table.token();
        let this = Rc::downgrade(inner);
        let _ = CONTEXTS.try_with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            if contexts.get(&token).map_or(false, |c| c.ptr_eq(&this)) {
                contexts.remove(&token);
            }
        });
        tracing::debug!(target: "isolink::context", unit = %inner.unit, "context shut down");
    }

    /// Non-owning reference to this Context
    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Route `post_message`s on `channel` from `target` into `events`
    ///
    /// The new route takes precedence over earlier ones for the same pair
    /// until it is removed. Returns the route id.
    pub(crate) fn add_event_route(
        &self,
        channel: String,
        target: ExecutionUnitId,
        events: mpsc::UnboundedSender<Value>,
    ) -> u64 {
        let inner = &self.inner;
        let id = inner.next_route_id.get();
        inner.next_route_id.set(id + 1);
        if inner.closed.get() {
            // Dropping `events` ends the stream right away
            return id;
        }
        inner
            .event_routes
            .borrow_mut()
            .entry(channel)
            .or_default()
            .entry(target)
            .or_default()
            .push(EventRoute { id, events });
        id
    }

    /// Remove route `id`; returns whether it was the one receiving events
    pub(crate) fn remove_event_route(&self, channel: &str, target: ExecutionUnitId, id: u64) -> bool {
        self.retain_event_routes(channel, target, |route| route.id != id)
            .unwrap_or(false)
    }

    /// Drop every route of the pair except `id`, ending the older streams
    pub(crate) fn retire_event_routes(&self, channel: &str, target: ExecutionUnitId, id: u64) {
        self.retain_event_routes(channel, target, |route| route.id == id);
    }

    fn retain_event_routes(
        &self,
        channel: &str,
        target: ExecutionUnitId,
        keep: impl Fn(&EventRoute) -> bool,
    ) -> Option<bool> {
        let mut routes = self.inner.event_routes.borrow_mut();
        let by_target = routes.get_mut(channel)?;
        let stack = by_target.get_mut(&target)?;
        let current = stack.last().map(|route| route.id);
        stack.retain(|route| keep(route));
        let removed_current = current.is_some() && stack.last().map(|route| route.id) != current;
        if stack.is_empty() {
            by_target.remove(&target);
        }
        if by_target.is_empty() {
            routes.remove(channel);
        }
        Some(removed_current)
    }

    pub(crate) fn register_channel(&self, name: String) -> Rc<ChannelEntry> {
        let entry = Rc::new(ChannelEntry::new(name));
        if let Some(previous) = self.inner.channels.borrow_mut().register(entry.clone()) {
            tracing::debug!(target: "isolink::context", channel = previous.name(), "channel replaced");
        }
        entry
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("unit", &self.inner.unit)
            .field("name", &self.inner.options.debug_name)
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

/// Non-owning reference to a [`Context`]
#[derive(Clone, Debug)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    /// Get the Context back if it is still alive
    pub fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

async fn dispatch(context: Weak<ContextInner>, mut port: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = port.next().await {
        match context.upgrade() {
            Some(inner) => inner.handle_packet(packet),
            None => break,
        }
    }
}

impl ContextInner {
    fn handle_packet(self: &Rc<Self>, packet: Packet) {
        let origin = packet.origin;
        let envelope = match Envelope::decode(&packet.payload, &self.codec) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    target: "isolink::context",
                    unit = %self.unit,
                    from = %origin,
                    "dropping malformed envelope: {}",
                    e
                );
                return;
            }
        };
        tracing::trace!(target: "isolink::context", kind = envelope.kind(), from = %origin, "envelope received");

        match envelope {
            Envelope::Message {
                reply_id,
                channel,
                value,
            } => self.handle_message(origin, reply_id, channel, value),
            Envelope::PostMessage { channel, value } => self.handle_post(origin, channel, value),
            Envelope::Reply { reply_id, value } => self.resolve(reply_id, Ok(value)),
            Envelope::ReplyNoChannel { reply_id, channel } => {
                self.resolve(reply_id, Err(SendMessageError::NoSuchChannel { channel }))
            }
            Envelope::ReplyNoHandler { reply_id, channel } => {
                self.resolve(reply_id, Err(SendMessageError::NoHandler { channel }))
            }
        }
    }

    fn handle_message(
        self: &Rc<Self>,
        origin: ExecutionUnitId,
        reply_id: ReplyId,
        channel: String,
        value: Value,
    ) {
        let entry = self.channels.borrow().lookup(&channel);
        let handler = match entry {
            Some(entry) => entry.handler(),
            None => {
                self.send_reply(origin, Envelope::ReplyNoChannel { reply_id, channel });
                return;
            }
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                self.send_reply(origin, Envelope::ReplyNoHandler { reply_id, channel });
                return;
            }
        };

        // Each handler runs as its own task so a slow one does not hold up
        // the envelopes behind it
        let context = Rc::downgrade(self);
        self.run_loop.spawn(async move {
            let value = handler(value, origin).await;
            if let Some(inner) = context.upgrade() {
                inner.send_reply(origin, Envelope::Reply { reply_id, value });
            }
        });
    }

    fn handle_post(&self, origin: ExecutionUnitId, channel: String, value: Value) {
        let route = self
            .event_routes
            .borrow()
            .get(&channel)
            .and_then(|by_target| by_target.get(&origin))
            .and_then(|stack| stack.last())
            .map(|route| route.events.clone());
        if let Some(events) = route {
            if events.unbounded_send(value).is_err() {
                tracing::debug!(target: "isolink::context", channel = %channel, from = %origin, "event dropped: stream gone");
            }
            return;
        }

        let handler = self
            .channels
            .borrow()
            .lookup(&channel)
            .and_then(|entry| entry.handler());
        match handler {
            Some(handler) => self.run_loop.spawn(handler(value, origin).map(|_| ())),
            None => {
                tracing::debug!(target: "isolink::context", channel = %channel, "post_message dropped: no handler")
            }
        }
    }

    fn resolve(&self, reply_id: ReplyId, result: Result<Value, SendMessageError>) {
        let pending = self.pending.borrow_mut().remove(&reply_id);
        match pending {
            Some(sender) => {
                if sender.send(result).is_err() {
                    tracing::trace!(target: "isolink::context", %reply_id, "caller abandoned reply");
                }
            }
            None => {
                tracing::warn!(target: "isolink::context", unit = %self.unit, %reply_id, "reply for unknown reply id")
            }
        }
    }

    fn send_reply(&self, target: ExecutionUnitId, envelope: Envelope) {
        let reply_id = envelope.reply_id();
        if let Err(e) = self.post_envelope(target, envelope) {
            tracing::warn!(
                target: "isolink::context",
                to = %target,
                reply_id = reply_id.map(|id| id.as_i64()),
                "failed to send reply: {}",
                e
            );
        }
    }

    fn post_envelope(&self, target: ExecutionUnitId, envelope: Envelope) -> Result<(), PostMessageError> {
        if self.closed.get() {
            return Err(PostMessageError::ContextClosed);
        }
        let payload = envelope.encode(&self.codec)?;
        self.table.post_message(self.unit, target, payload)?;
        Ok(())
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if !self.closed.get() {
            self.table.unregister_execution_unit(self.unit);
            tracing::debug!(target: "isolink::context", unit = %self.unit, "context dropped");
        }
    }
}

// ============================================================================
// Reply Future
// ============================================================================

enum ReplyState {
    Pending(oneshot::Receiver<Result<Value, SendMessageError>>),
    Failed(Option<SendMessageError>),
}

/// Future resolving to the reply of a [`Context::send_message`] call
#[must_use = "the reply is lost unless the future is awaited"]
pub struct ReplyFuture {
    reply_id: Option<ReplyId>,
    state: ReplyState,
}

impl ReplyFuture {
    fn failed(error: SendMessageError) -> Self {
        Self {
            reply_id: None,
            state: ReplyState::Failed(Some(error)),
        }
    }

    /// Reply id of the call, `None` if it failed before being posted
    pub fn reply_id(&self) -> Option<ReplyId> {
        self.reply_id
    }
}

impl Future for ReplyFuture {
    type Output = Result<Value, SendMessageError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Pending(receiver) => receiver
                .poll_unpin(cx)
                .map(|result| result.unwrap_or(Err(SendMessageError::ContextClosed))),
            ReplyState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(SendMessageError::ContextClosed)))
            }
        }
    }
}
