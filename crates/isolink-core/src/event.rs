//! Event channels
//!
//! An event channel is a method channel answering `listen` and `cancel`.
//! Each `listen` hands the [`EventHandler`] an [`EventSink`] bound to the
//! listening unit; events are then posted to that unit as `post_message`
//! envelopes on the channel's name. A second `listen` from the same unit
//! replaces its earlier sink once the new one is accepted.
//!
//! On the listening side an [`EventStream`] does not register a channel.
//! Its Context routes posts on the channel name from the listened unit into
//! the stream, so one Context can listen to several units under the same
//! name and still serve a channel of that name itself.

use crate::context::{Context, WeakContext};
use crate::error::{PostMessageError, SendMessageError};
use crate::method::{self, MethodCallError, MethodChannel, PlatformError};
use crate::table::ExecutionUnitId;
use crate::value::Value;
use futures::channel::mpsc;
use futures::future::LocalBoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

/// Method a listener calls to subscribe
pub const LISTEN: &str = "listen";

/// Method a listener calls to unsubscribe
pub const CANCEL: &str = "cancel";

type ExpireFn = Rc<dyn Fn(ExecutionUnitId, i64)>;

/// Sending side of one subscription
pub struct EventSink {
    id: i64,
    channel: String,
    target: ExecutionUnitId,
    context: WeakContext,
    expire: ExpireFn,
}

impl EventSink {
    /// Sink id, unique within its event channel
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Unit receiving the events
    pub fn target(&self) -> ExecutionUnitId {
        self.target
    }

    /// Post one event to the listener
    ///
    /// If the listening unit is gone the send fails with `InvalidTarget` and
    /// the subscription is dropped on the next turn of the run loop.
    pub fn send(&self, event: impl Into<Value>) -> Result<(), PostMessageError> {
        let context = self
            .context
            .upgrade()
            .ok_or(PostMessageError::ContextClosed)?;
        let result = context.post_message(self.target, &self.channel, event);
        if result == Err(PostMessageError::InvalidTarget) {
            let expire = self.expire.clone();
            let (target, id) = (self.target, self.id);
            context.spawn(async move { expire(target, id) });
        }
        result
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("target", &self.target)
            .finish()
    }
}

/// Producer of events for an [`EventChannel`]
pub trait EventHandler: 'static {
    /// A unit subscribed; keep `sink` to send it events
    fn register_event_sink(&mut self, sink: EventSink, args: Value) -> Result<(), PlatformError>;

    /// The subscription with this sink id ended
    ///
    /// Called on `cancel`, when a newer `listen` from the same unit replaces
    /// it, and when the listening unit turns out to be gone.
    fn unregister_event_sink(&mut self, sink_id: i64);
}

struct EventState<H> {
    handler: H,
    next_sink_id: i64,
    sinks: FxHashMap<ExecutionUnitId, i64>,
}

/// Serving side of an event channel
pub struct EventChannel<H: EventHandler> {
    method: MethodChannel,
    state: Rc<RefCell<EventState<H>>>,
}

impl<H: EventHandler> EventChannel<H> {
    /// Register the channel and answer `listen`/`cancel` with `handler`
    pub fn new(context: &Context, name: impl Into<String>, handler: H) -> Self {
        let name = name.into();
        let method = MethodChannel::new(context, name.clone());
        let state = Rc::new(RefCell::new(EventState {
            handler,
            next_sink_id: 1,
            sinks: FxHashMap::default(),
        }));

        let weak_state = Rc::downgrade(&state);
        let expire: ExpireFn = Rc::new(move |unit, id| {
            let state = match weak_state.upgrade() {
                Some(state) => state,
                None => return,
            };
            let mut state = match state.try_borrow_mut() {
                Ok(state) => state,
                Err(_) => {
                    tracing::warn!(target: "isolink::context", sink = id, "event state busy; sink not expired");
                    return;
                }
            };
            if state.sinks.get(&unit) == Some(&id) {
                state.sinks.remove(&unit);
                state.handler.unregister_event_sink(id);
                tracing::debug!(target: "isolink::context", sink = id, %unit, "event sink expired: listener gone");
            }
        });

        let weak_context = context.downgrade();
        let handler_state = state.clone();
        method.set_method_handler(move |call, origin| {
            let result = match call.method.as_str() {
                LISTEN => {
                    let mut state = handler_state.borrow_mut();
                    let id = state.next_sink_id;
                    state.next_sink_id += 1;
                    let sink = EventSink {
                        id,
                        channel: name.clone(),
                        target: origin,
                        context: weak_context.clone(),
                        expire: expire.clone(),
                    };
                    // A rejected listen leaves the current subscription in place
                    match state.handler.register_event_sink(sink, call.args) {
                        Ok(()) => {
                            if let Some(previous) = state.sinks.insert(origin, id) {
                                state.handler.unregister_event_sink(previous);
                            }
                            Ok(Value::Null)
                        }
                        Err(e) => Err(e),
                    }
                }
                CANCEL => {
                    let mut state = handler_state.borrow_mut();
                    if let Some(id) = state.sinks.remove(&origin) {
                        state.handler.unregister_event_sink(id);
                    }
                    Ok(Value::Null)
                }
                other => Err(PlatformError::not_implemented(other)),
            };
            async move { result }
        });

        Self { method, state }
    }

    /// Channel name
    pub fn name(&self) -> &str {
        self.method.channel().name()
    }

    /// Number of active subscriptions
    pub fn listener_count(&self) -> usize {
        self.state.borrow().sinks.len()
    }

    /// Run `f` with the handler borrowed mutably
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.state.borrow_mut().handler)
    }
}

// ============================================================================
// Listening Side
// ============================================================================

struct Subscription {
    context: WeakContext,
    channel: String,
    target: ExecutionUnitId,
    route: u64,
    active: Cell<bool>,
}

impl Subscription {
    fn invoke(&self, method_name: &str) -> LocalBoxFuture<'static, Result<Value, MethodCallError>> {
        match self.context.upgrade() {
            Some(context) => {
                method::invoke(&context, self.target, &self.channel, method_name, Value::Null)
                    .boxed_local()
            }
            None => async { Err(MethodCallError::Send(SendMessageError::ContextClosed)) }.boxed_local(),
        }
    }

    // Drops the route, which ends the stream once buffered events are read.
    // Returns whether this route was the one receiving events.
    fn close(&self) -> bool {
        if !self.active.replace(false) {
            return false;
        }
        self.context
            .upgrade()
            .map_or(false, |context| context.remove_event_route(&self.channel, self.target, self.route))
    }

    // A newer listen to the same unit was accepted; its route takes over
    fn retire_older(&self) {
        if let Some(context) = self.context.upgrade() {
            context.retire_event_routes(&self.channel, self.target, self.route);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // A replaced stream must not cancel the subscription that replaced it
        if self.close() {
            // The cancel is posted right away; its reply is not awaited
            drop(self.invoke(CANCEL));
            tracing::debug!(target: "isolink::context", channel = %self.channel, to = %self.target, "event stream dropped");
        }
    }
}

/// Listening side of an event channel
///
/// Yields the events posted by the serving unit and ends after a successful
/// [`cancel`](EventStream::cancel) or when the listening Context shuts down.
/// Dropping the stream cancels the subscription.
pub struct EventStream {
    subscription: Rc<Subscription>,
    events: mpsc::UnboundedReceiver<Value>,
}

impl EventStream {
    /// Subscribe to the event channel `name` on `target`
    ///
    /// Once accepted, the new stream replaces any earlier stream from this
    /// Context to the same channel and unit; the earlier one ends.
    pub fn listen(
        context: &Context,
        name: impl Into<String>,
        target: ExecutionUnitId,
        args: impl Into<Value>,
    ) -> impl Future<Output = Result<EventStream, MethodCallError>> {
        let channel = name.into();
        let (sender, events) = mpsc::unbounded();
        let route = context.add_event_route(channel.clone(), target, sender);
        let subscribed = method::invoke(context, target, &channel, LISTEN, args);
        let subscription = Rc::new(Subscription {
            context: context.downgrade(),
            channel,
            target,
            route,
            active: Cell::new(true),
        });

        async move {
            match subscribed.await {
                Ok(_) => {
                    subscription.retire_older();
                    Ok(EventStream {
                        subscription,
                        events,
                    })
                }
                // An earlier stream from the same unit keeps receiving
                Err(e) => {
                    subscription.close();
                    Err(e)
                }
            }
        }
    }

    /// Unit the events come from
    pub fn target(&self) -> ExecutionUnitId {
        self.subscription.target
    }

    /// Unsubscribe; the stream ends once the serving unit acknowledges
    ///
    /// Events received before that stay readable.
    pub fn cancel(&self) -> impl Future<Output = Result<(), MethodCallError>> {
        let subscription = self.subscription.clone();
        let reply = subscription.invoke(CANCEL);
        async move {
            reply.await?;
            subscription.close();
            Ok(())
        }
    }
}

impl Stream for EventStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Value>> {
        self.events.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::context::ContextOptions;
    use crate::table::FunctionTable;
    use crate::testing::LoopbackTable;
    use std::sync::Arc;

    #[derive(Default)]
    struct Ticker {
        sinks: Vec<EventSink>,
        unregistered: Vec<i64>,
    }

    impl Ticker {
        fn tick(&self, value: i64) -> Vec<Result<(), PostMessageError>> {
            self.sinks.iter().map(|sink| sink.send(value)).collect()
        }
    }

    impl EventHandler for Ticker {
        fn register_event_sink(&mut self, sink: EventSink, args: Value) -> Result<(), PlatformError> {
            if args.as_str() == Some("reject") {
                return Err(PlatformError::new("rejected"));
            }
            sink.send("hello").map_err(|e| PlatformError::new("send").with_message(e.to_string()))?;
            self.sinks.push(sink);
            Ok(())
        }

        fn unregister_event_sink(&mut self, sink_id: i64) {
            self.sinks.retain(|s| s.id() != sink_id);
            self.unregistered.push(sink_id);
        }
    }

    fn contexts() -> (Context, Context) {
        let table: Arc<dyn FunctionTable> = LoopbackTable::new();
        (
            Context::new(table.clone(), ContextOptions::default()).unwrap(),
            Context::new(table, ContextOptions::default()).unwrap(),
        )
    }

    fn subscribe(server: &Context, client: &Context, args: impl Into<Value>) -> Result<EventStream, MethodCallError> {
        let subscribed = EventStream::listen(client, "ticks", server.unit(), args);
        server.run_until_stalled();
        client.run_until(subscribed)
    }

    #[test]
    fn test_listen_receive_cancel() {
        let (server, client) = contexts();
        let events = EventChannel::new(&server, "ticks", Ticker::default());

        let mut stream = subscribe(&server, &client, Value::Null).unwrap();
        assert_eq!(events.listener_count(), 1);
        assert_eq!(stream.target(), server.unit());

        events.with_handler(|t| t.tick(1));
        events.with_handler(|t| t.tick(2));
        assert_eq!(client.run_until(stream.next()), Some(Value::from("hello")));
        assert_eq!(client.run_until(stream.next()), Some(Value::I64(1)));
        assert_eq!(client.run_until(stream.next()), Some(Value::I64(2)));

        let cancelled = stream.cancel();
        server.run_until_stalled();
        client.run_until(cancelled).unwrap();
        assert_eq!(events.listener_count(), 0);
        assert_eq!(events.with_handler(|t| t.unregistered.clone()), vec![1]);

        // The stream ends once the cancel is acknowledged
        assert_eq!(stream.next().now_or_never(), Some(None));
    }

    #[test]
    fn test_buffered_events_survive_cancel() {
        let (server, client) = contexts();
        let events = EventChannel::new(&server, "ticks", Ticker::default());
        let mut stream = subscribe(&server, &client, Value::Null).unwrap();

        events.with_handler(|t| t.tick(5));
        client.run_until_stalled();
        let cancelled = stream.cancel();
        server.run_until_stalled();
        client.run_until(cancelled).unwrap();

        assert_eq!(client.run_until(stream.next()), Some(Value::from("hello")));
        assert_eq!(client.run_until(stream.next()), Some(Value::I64(5)));
        assert_eq!(stream.next().now_or_never(), Some(None));
    }

    #[test]
    fn test_dropping_stream_cancels() {
        let (server, client) = contexts();
        let events = EventChannel::new(&server, "ticks", Ticker::default());
        let stream = subscribe(&server, &client, Value::Null).unwrap();
        assert_eq!(events.listener_count(), 1);

        drop(stream);
        server.run_until_stalled();
        assert_eq!(events.listener_count(), 0);

        // Late events to the dropped stream are discarded by the client
        client.run_until_stalled();
    }

    #[test]
    fn test_streams_from_several_units() {
        let table: Arc<dyn FunctionTable> = LoopbackTable::new();
        let first = Context::new(table.clone(), ContextOptions::default()).unwrap();
        let second = Context::new(table.clone(), ContextOptions::default()).unwrap();
        let client = Context::new(table, ContextOptions::default()).unwrap();
        let first_events = EventChannel::new(&first, "ticks", Ticker::default());
        let second_events = EventChannel::new(&second, "ticks", Ticker::default());

        let mut from_first = subscribe(&first, &client, Value::Null).unwrap();
        let mut from_second = subscribe(&second, &client, Value::Null).unwrap();

        first_events.with_handler(|t| t.tick(7));
        second_events.with_handler(|t| t.tick(8));
        client.run_until_stalled();

        assert_eq!(from_first.next().now_or_never(), Some(Some(Value::from("hello"))));
        assert_eq!(from_first.next().now_or_never(), Some(Some(Value::I64(7))));
        assert_eq!(from_second.next().now_or_never(), Some(Some(Value::from("hello"))));
        assert_eq!(from_second.next().now_or_never(), Some(Some(Value::I64(8))));
        assert_eq!(from_first.next().now_or_never(), None);
    }

    #[test]
    fn test_listening_keeps_local_channel_of_same_name() {
        let table: Arc<dyn FunctionTable> = LoopbackTable::new();
        let server = Context::new(table.clone(), ContextOptions::default()).unwrap();
        let client = Context::new(table.clone(), ContextOptions::default()).unwrap();
        let other = Context::new(table, ContextOptions::default()).unwrap();

        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        let _local = Channel::with_handler(&client, "ticks", move |value, _| {
            sink.borrow_mut().push(value);
            async { Value::Null }
        });

        let events = EventChannel::new(&server, "ticks", Ticker::default());
        let mut stream = subscribe(&server, &client, Value::Null).unwrap();

        other.post_message(client.unit(), "ticks", "local").unwrap();
        events.with_handler(|t| t.tick(3));
        client.run_until_stalled();

        assert_eq!(*received.borrow(), vec![Value::from("local")]);
        assert_eq!(stream.next().now_or_never(), Some(Some(Value::from("hello"))));
        assert_eq!(stream.next().now_or_never(), Some(Some(Value::I64(3))));
    }

    #[test]
    fn test_relisten_replaces_sink() {
        let (server, client) = contexts();
        let events = EventChannel::new(&server, "ticks", Ticker::default());

        let mut first = subscribe(&server, &client, Value::Null).unwrap();
        let mut second = subscribe(&server, &client, Value::Null).unwrap();
        assert_eq!(events.listener_count(), 1);
        events.with_handler(|t| {
            assert_eq!(t.sinks.len(), 1);
            assert_eq!(t.unregistered, vec![1]);
        });

        // The replaced stream ends after its buffered events
        assert_eq!(first.next().now_or_never(), Some(Some(Value::from("hello"))));
        assert_eq!(first.next().now_or_never(), Some(None));

        // Dropping it leaves the newer subscription alone
        drop(first);
        server.run_until_stalled();
        assert_eq!(events.listener_count(), 1);

        events.with_handler(|t| t.tick(4));
        client.run_until_stalled();
        assert_eq!(second.next().now_or_never(), Some(Some(Value::from("hello"))));
        assert_eq!(second.next().now_or_never(), Some(Some(Value::I64(4))));
    }

    #[test]
    fn test_listen_rejected() {
        let (server, client) = contexts();
        let events = EventChannel::new(&server, "ticks", Ticker::default());

        match subscribe(&server, &client, "reject") {
            Err(MethodCallError::Platform(err)) => assert_eq!(err.code, "rejected"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("listen should fail"),
        }
        assert_eq!(events.listener_count(), 0);
    }

    #[test]
    fn test_rejected_relisten_keeps_subscription() {
        let (server, client) = contexts();
        let events = EventChannel::new(&server, "ticks", Ticker::default());
        let mut stream = subscribe(&server, &client, Value::Null).unwrap();

        assert!(subscribe(&server, &client, "reject").is_err());
        assert_eq!(events.listener_count(), 1);
        events.with_handler(|t| {
            assert_eq!(t.sinks.len(), 1);
            assert!(t.unregistered.is_empty());
        });
        let results = events.with_handler(|t| t.tick(9));
        assert_eq!(results, vec![Ok(())]);

        // The first stream still receives
        client.run_until_stalled();
        assert_eq!(stream.next().now_or_never(), Some(Some(Value::from("hello"))));
        assert_eq!(stream.next().now_or_never(), Some(Some(Value::I64(9))));
    }

    #[test]
    fn test_sink_expires_when_listener_gone() {
        let (server, client) = contexts();
        let events = EventChannel::new(&server, "ticks", Ticker::default());
        let stream = subscribe(&server, &client, Value::Null).unwrap();

        client.shutdown();
        drop(stream);
        drop(client);

        let results = events.with_handler(|t| t.tick(1));
        assert_eq!(results, vec![Err(PostMessageError::InvalidTarget)]);
        server.run_until_stalled();

        assert_eq!(events.listener_count(), 0);
        events.with_handler(|t| {
            assert!(t.sinks.is_empty());
            assert_eq!(t.unregistered, vec![1]);
        });
    }

    #[test]
    fn test_shutdown_ends_stream() {
        let (server, client) = contexts();
        let _events = EventChannel::new(&server, "ticks", Ticker::default());
        let mut stream = subscribe(&server, &client, Value::Null).unwrap();

        client.shutdown();
        assert_eq!(stream.next().now_or_never(), Some(Some(Value::from("hello"))));
        assert_eq!(stream.next().now_or_never(), Some(None));
    }

    #[test]
    fn test_sink_after_context_dropped() {
        let (server, client) = contexts();
        let sink = EventSink {
            id: 1,
            channel: "ticks".to_string(),
            target: client.unit(),
            context: server.downgrade(),
            expire: Rc::new(|_, _| {}),
        };
        drop(server);
        assert_eq!(sink.send(1i64), Err(PostMessageError::ContextClosed));
    }
}
