//! Named channels

use crate::context::{Context, ReplyFuture};
use crate::error::PostMessageError;
use crate::registry::{ChannelEntry, Handler};
use crate::table::ExecutionUnitId;
use crate::value::Value;
use futures::FutureExt;
use std::future::Future;
use std::rc::Rc;

/// A named endpoint registered in a Context
///
/// Constructing a channel registers it under its name, replacing any earlier
/// channel with the same name. Channels are never unregistered; dropping the
/// value leaves the registration (and its handler) in place.
#[derive(Clone)]
pub struct Channel {
    entry: Rc<ChannelEntry>,
    context: Context,
}

impl Channel {
    /// Register a channel without a handler
    pub fn new(context: &Context, name: impl Into<String>) -> Self {
        Self {
            entry: context.register_channel(name.into()),
            context: context.clone(),
        }
    }

    /// Register a channel and set its handler
    pub fn with_handler<F, Fut>(context: &Context, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, ExecutionUnitId) -> Fut + 'static,
        Fut: Future<Output = Value> + 'static,
    {
        let channel = Self::new(context, name);
        channel.set_handler(handler);
        channel
    }

    /// Channel name
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// Owning Context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Set the handler answering `message` and `post_message` envelopes
    ///
    /// The handler receives the value and the unit that sent it.
    pub fn set_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Value, ExecutionUnitId) -> Fut + 'static,
        Fut: Future<Output = Value> + 'static,
    {
        let handler: Handler = Rc::new(move |value, origin| handler(value, origin).boxed_local());
        self.entry.set_handler(Some(handler));
    }

    /// Remove the handler; incoming calls get a no-handler reply
    pub fn clear_handler(&self) {
        self.entry.set_handler(None);
    }

    /// Check whether a handler is set
    pub fn has_handler(&self) -> bool {
        self.entry.handler().is_some()
    }

    /// Send a request to the channel of the same name on `target`
    pub fn send(&self, target: ExecutionUnitId, value: impl Into<Value>) -> ReplyFuture {
        self.context.send_message(target, self.name(), value)
    }

    /// Post a fire-and-forget message to the channel of the same name on `target`
    pub fn post(&self, target: ExecutionUnitId, value: impl Into<Value>) -> Result<(), PostMessageError> {
        self.context.post_message(target, self.name(), value)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("unit", &self.context.unit())
            .field("has_handler", &self.has_handler())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;
    use crate::error::SendMessageError;
    use crate::table::FunctionTable;
    use crate::testing::LoopbackTable;
    use std::sync::Arc;

    fn contexts() -> (Context, Context) {
        let table: Arc<dyn FunctionTable> = LoopbackTable::new();
        (
            Context::new(table.clone(), ContextOptions::default()).unwrap(),
            Context::new(table, ContextOptions::default()).unwrap(),
        )
    }

    #[test]
    fn test_channel_send_and_post() {
        let (a, b) = contexts();
        let counter = Channel::with_handler(&b, "counter", |v, _| async move {
            Value::I64(v.as_i64().unwrap_or(0) * 2)
        });
        assert!(counter.has_handler());

        let client = Channel::new(&a, "counter");
        let reply = client.send(b.unit(), 21i64);
        client.post(b.unit(), 1i64).unwrap();
        b.run_until_stalled();
        assert_eq!(a.run_until(reply), Ok(Value::I64(42)));
    }

    #[test]
    fn test_reregistering_replaces_handler() {
        let (a, b) = contexts();
        let _old = Channel::with_handler(&b, "svc", |_, _| async { Value::from("old") });
        let _new = Channel::with_handler(&b, "svc", |_, _| async { Value::from("new") });

        let reply = a.send_message(b.unit(), "svc", Value::Null);
        b.run_until_stalled();
        assert_eq!(a.run_until(reply), Ok(Value::from("new")));
    }

    #[test]
    fn test_clear_handler() {
        let (a, b) = contexts();
        let svc = Channel::with_handler(&b, "svc", |v, _| async move { v });
        svc.clear_handler();

        let reply = a.send_message(b.unit(), "svc", Value::Null);
        b.run_until_stalled();
        assert_eq!(
            a.run_until(reply),
            Err(SendMessageError::NoHandler {
                channel: "svc".to_string()
            })
        );
    }

    #[test]
    fn test_registration_outlives_channel_value() {
        let (a, b) = contexts();
        drop(Channel::with_handler(&b, "kept", |_, _| async { Value::Bool(true) }));

        let reply = a.send_message(b.unit(), "kept", Value::Null);
        b.run_until_stalled();
        assert_eq!(a.run_until(reply), Ok(Value::Bool(true)));
    }
}
