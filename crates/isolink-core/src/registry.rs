//! Channel registry
//!
//! Maps channel names to their entries within one Context. Registration is
//! last-writer-wins; there is no unregister.

use crate::table::ExecutionUnitId;
use crate::value::Value;
use futures::future::LocalBoxFuture;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Channel handler: request value and origin unit in, reply value out
pub type Handler = Rc<dyn Fn(Value, ExecutionUnitId) -> LocalBoxFuture<'static, Value>>;

/// A registered channel
pub struct ChannelEntry {
    name: String,
    handler: RefCell<Option<Handler>>,
}

impl ChannelEntry {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            handler: RefCell::new(None),
        }
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current handler, if one is set
    pub fn handler(&self) -> Option<Handler> {
        self.handler.borrow().clone()
    }

    pub(crate) fn set_handler(&self, handler: Option<Handler>) {
        *self.handler.borrow_mut() = handler;
    }
}

/// Name to channel map owned by one Context
#[derive(Default)]
pub struct ChannelRegistry {
    channels: FxHashMap<String, Rc<ChannelEntry>>,
}

impl ChannelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous one with the same name
    pub fn register(&mut self, entry: Rc<ChannelEntry>) -> Option<Rc<ChannelEntry>> {
        self.channels.insert(entry.name.clone(), entry)
    }

    /// Look up a channel by name
    pub fn lookup(&self, name: &str) -> Option<Rc<ChannelEntry>> {
        self.channels.get(name).cloned()
    }

    /// Number of registered channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_lookup_missing() {
        let registry = ChannelRegistry::new();
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let mut registry = ChannelRegistry::new();
        let first = Rc::new(ChannelEntry::new("ch".to_string()));
        let second = Rc::new(ChannelEntry::new("ch".to_string()));

        assert!(registry.register(first.clone()).is_none());
        let replaced = registry.register(second.clone()).unwrap();
        assert!(Rc::ptr_eq(&replaced, &first));
        assert!(Rc::ptr_eq(&registry.lookup("ch").unwrap(), &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handler_set_and_clear() {
        let entry = ChannelEntry::new("ch".to_string());
        assert!(entry.handler().is_none());

        let handler: Handler = Rc::new(|v, _| async move { v }.boxed_local());
        entry.set_handler(Some(handler));
        assert!(entry.handler().is_some());

        entry.set_handler(None);
        assert!(entry.handler().is_none());
    }
}
