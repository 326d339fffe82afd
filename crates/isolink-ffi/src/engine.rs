//! Engine component lookup
//!
//! Maps the opaque 64-bit handle assigned when a plugin registers with an
//! engine to that engine's view, binary messenger and texture registry.
//! Entries are never removed: there is one per engine instance for the
//! lifetime of the process.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

static ENGINES: Lazy<EngineRegistry> = Lazy::new(EngineRegistry::new);

/// Process-wide engine table
pub fn engines() -> &'static EngineRegistry {
    &ENGINES
}

/// Opaque native pointer owned by the embedder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawHandle(usize);

impl RawHandle {
    /// Null handle
    pub const NULL: RawHandle = RawHandle(0);

    /// Wrap a pointer
    pub fn from_ptr<T>(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }

    /// Get the pointer back
    pub fn as_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    /// Check for null
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Handle identifying a registered engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(i64);

impl EngineHandle {
    /// Create a handle from its raw value
    pub const fn new(handle: i64) -> Self {
        Self(handle)
    }

    /// Get the raw handle value
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// Per-engine native objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineComponents {
    /// Platform view
    pub view: RawHandle,
    /// Binary messenger
    pub binary_messenger: RawHandle,
    /// Texture registry
    pub texture_registry: RawHandle,
}

/// Engine lookup errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// No engine was registered under this handle
    #[error("Unknown engine handle: {0}")]
    UnknownEngine(EngineHandle),
}

/// Table of engines keyed by handle
pub struct EngineRegistry {
    engines: DashMap<EngineHandle, EngineComponents>,
    next_handle: AtomicI64,
}

impl EngineRegistry {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            engines: DashMap::new(),
            next_handle: AtomicI64::new(1),
        }
    }

    /// Register an engine and return its handle
    pub fn register(&self, components: EngineComponents) -> EngineHandle {
        let handle = EngineHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.engines.insert(handle, components);
        tracing::debug!(target: "isolink::backend", %handle, "engine registered");
        handle
    }

    /// Look up an engine's components
    pub fn get(&self, handle: EngineHandle) -> Result<EngineComponents, EngineError> {
        self.engines
            .get(&handle)
            .map(|entry| *entry.value())
            .ok_or(EngineError::UnknownEngine(handle))
    }

    /// Number of registered engines
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Check if no engine is registered
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = EngineRegistry::new();
        let mut view = 1u8;
        let components = EngineComponents {
            view: RawHandle::from_ptr(&mut view as *mut u8),
            ..Default::default()
        };

        let handle = registry.register(components);
        assert_eq!(registry.get(handle), Ok(components));
        assert!(registry.get(handle).unwrap().binary_messenger.is_null());
    }

    #[test]
    fn test_unknown_engine() {
        let registry = EngineRegistry::new();
        let handle = EngineHandle::new(12);
        assert_eq!(registry.get(handle), Err(EngineError::UnknownEngine(handle)));
    }

    #[test]
    fn test_handles_are_unique() {
        let registry = EngineRegistry::new();
        let a = registry.register(EngineComponents::default());
        let b = registry.register(EngineComponents::default());
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }
}
