//! Handle bridge
//!
//! Associates small integer ids with native-owned payloads. Each attached
//! payload is represented by a single proxy (`HandleRef`). When the last clone
//! of a proxy goes away its release callback runs, exactly once.
//!
//! Attaching is idempotent per id: while a proxy for an id is alive, attaching
//! the same id again returns that proxy. The duplicate resource passed to the
//! second call is dropped without running its release callback, so the native
//! payload is released once in total.

use crate::table::ExecutionUnitId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Handle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(i64);

impl HandleId {
    /// Create a handle id from its raw value
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id value
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Payload = Box<dyn Any + Send + Sync>;
type ReleaseFn = Box<dyn FnOnce(Payload) + Send>;

/// A native payload together with its optional release callback
pub struct NativeResource {
    payload: Payload,
    release: Option<ReleaseFn>,
}

impl NativeResource {
    /// Payload without a release callback
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            payload: Box::new(payload),
            release: None,
        }
    }

    /// Payload with a callback invoked when the last proxy is dropped
    pub fn with_release<T, F>(payload: T, release: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            payload: Box::new(payload),
            release: Some(Box::new(move |payload: Payload| {
                if let Ok(payload) = payload.downcast::<T>() {
                    release(*payload);
                }
            })),
        }
    }

    /// Check whether a release callback is set
    pub fn has_release(&self) -> bool {
        self.release.is_some()
    }
}

impl fmt::Debug for NativeResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeResource")
            .field("has_release", &self.has_release())
            .finish()
    }
}

// ============================================================================
// Bridge
// ============================================================================

struct Entry {
    proxy: Weak<HandleInner>,
    generation: u64,
}

struct BridgeState {
    entries: FxHashMap<HandleId, Entry>,
    next_id: i64,
    next_generation: u64,
}

/// Process-wide handle table
///
/// Cheap to clone; clones share the same id space.
#[derive(Clone)]
pub struct HandleBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl HandleBridge {
    /// Create an empty bridge
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BridgeState {
                entries: FxHashMap::default(),
                next_id: 1,
                next_generation: 0,
            })),
        }
    }

    /// Allocate a fresh handle id
    pub fn next_id(&self) -> HandleId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        HandleId(id)
    }

    /// Attach a payload under `id`, or return the live proxy already attached
    pub fn attach(
        &self,
        unit: ExecutionUnitId,
        id: HandleId,
        resource: NativeResource,
    ) -> HandleRef {
        let mut state = self.state.lock();

        if let Some(existing) = state.entries.get(&id).and_then(|e| e.proxy.upgrade()) {
            tracing::trace!(target: "isolink::handle", %id, "attach: returning live proxy");
            drop(state);
            // Dropped without release; the live proxy owns the payload
            drop(resource);
            return HandleRef { inner: existing };
        }

        // Ids handed out by the caller must not collide with future allocations
        if id.0 >= state.next_id {
            state.next_id = id.0 + 1;
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let inner = Arc::new(HandleInner {
            id,
            unit,
            generation,
            payload: Some(resource.payload),
            release: Mutex::new(resource.release),
            bridge: Arc::downgrade(&self.state),
        });
        // A dead proxy still in the table is finishing its release; replacing
        // it is safe because removal is generation-checked
        state.entries.insert(
            id,
            Entry {
                proxy: Arc::downgrade(&inner),
                generation,
            },
        );
        tracing::trace!(target: "isolink::handle", %id, unit = unit.as_i64(), "attached");
        HandleRef { inner }
    }

    /// Check whether a live proxy exists for `id`
    pub fn is_attached(&self, id: HandleId) -> bool {
        self.state
            .lock()
            .entries
            .get(&id)
            .map_or(false, |e| e.proxy.strong_count() > 0)
    }

    /// Get the live proxy for `id`, if any
    pub fn get(&self, id: HandleId) -> Option<HandleRef> {
        let state = self.state.lock();
        let inner = state.entries.get(&id)?.proxy.upgrade()?;
        Some(HandleRef { inner })
    }

    /// Number of ids with a table entry
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleBridge")
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Proxy
// ============================================================================

struct HandleInner {
    id: HandleId,
    unit: ExecutionUnitId,
    generation: u64,
    payload: Option<Payload>,
    release: Mutex<Option<ReleaseFn>>,
    bridge: Weak<Mutex<BridgeState>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.upgrade() {
            let mut state = bridge.lock();
            if state
                .entries
                .get(&self.id)
                .map_or(false, |e| e.generation == self.generation)
            {
                state.entries.remove(&self.id);
            }
        }

        // Runs outside the table lock so the callback may attach again
        let release = self.release.get_mut().take();
        if let (Some(release), Some(payload)) = (release, self.payload.take()) {
            tracing::trace!(target: "isolink::handle", id = %self.id, "releasing payload");
            release(payload);
        }
    }
}

/// Finalizer-aware proxy for an attached native payload
///
/// Clones share the proxy; the release callback runs when the last clone is
/// dropped. Two references are equal when they are the same proxy.
#[derive(Clone)]
pub struct HandleRef {
    inner: Arc<HandleInner>,
}

impl HandleRef {
    /// Handle id
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Execution unit the handle was attached through
    pub fn unit(&self) -> ExecutionUnitId {
        self.inner.unit
    }

    /// Borrow the payload as `T`; `None` if the payload has another type
    pub fn with_payload<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner
            .payload
            .as_ref()
            .and_then(|p| p.downcast_ref::<T>())
            .map(f)
    }

    /// Number of live clones of this proxy
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for HandleRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for HandleRef {}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRef")
            .field("id", &self.inner.id)
            .field("unit", &self.inner.unit)
            .finish()
    }
}
