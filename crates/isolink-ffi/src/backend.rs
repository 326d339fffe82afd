//! In-process native backend
//!
//! Routes packets between registered execution units and owns the handle id
//! space. Safe to call from any number of threads at once.

use dashmap::DashMap;
use isolink_core::{
    BackendToken, ContextError, DeliveryError, Encoded, ExecutionUnitId, FunctionTable,
    HandleBridge, HandleError, HandleId, HandleRef, InboundPort, NativeResource, Packet,
};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Native backend implementing the function table
pub struct NativeBackend {
    token: BackendToken,
    initialized: AtomicBool,
    units: DashMap<ExecutionUnitId, Arc<dyn InboundPort>>,
    next_unit: AtomicI64,
    handles: HandleBridge,
}

impl NativeBackend {
    /// Create a backend that refuses registrations until [`initialize`](Self::initialize)
    pub fn new() -> Self {
        Self {
            token: BackendToken::new(),
            initialized: AtomicBool::new(false),
            units: DashMap::new(),
            next_unit: AtomicI64::new(1),
            handles: HandleBridge::new(),
        }
    }

    /// Create a backend that is ready for use
    pub fn initialized() -> Self {
        let backend = Self::new();
        backend.initialize();
        backend
    }

    /// Bring the backend up; calling it again has no effect
    pub fn initialize(&self) {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "isolink::backend", token = self.token.as_u64(), "backend initialized");
        }
    }

    /// Check whether the backend is up
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of registered execution units
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Check whether `unit` is registered
    pub fn is_registered(&self, unit: ExecutionUnitId) -> bool {
        self.units.contains_key(&unit)
    }

    /// Handle table shared by every unit of this backend
    pub fn handles(&self) -> &HandleBridge {
        &self.handles
    }

    /// Wrap in an `Arc` usable as a function table
    pub fn into_table(self) -> Arc<dyn FunctionTable> {
        Arc::new(self)
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionTable for NativeBackend {
    fn token(&self) -> BackendToken {
        self.token
    }

    fn register_execution_unit(
        &self,
        port: Box<dyn InboundPort>,
    ) -> Result<ExecutionUnitId, ContextError> {
        if !self.is_initialized() {
            tracing::error!(target: "isolink::backend", "register_execution_unit before initialization");
            return Err(ContextError::NotInitialized);
        }
        let unit = ExecutionUnitId::new(self.next_unit.fetch_add(1, Ordering::Relaxed));
        self.units.insert(unit, Arc::from(port));
        tracing::debug!(target: "isolink::backend", %unit, "execution unit registered");
        Ok(unit)
    }

    fn unregister_execution_unit(&self, unit: ExecutionUnitId) {
        if self.units.remove(&unit).is_some() {
            tracing::debug!(target: "isolink::backend", %unit, "execution unit unregistered");
        }
    }

    fn post_message(
        &self,
        origin: ExecutionUnitId,
        target: ExecutionUnitId,
        payload: Encoded,
    ) -> Result<(), DeliveryError> {
        if !self.is_initialized() {
            return Err(DeliveryError::NotInitialized);
        }
        // Clone the port out so delivery runs without holding the shard lock
        let port = self
            .units
            .get(&target)
            .map(|entry| entry.value().clone())
            .ok_or(DeliveryError::UnknownUnit(target))?;
        tracing::trace!(target: "isolink::backend", from = %origin, to = %target, len = payload.bytes.len(), "post");
        port.deliver(Packet { origin, payload })
    }

    fn next_handle_id(&self) -> HandleId {
        self.handles.next_id()
    }

    fn attach_weak_handle(
        &self,
        unit: ExecutionUnitId,
        id: HandleId,
        resource: NativeResource,
    ) -> Result<HandleRef, HandleError> {
        if !self.is_registered(unit) {
            tracing::warn!(target: "isolink::backend", %unit, %id, "attach through unregistered unit");
            return Err(HandleError::ContextClosed);
        }
        Ok(self.handles.attach(unit, id, resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct RecordingPort {
        packets: Arc<Mutex<Vec<Packet>>>,
    }

    impl InboundPort for RecordingPort {
        fn deliver(&self, packet: Packet) -> Result<(), DeliveryError> {
            self.packets.lock().push(packet);
            Ok(())
        }
    }

    #[test]
    fn test_register_requires_initialization() {
        let backend = NativeBackend::new();
        let port = RecordingPort::default();
        assert_eq!(
            backend.register_execution_unit(Box::new(port.clone())),
            Err(ContextError::NotInitialized)
        );

        backend.initialize();
        assert!(backend.register_execution_unit(Box::new(port)).is_ok());
        assert_eq!(backend.unit_count(), 1);
    }

    #[test]
    fn test_post_routes_to_target() {
        let backend = NativeBackend::initialized();
        let port = RecordingPort::default();
        let unit = backend.register_execution_unit(Box::new(port.clone())).unwrap();

        backend
            .post_message(ExecutionUnitId::new(77), unit, Encoded::from_bytes(vec![1, 2]))
            .unwrap();
        let packets = port.packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].origin, ExecutionUnitId::new(77));
        assert_eq!(packets[0].payload.bytes, vec![1, 2]);
    }

    #[test]
    fn test_post_to_unknown_unit() {
        let backend = NativeBackend::initialized();
        let target = ExecutionUnitId::new(5);
        assert_eq!(
            backend.post_message(ExecutionUnitId::new(1), target, Encoded::default()),
            Err(DeliveryError::UnknownUnit(target))
        );
    }

    #[test]
    fn test_attach_through_unregistered_unit() {
        let backend = NativeBackend::initialized();
        let port = RecordingPort::default();
        let unit = backend.register_execution_unit(Box::new(port)).unwrap();

        let id = backend.next_handle_id();
        assert!(backend
            .attach_weak_handle(unit, id, NativeResource::new(1u8))
            .is_ok());

        backend.unregister_execution_unit(unit);
        assert_eq!(
            backend
                .attach_weak_handle(unit, backend.next_handle_id(), NativeResource::new(2u8))
                .unwrap_err(),
            HandleError::ContextClosed
        );
    }

    #[test]
    fn test_units_are_distinct() {
        let backend = NativeBackend::initialized();
        let a = backend
            .register_execution_unit(Box::new(RecordingPort::default()))
            .unwrap();
        let b = backend
            .register_execution_unit(Box::new(RecordingPort::default()))
            .unwrap();
        assert_ne!(a, b);
    }
}
