//! In-process function table for unit tests

use crate::codec::{CodecOptions, Encoded};
use crate::envelope::Envelope;
use crate::error::{ContextError, DeliveryError, HandleError};
use crate::handle::{HandleBridge, HandleId, HandleRef, NativeResource};
use crate::table::{BackendToken, ExecutionUnitId, FunctionTable, InboundPort, Packet};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub(crate) struct LoopbackTable {
    token: BackendToken,
    initialized: bool,
    ports: Mutex<FxHashMap<ExecutionUnitId, Box<dyn InboundPort>>>,
    next_unit: AtomicI64,
    handles: HandleBridge,
}

impl LoopbackTable {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(true)
    }

    pub(crate) fn uninitialized() -> Arc<Self> {
        Self::build(false)
    }

    fn build(initialized: bool) -> Arc<Self> {
        Arc::new(Self {
            token: BackendToken::new(),
            initialized,
            ports: Mutex::new(FxHashMap::default()),
            next_unit: AtomicI64::new(1),
            handles: HandleBridge::new(),
        })
    }

    pub(crate) fn unit_count(&self) -> usize {
        self.ports.lock().len()
    }

    pub(crate) fn handles(&self) -> &HandleBridge {
        &self.handles
    }

    /// Deliver an envelope as if `origin` had posted it
    pub(crate) fn inject(&self, origin: ExecutionUnitId, target: ExecutionUnitId, envelope: Envelope) {
        let payload = envelope.encode(&CodecOptions::default()).unwrap();
        self.post_message(origin, target, payload).unwrap();
    }
}

impl FunctionTable for LoopbackTable {
    fn token(&self) -> BackendToken {
        self.token
    }

    fn register_execution_unit(
        &self,
        port: Box<dyn InboundPort>,
    ) -> Result<ExecutionUnitId, ContextError> {
        if !self.initialized {
            return Err(ContextError::NotInitialized);
        }
        let unit = ExecutionUnitId::new(self.next_unit.fetch_add(1, Ordering::Relaxed));
        self.ports.lock().insert(unit, port);
        Ok(unit)
    }

    fn unregister_execution_unit(&self, unit: ExecutionUnitId) {
        self.ports.lock().remove(&unit);
    }

    fn post_message(
        &self,
        origin: ExecutionUnitId,
        target: ExecutionUnitId,
        payload: Encoded,
    ) -> Result<(), DeliveryError> {
        let ports = self.ports.lock();
        let port = ports.get(&target).ok_or(DeliveryError::UnknownUnit(target))?;
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
        if !self.ports.lock().contains_key(&unit) {
            return Err(HandleError::ContextClosed);
        }
        Ok(self.handles.attach(unit, id, resource))
    }
}
