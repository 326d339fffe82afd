//! Native function table
//!
//! The seam between a Context and the native backend that routes its
//! messages. A backend must be callable concurrently from every Context that
//! registered with it.

use crate::codec::Encoded;
use crate::error::{ContextError, DeliveryError, HandleError};
use crate::handle::{HandleId, HandleRef, NativeResource};
use futures::channel::mpsc::UnboundedSender;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a registered execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionUnitId(i64);

impl ExecutionUnitId {
    /// Create an id from its raw value
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id value
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ExecutionUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Identity of a backend instance, used to deduplicate Contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendToken(u64);

impl BackendToken {
    /// Generate a new unique token
    pub fn new() -> Self {
        static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw token value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for BackendToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One delivery on an inbound port
#[derive(Debug, Clone)]
pub struct Packet {
    /// Unit that posted the payload
    pub origin: ExecutionUnitId,
    /// Encoded envelope
    pub payload: Encoded,
}

/// Receiving end registered by an execution unit
pub trait InboundPort: Send + Sync {
    /// Hand a packet to the unit; must not block beyond bounded buffering
    fn deliver(&self, packet: Packet) -> Result<(), DeliveryError>;
}

impl InboundPort for UnboundedSender<Packet> {
    fn deliver(&self, packet: Packet) -> Result<(), DeliveryError> {
        self.unbounded_send(packet)
            .map_err(|_| DeliveryError::Refused)
    }
}

/// Native entry points a Context calls into
pub trait FunctionTable: Send + Sync {
    /// Backend identity
    fn token(&self) -> BackendToken;

    /// Register a port and receive the unit id packets are addressed to
    ///
    /// Fails with `ContextError::NotInitialized` when the backend is not up.
    fn register_execution_unit(
        &self,
        port: Box<dyn InboundPort>,
    ) -> Result<ExecutionUnitId, ContextError>;

    /// Remove a unit; later posts to it fail with `UnknownUnit`
    fn unregister_execution_unit(&self, unit: ExecutionUnitId);

    /// Enqueue a payload for delivery to `target`
    fn post_message(
        &self,
        origin: ExecutionUnitId,
        target: ExecutionUnitId,
        payload: Encoded,
    ) -> Result<(), DeliveryError>;

    /// Allocate a fresh handle id
    fn next_handle_id(&self) -> HandleId;

    /// Attach a native resource through `unit`
    ///
    /// Fails with `HandleError::ContextClosed` when `unit` is not registered.
    fn attach_weak_handle(
        &self,
        unit: ExecutionUnitId,
        id: HandleId,
        resource: NativeResource,
    ) -> Result<HandleRef, HandleError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_backend_tokens_are_unique() {
        let a = BackendToken::new();
        let b = BackendToken::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_unbounded_sender_port() {
        let (tx, mut rx) = futures::channel::mpsc::unbounded();
        let packet = Packet {
            origin: ExecutionUnitId::new(4),
            payload: Encoded::from_bytes(vec![0]),
        };
        tx.deliver(packet).unwrap();
        let received = futures::executor::block_on(rx.next()).unwrap();
        assert_eq!(received.origin, ExecutionUnitId::new(4));

        drop(rx);
        let packet = Packet {
            origin: ExecutionUnitId::new(4),
            payload: Encoded::default(),
        };
        assert_eq!(tx.deliver(packet), Err(DeliveryError::Refused));
    }
}
