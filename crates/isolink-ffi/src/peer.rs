//! Native peer
//!
//! A native-side execution unit. It registers a synchronous port with a
//! backend, so native threads can receive envelopes with blocking or polling
//! reads and answer them without a run loop. Replies are correlated by the
//! caller, not by the peer.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use isolink_core::{
    CodecError, CodecOptions, ContextError, DeliveryError, Envelope, EnvelopeError,
    ExecutionUnitId, FunctionTable, InboundPort, Packet, ReplyId, Value,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Peer errors
#[derive(Debug, Error)]
pub enum PeerError {
    /// Nothing arrived within the timeout
    #[error("Timed out waiting for an envelope")]
    Timeout,

    /// The backend dropped this peer's port
    #[error("Port disconnected")]
    Disconnected,

    /// A received payload was not a valid envelope
    #[error("Malformed envelope from {origin}: {source}")]
    Envelope {
        /// Sending unit
        origin: ExecutionUnitId,
        /// Decode failure
        source: EnvelopeError,
    },

    /// An outgoing value could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The backend could not deliver an outgoing envelope
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// A decoded envelope and the unit that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// Sending unit
    pub origin: ExecutionUnitId,
    /// Received envelope
    pub envelope: Envelope,
}

struct CrossbeamPort(Sender<Packet>);

impl InboundPort for CrossbeamPort {
    fn deliver(&self, packet: Packet) -> Result<(), DeliveryError> {
        self.0.send(packet).map_err(|_| DeliveryError::Refused)
    }
}

/// Native endpoint registered as an execution unit
pub struct NativePeer {
    table: Arc<dyn FunctionTable>,
    unit: ExecutionUnitId,
    receiver: Receiver<Packet>,
    next_reply_id: AtomicI64,
    codec: CodecOptions,
}

impl NativePeer {
    /// Register a peer with `table`
    pub fn register(table: Arc<dyn FunctionTable>) -> Result<Self, ContextError> {
        Self::register_with(table, CodecOptions::default())
    }

    /// Register a peer with explicit codec options
    pub fn register_with(
        table: Arc<dyn FunctionTable>,
        codec: CodecOptions,
    ) -> Result<Self, ContextError> {
        let (sender, receiver) = channel::unbounded();
        let unit = table.register_execution_unit(Box::new(CrossbeamPort(sender)))?;
        tracing::debug!(target: "isolink::peer", %unit, "native peer registered");
        Ok(Self {
            table,
            unit,
            receiver,
            next_reply_id: AtomicI64::new(1),
            codec,
        })
    }

    /// Execution unit of this peer
    pub fn unit(&self) -> ExecutionUnitId {
        self.unit
    }

    // ===== Receiving =====

    /// Take the next envelope if one is queued
    pub fn try_recv(&self) -> Result<Option<Incoming>, PeerError> {
        match self.receiver.try_recv() {
            Ok(packet) => self.decode(packet).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PeerError::Disconnected),
        }
    }

    /// Wait up to `timeout` for the next envelope
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Incoming, PeerError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(packet) => self.decode(packet),
            Err(RecvTimeoutError::Timeout) => Err(PeerError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(PeerError::Disconnected),
        }
    }

    fn decode(&self, packet: Packet) -> Result<Incoming, PeerError> {
        let origin = packet.origin;
        match Envelope::decode(&packet.payload, &self.codec) {
            Ok(envelope) => Ok(Incoming { origin, envelope }),
            Err(source) => {
                tracing::warn!(target: "isolink::peer", unit = %self.unit, from = %origin, "malformed envelope: {}", source);
                Err(PeerError::Envelope { origin, source })
            }
        }
    }

    // ===== Sending =====

    /// Send a request; the reply arrives later as an `Incoming` envelope
    pub fn send_message(
        &self,
        target: ExecutionUnitId,
        channel: &str,
        value: impl Into<Value>,
    ) -> Result<ReplyId, PeerError> {
        let reply_id = ReplyId::new(self.next_reply_id.fetch_add(1, Ordering::Relaxed));
        self.post(
            target,
            Envelope::Message {
                reply_id,
                channel: channel.to_string(),
                value: value.into(),
            },
        )?;
        Ok(reply_id)
    }

    /// Post a fire-and-forget message
    pub fn post_message(
        &self,
        target: ExecutionUnitId,
        channel: &str,
        value: impl Into<Value>,
    ) -> Result<(), PeerError> {
        self.post(
            target,
            Envelope::PostMessage {
                channel: channel.to_string(),
                value: value.into(),
            },
        )
    }

    /// Answer a request
    pub fn reply(
        &self,
        target: ExecutionUnitId,
        reply_id: ReplyId,
        value: impl Into<Value>,
    ) -> Result<(), PeerError> {
        self.post(
            target,
            Envelope::Reply {
                reply_id,
                value: value.into(),
            },
        )
    }

    /// Answer a request for a channel this peer does not have
    pub fn reply_no_channel(
        &self,
        target: ExecutionUnitId,
        reply_id: ReplyId,
        channel: &str,
    ) -> Result<(), PeerError> {
        self.post(
            target,
            Envelope::ReplyNoChannel {
                reply_id,
                channel: channel.to_string(),
            },
        )
    }

    /// Answer a request for a channel that has no handler
    pub fn reply_no_handler(
        &self,
        target: ExecutionUnitId,
        reply_id: ReplyId,
        channel: &str,
    ) -> Result<(), PeerError> {
        self.post(
            target,
            Envelope::ReplyNoHandler {
                reply_id,
                channel: channel.to_string(),
            },
        )
    }

    /// Post a raw envelope
    pub fn post(&self, target: ExecutionUnitId, envelope: Envelope) -> Result<(), PeerError> {
        let payload = envelope.encode(&self.codec)?;
        self.table.post_message(self.unit, target, payload)?;
        Ok(())
    }
}

impl Drop for NativePeer {
    fn drop(&mut self) {
        self.table.unregister_execution_unit(self.unit);
        tracing::debug!(target: "isolink::peer", unit = %self.unit, "native peer unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NativeBackend;
    use isolink_core::Encoded;

    #[test]
    fn test_peer_to_peer_roundtrip() {
        let table = NativeBackend::initialized().into_table();
        let a = NativePeer::register(table.clone()).unwrap();
        let b = NativePeer::register(table).unwrap();

        let reply_id = a.send_message(b.unit(), "echo", "hi").unwrap();
        let incoming = b.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(incoming.origin, a.unit());
        assert_eq!(
            incoming.envelope,
            Envelope::Message {
                reply_id,
                channel: "echo".into(),
                value: "hi".into()
            }
        );

        b.reply(a.unit(), reply_id, "hi back").unwrap();
        let reply = a.try_recv().unwrap().unwrap();
        assert_eq!(
            reply.envelope,
            Envelope::Reply {
                reply_id,
                value: "hi back".into()
            }
        );
    }

    #[test]
    fn test_empty_and_timeout() {
        let table = NativeBackend::initialized().into_table();
        let peer = NativePeer::register(table).unwrap();
        assert!(peer.try_recv().unwrap().is_none());
        assert!(matches!(
            peer.recv_timeout(Duration::from_millis(10)),
            Err(PeerError::Timeout)
        ));
    }

    #[test]
    fn test_malformed_payload() {
        let table = NativeBackend::initialized().into_table();
        let peer = NativePeer::register(table.clone()).unwrap();
        table
            .post_message(ExecutionUnitId::new(42), peer.unit(), Encoded::from_bytes(vec![200]))
            .unwrap();
        match peer.try_recv() {
            Err(PeerError::Envelope { origin, .. }) => assert_eq!(origin, ExecutionUnitId::new(42)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_drop_unregisters() {
        let backend = Arc::new(NativeBackend::initialized());
        let table: Arc<dyn FunctionTable> = backend.clone();
        let peer = NativePeer::register(table).unwrap();
        let unit = peer.unit();
        assert!(backend.is_registered(unit));
        drop(peer);
        assert!(!backend.is_registered(unit));
    }

    #[test]
    fn test_register_before_initialize() {
        let table = NativeBackend::new().into_table();
        assert_eq!(
            NativePeer::register(table).err(),
            Some(ContextError::NotInitialized)
        );
    }
}
