//! Isolink Core
//!
//! Asynchronous message channels between execution units that share a
//! native backend. This crate provides:
//! - The value model and its binary codec with a handle/buffer side table
//! - The handle bridge for finalizer-aware native resources
//! - Per-unit Contexts: channel registry, reply correlation, dispatcher
//! - Method and event channels built on top of plain channels
//! - A cooperative run loop with delayed callbacks and a thread-safe sender
//! - The [`FunctionTable`] trait a native backend implements

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod channel;
pub mod codec;
pub mod context;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handle;
pub mod method;
pub mod registry;
pub mod run_loop;
pub mod table;
pub mod timer;
pub mod value;

#[cfg(test)]
mod testing;

pub use channel::Channel;
pub use codec::{deserialize, serialize, Attachment, CodecError, CodecOptions, Encoded};
pub use context::{Context, ContextOptions, ReplyFuture, WeakContext};
pub use envelope::{Envelope, EnvelopeError, ReplyId};
pub use error::{ContextError, DeliveryError, HandleError, PostMessageError, SendMessageError};
pub use event::{EventChannel, EventHandler, EventSink, EventStream};
pub use handle::{HandleBridge, HandleId, HandleRef, NativeResource};
pub use method::{MethodCall, MethodCallError, MethodChannel, PlatformError, PlatformResult};
pub use run_loop::{RunLoop, RunLoopSender, ScheduledTask};
pub use table::{BackendToken, ExecutionUnitId, FunctionTable, InboundPort, Packet};
pub use value::{BufferRef, Value, ValueConversionError, ValueMap};
