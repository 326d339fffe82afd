//! Native backend for isolink
//!
//! Provides the function table that [`isolink_core::Context`] runs on:
//! - [`NativeBackend`]: in-process routing between execution units and the handle id space
//! - [`NativePeer`]: a synchronous native endpoint registered as an execution unit
//! - [`c_api`]: the C function table for embedders
//! - [`engine`]: lookup from engine handles to engine components
//!
//! # Example
//!
//! ```rust,ignore
//! use isolink_core::{Channel, Context};
//! use isolink_ffi::c_api::{global_table, isolink_initialize};
//!
//! isolink_initialize();
//! let context = Context::get_or_init(&global_table())?;
//! let _ping = Channel::with_handler(&context, "ping", |value, _origin| async move {
//!     (value.as_i64().unwrap_or(0) + 1).into()
//! });
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod c_api;
pub mod engine;
pub mod peer;

pub use backend::NativeBackend;
pub use engine::{engines, EngineComponents, EngineError, EngineHandle, EngineRegistry, RawHandle};
pub use peer::{Incoming, NativePeer, PeerError};
