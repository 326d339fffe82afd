//! C ABI for the native backend
//!
//! Embedders fill an [`IsolinkFunctionTable`] with
//! [`isolink_init_function_table`] and call through it. The API follows
//! these principles:
//! - ABI-stable (only C-compatible types)
//! - Failures reported as status codes and sentinel values, never unwinding
//! - Opaque pointers for handles, released explicitly
//!
//! The C side of a unit receives envelopes through a port callback. Bytes
//! passed to the callback are valid only for the duration of the call.

use crate::backend::NativeBackend;
use crate::engine::{engines, EngineComponents, EngineHandle, RawHandle};
use isolink_core::{
    DeliveryError, Encoded, ExecutionUnitId, FunctionTable, HandleId, HandleRef, InboundPort,
    NativeResource, Packet,
};
use once_cell::sync::Lazy;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

static BACKEND: Lazy<Arc<NativeBackend>> = Lazy::new(|| Arc::new(NativeBackend::new()));

/// Process-wide backend behind the C function table
pub fn global_backend() -> Arc<NativeBackend> {
    BACKEND.clone()
}

/// The process-wide backend as a function table, for Rust Contexts
pub fn global_table() -> Arc<dyn FunctionTable> {
    BACKEND.clone()
}

// ============================================================================
// Types
// ============================================================================

/// Receives envelopes for a unit registered from C
pub type IsolinkPortCallback =
    unsafe extern "C" fn(user_data: *mut c_void, origin: i64, data: *const u8, len: usize);

/// Releases a payload attached with [`IsolinkFunctionTable::attach_weak_handle`]
pub type IsolinkReleaseCallback = unsafe extern "C" fn(payload: *mut c_void);

/// Opaque handle proxy owned by C
#[repr(C)]
pub struct IsolinkHandle {
    _private: [u8; 0],
}

// Internal representation of a handle (not exposed to C)
struct HandleBox {
    handle: HandleRef,
}

/// Payload pointer stored in the handle bridge
#[derive(Debug, Clone, Copy)]
struct ForeignPayload(usize);

/// Returned by `register_execution_unit` when the backend is not initialized
pub const ISOLINK_ILLEGAL_UNIT: i64 = -1;

/// `post_message` succeeded
pub const ISOLINK_POST_OK: i32 = 0;
/// `post_message`: backend not initialized
pub const ISOLINK_POST_NOT_INITIALIZED: i32 = -1;
/// `post_message`: no unit registered under the target id
pub const ISOLINK_POST_UNKNOWN_UNIT: i32 = -2;
/// `post_message`: the target port refused the message
pub const ISOLINK_POST_REFUSED: i32 = -3;
/// `post_message`: null data with a non-zero length
pub const ISOLINK_POST_INVALID_ARGUMENT: i32 = -4;

/// Function table handed to the embedder
#[repr(C)]
pub struct IsolinkFunctionTable {
    /// Must be set to `sizeof(IsolinkFunctionTable)` by the caller
    pub size: usize,
    /// Register a port; returns the unit id or `ISOLINK_ILLEGAL_UNIT`
    pub register_execution_unit:
        Option<unsafe extern "C" fn(callback: Option<IsolinkPortCallback>, user_data: *mut c_void) -> i64>,
    /// Unregister a unit
    pub unregister_execution_unit: Option<unsafe extern "C" fn(unit: i64)>,
    /// Post bytes from `origin` to `target`; returns an `ISOLINK_POST_*` code
    pub post_message:
        Option<unsafe extern "C" fn(origin: i64, target: i64, data: *const u8, len: usize) -> i32>,
    /// Allocate a fresh handle id
    pub next_handle_id: Option<unsafe extern "C" fn() -> i64>,
    /// Attach a payload; returns an owned handle or null if `unit` is not registered
    pub attach_weak_handle: Option<
        unsafe extern "C" fn(
            unit: i64,
            handle_id: i64,
            payload: *mut c_void,
            release: Option<IsolinkReleaseCallback>,
        ) -> *mut IsolinkHandle,
    >,
    /// Drop an owned handle
    pub release_handle: Option<unsafe extern "C" fn(handle: *mut IsolinkHandle)>,
    /// Id of a handle
    pub handle_id: Option<unsafe extern "C" fn(handle: *const IsolinkHandle) -> i64>,
    /// Payload pointer of a handle
    pub handle_payload: Option<unsafe extern "C" fn(handle: *const IsolinkHandle) -> *mut c_void>,
}

impl IsolinkFunctionTable {
    /// A table with only `size` filled in, ready for [`isolink_init_function_table`]
    pub fn empty() -> Self {
        Self {
            size: std::mem::size_of::<Self>(),
            register_execution_unit: None,
            unregister_execution_unit: None,
            post_message: None,
            next_handle_id: None,
            attach_weak_handle: None,
            release_handle: None,
            handle_id: None,
            handle_payload: None,
        }
    }
}

/// Result of [`isolink_init_function_table`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolinkInitResult {
    /// Table filled in
    NoError = 0,
    /// `size` does not match this library's table layout
    InvalidStructSize = 1,
    /// Table pointer was null
    NullTable = 2,
}

/// Engine components as seen from C
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IsolinkEngineComponents {
    /// Platform view
    pub view: *mut c_void,
    /// Binary messenger
    pub binary_messenger: *mut c_void,
    /// Texture registry
    pub texture_registry: *mut c_void,
}

// ============================================================================
// Foreign Port
// ============================================================================

struct ForeignPort {
    callback: IsolinkPortCallback,
    user_data: usize,
}

impl InboundPort for ForeignPort {
    fn deliver(&self, packet: Packet) -> Result<(), DeliveryError> {
        // The C ABI carries bytes only
        if packet.payload.has_attachments() {
            tracing::warn!(
                target: "isolink::backend",
                from = %packet.origin,
                "refusing packet with attachments for a C port"
            );
            return Err(DeliveryError::Refused);
        }
        let bytes = &packet.payload.bytes;
        unsafe {
            (self.callback)(
                self.user_data as *mut c_void,
                packet.origin.as_i64(),
                bytes.as_ptr(),
                bytes.len(),
            );
        }
        Ok(())
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Bring the process-wide backend up
///
/// Units cannot register before this is called.
#[no_mangle]
pub extern "C" fn isolink_initialize() {
    BACKEND.initialize();
}

/// Fill `table` with the backend entry points
///
/// # Safety
/// `table` must be null or point to a writable `IsolinkFunctionTable` whose
/// `size` field is initialized.
#[no_mangle]
pub unsafe extern "C" fn isolink_init_function_table(
    table: *mut IsolinkFunctionTable,
) -> IsolinkInitResult {
    if table.is_null() {
        return IsolinkInitResult::NullTable;
    }
    let table = &mut *table;
    if table.size != std::mem::size_of::<IsolinkFunctionTable>() {
        tracing::error!(
            target: "isolink::backend",
            expected = std::mem::size_of::<IsolinkFunctionTable>(),
            got = table.size,
            "function table size mismatch"
        );
        return IsolinkInitResult::InvalidStructSize;
    }

    table.register_execution_unit = Some(register_execution_unit);
    table.unregister_execution_unit = Some(unregister_execution_unit);
    table.post_message = Some(post_message);
    table.next_handle_id = Some(next_handle_id);
    table.attach_weak_handle = Some(attach_weak_handle);
    table.release_handle = Some(release_handle);
    table.handle_id = Some(handle_id);
    table.handle_payload = Some(handle_payload);
    IsolinkInitResult::NoError
}

// ============================================================================
// Table Entry Points
// ============================================================================

unsafe extern "C" fn register_execution_unit(
    callback: Option<IsolinkPortCallback>,
    user_data: *mut c_void,
) -> i64 {
    let callback = match callback {
        Some(callback) => callback,
        None => return ISOLINK_ILLEGAL_UNIT,
    };
    let port = ForeignPort {
        callback,
        user_data: user_data as usize,
    };
    match BACKEND.register_execution_unit(Box::new(port)) {
        Ok(unit) => unit.as_i64(),
        Err(_) => ISOLINK_ILLEGAL_UNIT,
    }
}

unsafe extern "C" fn unregister_execution_unit(unit: i64) {
    BACKEND.unregister_execution_unit(ExecutionUnitId::new(unit));
}

unsafe extern "C" fn post_message(origin: i64, target: i64, data: *const u8, len: usize) -> i32 {
    let bytes = if len == 0 {
        Vec::new()
    } else if data.is_null() {
        return ISOLINK_POST_INVALID_ARGUMENT;
    } else {
        std::slice::from_raw_parts(data, len).to_vec()
    };

    let result = BACKEND.post_message(
        ExecutionUnitId::new(origin),
        ExecutionUnitId::new(target),
        Encoded::from_bytes(bytes),
    );
    match result {
        Ok(()) => ISOLINK_POST_OK,
        Err(DeliveryError::NotInitialized) => ISOLINK_POST_NOT_INITIALIZED,
        Err(DeliveryError::UnknownUnit(_)) => ISOLINK_POST_UNKNOWN_UNIT,
        Err(DeliveryError::Refused) => ISOLINK_POST_REFUSED,
    }
}

unsafe extern "C" fn next_handle_id() -> i64 {
    BACKEND.next_handle_id().as_i64()
}

unsafe extern "C" fn attach_weak_handle(
    unit: i64,
    handle_id: i64,
    payload: *mut c_void,
    release: Option<IsolinkReleaseCallback>,
) -> *mut IsolinkHandle {
    let payload = ForeignPayload(payload as usize);
    let resource = match release {
        Some(release) => NativeResource::with_release(payload, move |p: ForeignPayload| unsafe {
            release(p.0 as *mut c_void)
        }),
        None => NativeResource::new(payload),
    };

    match BACKEND.attach_weak_handle(ExecutionUnitId::new(unit), HandleId::new(handle_id), resource) {
        Ok(handle) => Box::into_raw(Box::new(HandleBox { handle })) as *mut IsolinkHandle,
        Err(_) => ptr::null_mut(),
    }
}

unsafe extern "C" fn release_handle(handle: *mut IsolinkHandle) {
    if handle.is_null() {
        return;
    }
    drop(Box::from_raw(handle as *mut HandleBox));
}

unsafe extern "C" fn handle_id(handle: *const IsolinkHandle) -> i64 {
    if handle.is_null() {
        return -1;
    }
    let handle = &*(handle as *const HandleBox);
    handle.handle.id().as_i64()
}

unsafe extern "C" fn handle_payload(handle: *const IsolinkHandle) -> *mut c_void {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let handle = &*(handle as *const HandleBox);
    handle
        .handle
        .with_payload(|p: &ForeignPayload| p.0 as *mut c_void)
        .unwrap_or(ptr::null_mut())
}

// ============================================================================
// Engine Table
// ============================================================================

/// Register an engine's native objects and return its handle
#[no_mangle]
pub extern "C" fn isolink_register_engine(
    view: *mut c_void,
    binary_messenger: *mut c_void,
    texture_registry: *mut c_void,
) -> i64 {
    engines()
        .register(EngineComponents {
            view: RawHandle::from_ptr(view),
            binary_messenger: RawHandle::from_ptr(binary_messenger),
            texture_registry: RawHandle::from_ptr(texture_registry),
        })
        .as_i64()
}

/// Look up an engine's native objects
///
/// Returns `false` and leaves `out` untouched for unknown handles.
///
/// # Safety
/// `out` must be null or point to a writable `IsolinkEngineComponents`.
#[no_mangle]
pub unsafe extern "C" fn isolink_get_engine(
    handle: i64,
    out: *mut IsolinkEngineComponents,
) -> bool {
    if out.is_null() {
        return false;
    }
    match engines().get(EngineHandle::new(handle)) {
        Ok(components) => {
            *out = IsolinkEngineComponents {
                view: components.view.as_ptr(),
                binary_messenger: components.binary_messenger.as_ptr(),
                texture_registry: components.texture_registry.as_ptr(),
            };
            true
        }
        Err(e) => {
            tracing::debug!(target: "isolink::backend", "engine lookup failed: {}", e);
            false
        }
    }
}
