//! Method channels
//!
//! A thin layer over [`Channel`] for named method calls. Requests travel as
//! `[method, args]`; responses are `["ok", value]` or
//! `["err", code, message | null, detail]`.

use crate::channel::Channel;
use crate::context::Context;
use crate::error::SendMessageError;
use crate::table::ExecutionUnitId;
use crate::value::Value;
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Code returned when the handler does not know the method
pub const NOT_IMPLEMENTED: &str = "not_implemented";

/// Code returned when the request is not a `[method, args]` list
pub const MALFORMED_CALL: &str = "malformed_call";

/// A decoded method call
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    /// Method name
    pub method: String,
    /// Call arguments
    pub args: Value,
}

impl MethodCall {
    /// Create a call
    pub fn new(method: impl Into<String>, args: impl Into<Value>) -> Self {
        Self {
            method: method.into(),
            args: args.into(),
        }
    }

    /// Encode as `[method, args]`
    pub fn into_value(self) -> Value {
        Value::List(vec![Value::String(self.method), self.args])
    }

    /// Decode from `[method, args]`
    pub fn from_value(value: Value) -> Option<Self> {
        let items = match value {
            Value::List(items) if items.len() == 2 => items,
            _ => return None,
        };
        let mut items = items.into_iter();
        match (items.next(), items.next()) {
            (Some(Value::String(method)), Some(args)) => Some(Self { method, args }),
            _ => None,
        }
    }
}

/// Error reported by the method handler on the other side
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformError {
    /// Error code
    pub code: String,
    /// Human-readable message
    pub message: Option<String>,
    /// Additional data
    pub detail: Value,
}

impl PlatformError {
    /// Create an error with a code and no message
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
            detail: Value::Null,
        }
    }

    /// Set the message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the detail value
    pub fn with_detail(mut self, detail: impl Into<Value>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Error for a method the handler does not implement
    pub fn not_implemented(method: &str) -> Self {
        Self::new(NOT_IMPLEMENTED).with_message(format!("method '{}' is not implemented", method))
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Failure of a method call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MethodCallError {
    /// The message never got a method reply
    #[error("Send error: {0}")]
    Send(#[from] SendMessageError),

    /// The handler answered with an error
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// The reply was neither an `ok` nor an `err` response
    #[error("Invalid method response: {0}")]
    InvalidResponse(String),
}

/// Result of a method handler
pub type PlatformResult = Result<Value, PlatformError>;

fn encode_result(result: PlatformResult) -> Value {
    match result {
        Ok(value) => Value::List(vec!["ok".into(), value]),
        Err(err) => Value::List(vec![
            "err".into(),
            err.code.into(),
            err.message.into(),
            err.detail,
        ]),
    }
}

fn decode_result(value: Value) -> Result<Value, MethodCallError> {
    let items = match value {
        Value::List(items) => items,
        other => return Err(MethodCallError::InvalidResponse(other.to_string())),
    };
    let mut items = items.into_iter();
    match (items.next(), items.next(), items.next(), items.next()) {
        (Some(Value::String(tag)), Some(value), None, None) if tag == "ok" => Ok(value),
        (Some(Value::String(tag)), Some(Value::String(code)), Some(message), Some(detail))
            if tag == "err" =>
        {
            Err(PlatformError {
                code,
                message: match message {
                    Value::String(message) => Some(message),
                    _ => None,
                },
                detail,
            }
            .into())
        }
        _ => Err(MethodCallError::InvalidResponse(
            "expected [\"ok\", value] or [\"err\", code, message, detail]".to_string(),
        )),
    }
}

/// Channel speaking the method-call protocol
#[derive(Clone, Debug)]
pub struct MethodChannel {
    channel: Channel,
}

impl MethodChannel {
    /// Register a method channel without a handler
    pub fn new(context: &Context, name: impl Into<String>) -> Self {
        Self {
            channel: Channel::new(context, name),
        }
    }

    /// Underlying channel
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Set the handler answering method calls
    ///
    /// Requests that are not `[method, args]` are answered with a
    /// `malformed_call` error without reaching the handler.
    pub fn set_method_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(MethodCall, ExecutionUnitId) -> Fut + 'static,
        Fut: Future<Output = PlatformResult> + 'static,
    {
        let handler = std::rc::Rc::new(handler);
        self.channel.set_handler(move |value, origin| {
            let handler = handler.clone();
            async move {
                let result = match MethodCall::from_value(value) {
                    Some(call) => handler(call, origin).await,
                    None => Err(PlatformError::new(MALFORMED_CALL)
                        .with_message("expected [method, args]")),
                };
                encode_result(result)
            }
        });
    }

    /// Call `method` on the channel of the same name on `target`
    ///
    /// The request is posted before this returns.
    pub fn invoke_method(
        &self,
        target: ExecutionUnitId,
        method: &str,
        args: impl Into<Value>,
    ) -> impl Future<Output = Result<Value, MethodCallError>> {
        invoke(self.channel.context(), target, self.channel.name(), method, args)
    }
}

/// Call `method` on `channel` at `target` without registering a local channel
pub(crate) fn invoke(
    context: &Context,
    target: ExecutionUnitId,
    channel: &str,
    method: &str,
    args: impl Into<Value>,
) -> impl Future<Output = Result<Value, MethodCallError>> {
    let reply = context.send_message(target, channel, MethodCall::new(method, args).into_value());
    async move { decode_result(reply.await?) }
}
