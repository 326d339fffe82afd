//! Channel error types

use crate::codec::CodecError;
use crate::table::ExecutionUnitId;
use thiserror::Error;

/// Failure of a request/reply call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendMessageError {
    /// The target Context has no channel registered under this name
    #[error("No such channel: {channel}")]
    NoSuchChannel {
        /// Channel name as sent
        channel: String,
    },

    /// The channel exists on the target but has no handler
    #[error("No handler registered for channel: {channel}")]
    NoHandler {
        /// Channel name as sent
        channel: String,
    },

    /// Target execution unit is not registered with the backend
    #[error("Invalid target execution unit")]
    InvalidTarget,

    /// Target port refused the message
    #[error("Message refused by target")]
    MessageRefused,

    /// The local Context was shut down
    #[error("Context closed")]
    ContextClosed,

    /// The message could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Failure of a fire-and-forget post
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PostMessageError {
    /// Target execution unit is not registered with the backend
    #[error("Invalid target execution unit")]
    InvalidTarget,

    /// Target port refused the message
    #[error("Message refused by target")]
    MessageRefused,

    /// The local Context was shut down
    #[error("Context closed")]
    ContextClosed,

    /// The message could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<DeliveryError> for PostMessageError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::UnknownUnit(_) | DeliveryError::NotInitialized => {
                PostMessageError::InvalidTarget
            }
            DeliveryError::Refused => PostMessageError::MessageRefused,
        }
    }
}

impl From<PostMessageError> for SendMessageError {
    fn from(e: PostMessageError) -> Self {
        match e {
            PostMessageError::InvalidTarget => SendMessageError::InvalidTarget,
            PostMessageError::MessageRefused => SendMessageError::MessageRefused,
            PostMessageError::ContextClosed => SendMessageError::ContextClosed,
            PostMessageError::Codec(e) => SendMessageError::Codec(e),
        }
    }
}

/// Context lifecycle errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// The native backend was not initialized before first use
    #[error("Native context not initialized")]
    NotInitialized,

    /// The Context was shut down
    #[error("Context closed")]
    Closed,
}

/// Handle bridge errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandleError {
    /// Attach attempted after the owning Context was torn down
    #[error("Context closed")]
    ContextClosed,
}

/// Backend-level delivery failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The backend is not initialized
    #[error("Native context not initialized")]
    NotInitialized,

    /// No unit registered under this id
    #[error("Unknown execution unit: {0}")]
    UnknownUnit(ExecutionUnitId),

    /// The unit's port refused the packet
    #[error("Delivery refused")]
    Refused,
}
