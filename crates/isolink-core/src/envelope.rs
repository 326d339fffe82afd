//! Protocol envelopes
//!
//! Every packet on an inbound port carries one envelope, encoded as a list
//! whose first element names its kind:
//!
//! ```text
//! ["message",          reply_id, channel, value]
//! ["post_message",     channel, value]
//! ["reply",            reply_id, value]
//! ["reply_no_channel", reply_id, channel]
//! ["reply_no_handler", reply_id, channel]
//! ```

use crate::codec::{self, CodecError, CodecOptions, Encoded};
use crate::value::Value;
use std::fmt;
use thiserror::Error;

/// Per-Context identifier correlating a call with its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplyId(i64);

impl ReplyId {
    /// Create a reply id from its raw value
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id value
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Malformed envelope
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvelopeError {
    /// Payload failed to decode
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Decoded value is not a non-empty list
    #[error("Envelope must be a non-empty list, got {0}")]
    NotAList(&'static str),

    /// First element names no known kind
    #[error("Unknown envelope kind: {0}")]
    UnknownKind(String),

    /// Wrong number of fields for the kind
    #[error("Envelope '{kind}' expects {expected} fields, got {got}")]
    FieldCount {
        /// Envelope kind
        kind: &'static str,
        /// Expected field count, kind included
        expected: usize,
        /// Actual field count
        got: usize,
    },

    /// A field has the wrong type
    #[error("Envelope '{kind}' field '{field}' has the wrong type")]
    InvalidField {
        /// Envelope kind
        kind: &'static str,
        /// Field name
        field: &'static str,
    },
}

/// One protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Request expecting a reply
    Message {
        /// Caller's reply id
        reply_id: ReplyId,
        /// Target channel
        channel: String,
        /// Request value
        value: Value,
    },

    /// Fire-and-forget message
    PostMessage {
        /// Target channel
        channel: String,
        /// Message value
        value: Value,
    },

    /// Successful reply
    Reply {
        /// Reply id being answered
        reply_id: ReplyId,
        /// Handler result
        value: Value,
    },

    /// The receiver has no channel by that name
    ReplyNoChannel {
        /// Reply id being answered
        reply_id: ReplyId,
        /// Channel name from the request
        channel: String,
    },

    /// The channel exists but has no handler
    ReplyNoHandler {
        /// Reply id being answered
        reply_id: ReplyId,
        /// Channel name from the request
        channel: String,
    },
}

const MESSAGE: &str = "message";
const POST_MESSAGE: &str = "post_message";
const REPLY: &str = "reply";
const REPLY_NO_CHANNEL: &str = "reply_no_channel";
const REPLY_NO_HANDLER: &str = "reply_no_handler";

impl Envelope {
    /// Wire name of the kind
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Message { .. } => MESSAGE,
            Envelope::PostMessage { .. } => POST_MESSAGE,
            Envelope::Reply { .. } => REPLY,
            Envelope::ReplyNoChannel { .. } => REPLY_NO_CHANNEL,
            Envelope::ReplyNoHandler { .. } => REPLY_NO_HANDLER,
        }
    }

    /// Reply id carried by the envelope, if any
    pub fn reply_id(&self) -> Option<ReplyId> {
        match self {
            Envelope::Message { reply_id, .. }
            | Envelope::Reply { reply_id, .. }
            | Envelope::ReplyNoChannel { reply_id, .. }
            | Envelope::ReplyNoHandler { reply_id, .. } => Some(*reply_id),
            Envelope::PostMessage { .. } => None,
        }
    }

    /// Convert into the list value sent on the wire
    pub fn into_value(self) -> Value {
        let kind = Value::from(self.kind());
        let fields = match self {
            Envelope::Message {
                reply_id,
                channel,
                value,
            } => vec![kind, reply_id.0.into(), channel.into(), value],
            Envelope::PostMessage { channel, value } => vec![kind, channel.into(), value],
            Envelope::Reply { reply_id, value } => vec![kind, reply_id.0.into(), value],
            Envelope::ReplyNoChannel { reply_id, channel }
            | Envelope::ReplyNoHandler { reply_id, channel } => {
                vec![kind, reply_id.0.into(), channel.into()]
            }
        };
        Value::List(fields)
    }

    /// Parse an envelope from its list value
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let fields = match value {
            Value::List(fields) if !fields.is_empty() => fields,
            Value::List(_) => return Err(EnvelopeError::NotAList("empty list")),
            other => return Err(EnvelopeError::NotAList(other.type_name())),
        };
        let mut fields = fields.into_iter();
        let kind = match fields.next() {
            Some(Value::String(kind)) => kind,
            _ => return Err(EnvelopeError::UnknownKind("<non-string>".to_string())),
        };

        match kind.as_str() {
            MESSAGE => {
                let [reply_id, channel, value] = take_fields(MESSAGE, fields)?;
                Ok(Envelope::Message {
                    reply_id: reply_id_field(MESSAGE, reply_id)?,
                    channel: channel_field(MESSAGE, channel)?,
                    value,
                })
            }
            POST_MESSAGE => {
                let [channel, value] = take_fields(POST_MESSAGE, fields)?;
                Ok(Envelope::PostMessage {
                    channel: channel_field(POST_MESSAGE, channel)?,
                    value,
                })
            }
            REPLY => {
                let [reply_id, value] = take_fields(REPLY, fields)?;
                Ok(Envelope::Reply {
                    reply_id: reply_id_field(REPLY, reply_id)?,
                    value,
                })
            }
            REPLY_NO_CHANNEL => {
                let [reply_id, channel] = take_fields(REPLY_NO_CHANNEL, fields)?;
                Ok(Envelope::ReplyNoChannel {
                    reply_id: reply_id_field(REPLY_NO_CHANNEL, reply_id)?,
                    channel: channel_field(REPLY_NO_CHANNEL, channel)?,
                })
            }
            REPLY_NO_HANDLER => {
                let [reply_id, channel] = take_fields(REPLY_NO_HANDLER, fields)?;
                Ok(Envelope::ReplyNoHandler {
                    reply_id: reply_id_field(REPLY_NO_HANDLER, reply_id)?,
                    channel: channel_field(REPLY_NO_HANDLER, channel)?,
                })
            }
            _ => Err(EnvelopeError::UnknownKind(kind)),
        }
    }

    /// Encode for posting
    pub fn encode(self, options: &CodecOptions) -> Result<Encoded, CodecError> {
        codec::serialize(&self.into_value(), options)
    }

    /// Decode a received payload
    pub fn decode(payload: &Encoded, options: &CodecOptions) -> Result<Self, EnvelopeError> {
        let value = codec::deserialize(&payload.bytes, &payload.attachments, options)?;
        Self::from_value(value)
    }
}

fn take_fields<const N: usize>(
    kind: &'static str,
    fields: std::vec::IntoIter<Value>,
) -> Result<[Value; N], EnvelopeError> {
    let rest: Vec<Value> = fields.collect();
    let got = rest.len() + 1;
    rest.try_into().map_err(|_| EnvelopeError::FieldCount {
        kind,
        expected: N + 1,
        got,
    })
}

fn reply_id_field(kind: &'static str, value: Value) -> Result<ReplyId, EnvelopeError> {
    match value {
        Value::I64(id) => Ok(ReplyId(id)),
        _ => Err(EnvelopeError::InvalidField {
            kind,
            field: "reply_id",
        }),
    }
}

fn channel_field(kind: &'static str, value: Value) -> Result<String, EnvelopeError> {
    match value {
        Value::String(channel) => Ok(channel),
        _ => Err(EnvelopeError::InvalidField {
            kind,
            field: "channel",
        }),
    }
}
