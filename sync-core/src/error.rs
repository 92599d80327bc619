use crate::connection::{ConnectionEvent, ConnectionState};
use crate::event::EventKind;
use thiserror::Error;

/// Why an inbound frame was rejected at the dispatcher boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    NotJson(String),

    #[error("frame is not a json object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("payload for `{kind}` does not match its schema: {reason}")]
    Schema { kind: EventKind, reason: String },

    #[error("unparseable timestamp `{0}`")]
    BadTimestamp(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("handler for `{kind}` failed: {message}")]
    Handler { kind: EventKind, message: String },

    #[error("invalid connection transition: {event:?} while {from}")]
    InvalidTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
