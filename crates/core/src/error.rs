//! Error types for the node subsystem.
//!
//! Transport-level failures terminate the affected operation and never take
//! the node down; state and configuration misuse surface to the caller.

use thiserror::Error;

use cellar_protocol::ProtocolError;

use crate::node::State;

/// Errors raised by a node or delivered to an operation.
#[derive(Error, Debug)]
pub enum NodeError {
    /// A new connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] ProtocolError),

    /// The transport rejected the write carrying the request.
    #[error("write failed: {0}")]
    WriteFailed(#[source] ProtocolError),

    /// The connection closed while the operation was in flight.
    #[error("connection closed unexpectedly")]
    UnexpectedClose {
        #[source]
        cause: Option<ProtocolError>,
    },

    /// The server answered with its error reply.
    #[error("server error {code}: {message}")]
    ErrorReply { code: u32, message: String },

    /// The transport failed while the operation was in flight.
    #[error("transport error: {0}")]
    Transport(#[source] ProtocolError),

    /// The node was asked to do something its current state forbids.
    #[error("node is {current:?}; required one of: {required}")]
    IllegalState {
        required: &'static str,
        current: State,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
