//! ---
//! cosim_section: "02-messaging-rpc"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Message schema helpers and protocol codecs."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Request/response channel spoken between the simulation manager and remote
//! simulators.
//!
//! Frames are length-prefixed (4 byte big-endian) UTF-8 JSON arrays of the form
//! `[type, id, content]`. Both peers may issue requests at any time, so a
//! simulator can call back into the manager while it is serving a `step`.

pub mod codec;
pub mod connection;
pub mod types;

/// Shared result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors raised while talking to a peer.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Wrapper for IO errors encountered on the socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The peer sent a frame that does not follow the message layout.
    #[error("malformed frame: {0}")]
    Protocol(String),
    /// The connection was closed before a reply arrived.
    #[error("connection to {0} closed")]
    Closed(String),
    /// The peer answered the request with a failure.
    #[error("remote error: {0}")]
    Remote(String),
}

impl RpcError {
    /// Whether the error means the peer is gone rather than that it rejected a call.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, RpcError::Closed(_) | RpcError::Io(_))
    }
}

pub use codec::RpcCodec;
pub use connection::{RequestRouter, RpcConnection};
pub use types::{Call, MessageKind, RequestId, RpcMessage};
