//! ---
//! cosim_section: "02-messaging-rpc"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Message schema helpers and protocol codecs."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::RpcError;

/// Identifier correlating a request with its reply. Unique per sender.
pub type RequestId = u64;

/// Numeric message types used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A call the receiver must answer.
    Request = 0,
    /// A successful reply.
    Success = 1,
    /// A failed reply carrying an error description.
    Failure = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Success),
            2 => Ok(MessageKind::Failure),
            other => Err(RpcError::Protocol(format!("unknown message type {other}"))),
        }
    }
}

/// A method invocation with positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Call {
    /// Name of the method to invoke.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

impl Call {
    /// Start building a call to `method`.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    /// Append a positional argument.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Merge all entries of `kwargs` into the keyword arguments.
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    /// Positional argument `index`, or the keyword argument `name` when absent.
    pub fn param(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }
}

/// Envelope exchanged between the manager and a simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireFrame", into = "WireFrame")]
pub enum RpcMessage {
    /// Invoke a method on the receiving peer.
    Request {
        /// Correlation id chosen by the sender.
        id: RequestId,
        /// The invocation itself.
        call: Call,
    },
    /// Successful reply to request `id`.
    Success {
        /// Id of the answered request.
        id: RequestId,
        /// Returned value.
        result: Value,
    },
    /// Failed reply to request `id`.
    Failure {
        /// Id of the answered request.
        id: RequestId,
        /// Human-readable error description.
        error: String,
    },
}

impl RpcMessage {
    /// Wire type of the message.
    pub fn kind(&self) -> MessageKind {
        match self {
            RpcMessage::Request { .. } => MessageKind::Request,
            RpcMessage::Success { .. } => MessageKind::Success,
            RpcMessage::Failure { .. } => MessageKind::Failure,
        }
    }

    /// Correlation id of the message.
    pub fn id(&self) -> RequestId {
        match self {
            RpcMessage::Request { id, .. }
            | RpcMessage::Success { id, .. }
            | RpcMessage::Failure { id, .. } => *id,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireFrame(u8, RequestId, Value);

impl From<RpcMessage> for WireFrame {
    fn from(message: RpcMessage) -> Self {
        let kind = message.kind() as u8;
        match message {
            RpcMessage::Request { id, call } => WireFrame(
                kind,
                id,
                Value::Array(vec![
                    Value::String(call.method),
                    Value::Array(call.args),
                    Value::Object(call.kwargs),
                ]),
            ),
            RpcMessage::Success { id, result } => WireFrame(kind, id, result),
            RpcMessage::Failure { id, error } => WireFrame(kind, id, Value::String(error)),
        }
    }
}

impl TryFrom<WireFrame> for RpcMessage {
    type Error = RpcError;

    fn try_from(frame: WireFrame) -> Result<Self, Self::Error> {
        let WireFrame(kind, id, content) = frame;
        match MessageKind::try_from(kind)? {
            MessageKind::Request => {
                let Value::Array(parts) = content else {
                    return Err(RpcError::Protocol(
                        "request content must be [method, args, kwargs]".into(),
                    ));
                };
                let mut parts = parts.into_iter();
                let method = match parts.next() {
                    Some(Value::String(method)) => method,
                    _ => return Err(RpcError::Protocol("request without method name".into())),
                };
                let args = match parts.next() {
                    Some(Value::Array(args)) => args,
                    None | Some(Value::Null) => Vec::new(),
                    Some(other) => {
                        return Err(RpcError::Protocol(format!(
                            "positional arguments must be a list, got {other}"
                        )))
                    }
                };
                let kwargs = match parts.next() {
                    Some(Value::Object(kwargs)) => kwargs,
                    None | Some(Value::Null) => Map::new(),
                    Some(other) => {
                        return Err(RpcError::Protocol(format!(
                            "keyword arguments must be an object, got {other}"
                        )))
                    }
                };
                Ok(RpcMessage::Request {
                    id,
                    call: Call {
                        method,
                        args,
                        kwargs,
                    },
                })
            }
            MessageKind::Success => Ok(RpcMessage::Success {
                id,
                result: content,
            }),
            MessageKind::Failure => {
                let error = match content {
                    Value::String(error) => error,
                    other => other.to_string(),
                };
                Ok(RpcMessage::Failure { id, error })
            }
        }
    }
}
