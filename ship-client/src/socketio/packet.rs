//! Engine.IO v4 and Socket.IO v5 packet codec.
//!
//! Two layers share one text frame. The Engine.IO layer is a single type
//! digit followed by data:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,..}   open
//! 2                                       ping
//! 3                                       pong
//! 4<socket.io packet>                     message
//! ```
//!
//! A Socket.IO packet rides inside an Engine.IO message:
//!
//! ```text
//! <type>[/<namespace>,][<ack id>][<json>]
//! 2["project:deleted",{"project_id":"abc"}]
//! ```
//!
//! The polling transport concatenates several Engine.IO packets into one
//! body separated by the record separator `\x1e`.
//!
//! Decoding never panics on arbitrary input.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Separator between Engine.IO packets in a polling payload.
pub const RECORD_SEPARATOR: char = '\x1e';

/// The default Socket.IO namespace.
pub const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownType(char),
    #[error("invalid packet JSON: {0}")]
    InvalidJson(String),
    #[error("invalid ack id")]
    InvalidAckId,
    #[error("event packet without an event name")]
    MissingEventName,
    #[error("ack packet without an ack id")]
    MissingAckId,
    #[error("{0} are not supported")]
    Unsupported(&'static str),
}

// ============================================================================
// ENGINE.IO
// ============================================================================

/// Handshake data sent by the server in the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(input: &str) -> Result<Self, PacketError> {
        let mut chars = input.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let data = chars.as_str();
        match kind {
            '0' => serde_json::from_str(data)
                .map(EnginePacket::Open)
                .map_err(|e| PacketError::InvalidJson(e.to_string())),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(data.to_string())),
            '3' => Ok(EnginePacket::Pong(data.to_string())),
            '4' => Ok(EnginePacket::Message(data.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            'b' => Err(PacketError::Unsupported("binary payloads")),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(info) => {
                format!("0{}", serde_json::to_string(info).unwrap_or_default())
            }
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{}", data),
            EnginePacket::Pong(data) => format!("3{}", data),
            EnginePacket::Message(data) => format!("4{}", data),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }

    /// Wrap a Socket.IO packet in an Engine.IO message.
    pub fn socket(packet: &SocketPacket) -> Self {
        EnginePacket::Message(packet.encode())
    }
}

/// Split a polling body into its Engine.IO packets.
pub fn decode_payload(body: &str) -> Vec<Result<EnginePacket, PacketError>> {
    body.split(RECORD_SEPARATOR)
        .filter(|part| !part.is_empty())
        .map(EnginePacket::decode)
        .collect()
}

/// Join Engine.IO packets into one polling body.
pub fn encode_payload(packets: &[EnginePacket]) -> String {
    let encoded: Vec<String> = packets.iter().map(EnginePacket::encode).collect();
    encoded.join(&RECORD_SEPARATOR.to_string())
}

// ============================================================================
// SOCKET.IO
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

impl SocketPacket {
    /// Join the default namespace.
    pub fn connect() -> Self {
        SocketPacket::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        }
    }

    /// Leave the default namespace.
    pub fn disconnect() -> Self {
        SocketPacket::Disconnect {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn decode(input: &str) -> Result<Self, PacketError> {
        let mut chars = input.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let mut rest = chars.as_str();

        match kind {
            '0'..='4' => {}
            '5' | '6' => return Err(PacketError::Unsupported("binary packets")),
            other => return Err(PacketError::UnknownType(other)),
        }

        let mut namespace = DEFAULT_NAMESPACE.to_string();
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(end) => {
                    namespace = rest[..end].to_string();
                    rest = &rest[end + 1..];
                }
                None => {
                    namespace = rest.to_string();
                    rest = "";
                }
            }
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|_| PacketError::InvalidAckId)?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<Value>(rest)
                    .map_err(|e| PacketError::InvalidJson(e.to_string()))?,
            )
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, data }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let Some(Value::Array(args)) = data else {
                    return Err(PacketError::MissingEventName);
                };
                let mut args = args.into_iter();
                let Some(Value::String(name)) = args.next() else {
                    return Err(PacketError::MissingEventName);
                };
                Ok(SocketPacket::Event {
                    namespace,
                    ack_id,
                    name,
                    args: args.collect(),
                })
            }
            '3' => {
                let ack_id = ack_id.ok_or(PacketError::MissingAckId)?;
                let args = match data {
                    Some(Value::Array(args)) => args,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                Ok(SocketPacket::Ack {
                    namespace,
                    ack_id,
                    args,
                })
            }
            _ => Ok(SocketPacket::ConnectError { namespace, data }),
        }
    }

    pub fn encode(&self) -> String {
        let (kind, namespace) = match self {
            SocketPacket::Connect { namespace, .. } => ('0', namespace),
            SocketPacket::Disconnect { namespace } => ('1', namespace),
            SocketPacket::Event { namespace, .. } => ('2', namespace),
            SocketPacket::Ack { namespace, .. } => ('3', namespace),
            SocketPacket::ConnectError { namespace, .. } => ('4', namespace),
        };

        let mut out = String::new();
        out.push(kind);
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }

        match self {
            SocketPacket::Connect { data, .. } | SocketPacket::ConnectError { data, .. } => {
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
            SocketPacket::Disconnect { .. } => {}
            SocketPacket::Event {
                ack_id, name, args, ..
            } => {
                if let Some(id) = ack_id {
                    out.push_str(&id.to_string());
                }
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                out.push_str(&Value::Array(array).to_string());
            }
            SocketPacket::Ack { ack_id, args, .. } => {
                out.push_str(&ack_id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
            }
        }
        out
    }

    /// The first argument of an event, or `null` when none was sent.
    pub fn event_payload(args: &[Value]) -> Value {
        args.first().cloned().unwrap_or(Value::Null)
    }
}
