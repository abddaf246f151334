//! Engine.IO v4 / Socket.IO v5 text packet codec
//!
//! The relay under test is a Socket.IO server. The harness only needs the
//! websocket transport and the text packet types, so this module implements
//! exactly that subset:
//!
//! - Engine.IO framing: one packet per websocket text frame, first character is
//!   the packet type (`0` open, `1` close, `2` ping, `3` pong, `4` message,
//!   `5` upgrade, `6` noop).
//! - Socket.IO packets travel inside Engine.IO `message` packets and are encoded
//!   as `<type>[<namespace>,][<ack id>][<json>]`.
//!
//! Binary attachments (`BINARY_EVENT` / `BINARY_ACK`) are rejected.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Namespace used when a packet does not name one
pub const DEFAULT_NAMESPACE: &str = "/";

/// Engine.IO protocol revision spoken by the harness
pub const ENGINE_IO_VERSION: u8 = 4;

// ----------------------------------------------------------------------------
// Engine.IO Layer
// ----------------------------------------------------------------------------

/// Payload of the Engine.IO `open` packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    /// Longest silence tolerated before the server is considered gone
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let kind = text.chars().next().ok_or(ProtocolError::EmptyPacket)?;
        let body = &text[kind.len_utf8()..];

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(body)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(body.to_string())),
            '3' => Ok(EnginePacket::Pong(body.to_string())),
            '4' => Ok(EnginePacket::Message(body.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(ProtocolError::UnknownPacketType {
                layer: "engine.io",
                found: other,
            }),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(handshake) => {
                // OpenHandshake only holds strings and integers
                let json = serde_json::to_string(handshake).unwrap_or_else(|_| "{}".to_string());
                format!("0{}", json)
            }
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{}", data),
            EnginePacket::Pong(data) => format!("3{}", data),
            EnginePacket::Message(data) => format!("4{}", data),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Socket.IO Layer
// ----------------------------------------------------------------------------

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
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

impl SocketPacket {
    /// Namespace connect request for the default namespace
    pub fn connect() -> Self {
        SocketPacket::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        }
    }

    /// Single-argument event on the default namespace
    pub fn event(name: impl Into<String>, payload: Value, id: Option<u64>) -> Self {
        SocketPacket::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id,
            name: name.into(),
            args: vec![payload],
        }
    }

    fn type_char(&self) -> char {
        match self {
            SocketPacket::Connect { .. } => '0',
            SocketPacket::Disconnect { .. } => '1',
            SocketPacket::Event { .. } => '2',
            SocketPacket::Ack { .. } => '3',
            SocketPacket::ConnectError { .. } => '4',
        }
    }

    fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::Ack { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.type_char());

        let namespace = self.namespace();
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
            SocketPacket::Event { id, name, args, .. } => {
                if let Some(id) = id {
                    let _ = write!(out, "{}", id);
                }
                let mut body = Vec::with_capacity(args.len() + 1);
                body.push(Value::String(name.clone()));
                body.extend(args.iter().cloned());
                out.push_str(&Value::Array(body).to_string());
            }
            SocketPacket::Ack { id, args, .. } => {
                let _ = write!(out, "{}", id);
                out.push_str(&Value::Array(args.clone()).to_string());
            }
        }

        out
    }

    /// Encode wrapped in an Engine.IO `message` packet, ready for the wire
    pub fn to_engine_text(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let kind = text.chars().next().ok_or(ProtocolError::EmptyPacket)?;
        let mut rest = &text[kind.len_utf8()..];

        if matches!(kind, '5' | '6') {
            return Err(ProtocolError::BinaryUnsupported);
        }

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(comma) => {
                    let ns = &rest[..comma];
                    rest = &rest[comma + 1..];
                    ns.to_string()
                }
                None => {
                    let ns = rest;
                    rest = "";
                    ns.to_string()
                }
            }
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = if digits > 0 {
            let parsed = rest[..digits]
                .parse::<u64>()
                .map_err(|e| ProtocolError::MalformedBody(format!("ack id: {}", e)))?;
            rest = &rest[digits..];
            Some(parsed)
        } else {
            None
        };

        let body: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, data: body }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let mut args = into_array(body)?;
                if args.is_empty() {
                    return Err(ProtocolError::MissingEventName);
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    _ => return Err(ProtocolError::MissingEventName),
                };
                Ok(SocketPacket::Event { namespace, id, name, args })
            }
            '3' => {
                let id = id.ok_or_else(|| ProtocolError::MalformedBody("ack without id".to_string()))?;
                Ok(SocketPacket::Ack {
                    namespace,
                    id,
                    args: into_array(body)?,
                })
            }
            '4' => Ok(SocketPacket::ConnectError { namespace, data: body }),
            other => Err(ProtocolError::UnknownPacketType {
                layer: "socket.io",
                found: other,
            }),
        }
    }
}

fn into_array(body: Option<Value>) -> Result<Vec<Value>, ProtocolError> {
    match body {
        Some(Value::Array(items)) => Ok(items),
        None => Ok(Vec::new()),
        Some(other) => Err(ProtocolError::MalformedBody(format!(
            "expected JSON array, got {}",
            other
        ))),
    }
}

/// Collapse Socket.IO event arguments into the single payload the relay forwards
pub fn payload_from_args(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}
