//! peersync wire protocol: envelope, typed messages, type-string routing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::PeerId;

/// Current protocol version. Sent in the host transport hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Response status codes.
pub mod status {
    pub const OK: u16 = 200;
    pub const NOT_FOUND: u16 = 404;
}

/// Unit of communication. `kind` is the `type` string on the wire (`post/sum`, `response/7`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Correlation ID; present only on requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Sender's clock (ms) when the envelope was built.
    #[serde(default)]
    pub sent: u64,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, body: Value, id: Option<u32>, sent: u64) -> Self {
        Self {
            kind: kind.into(),
            body,
            metadata: Metadata { id, sent },
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.metadata.id
    }

    /// Primary routing key (everything before the first `/`).
    pub fn primary(&self) -> &str {
        split_type(&self.kind).0
    }
}

/// Split a type string at the first `/` into (primary, sub-path).
pub fn split_type(kind: &str) -> (&str, Option<&str>) {
    match kind.split_once('/') {
        Some((primary, rest)) => (primary, Some(rest)),
        None => (kind, None),
    }
}

/// Router dispatch keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Init,
    Heartbeat,
    Post,
    DisconnectRequest,
    Disconnect,
    Var,
    Response,
    Socket,
}

impl MessageKind {
    pub fn from_primary(primary: &str) -> Option<Self> {
        Some(match primary {
            "init" => MessageKind::Init,
            "hb" => MessageKind::Heartbeat,
            "post" => MessageKind::Post,
            "disconnect-req" => MessageKind::DisconnectRequest,
            "disconnect" => MessageKind::Disconnect,
            "var" => MessageKind::Var,
            "response" => MessageKind::Response,
            "socket" => MessageKind::Socket,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Init => "init",
            MessageKind::Heartbeat => "hb",
            MessageKind::Post => "post",
            MessageKind::DisconnectRequest => "disconnect-req",
            MessageKind::Disconnect => "disconnect",
            MessageKind::Var => "var",
            MessageKind::Response => "response",
            MessageKind::Socket => "socket",
        }
    }
}

/// Body of a `response/<id>` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub body: Value,
    pub status: u16,
}

impl Response {
    pub fn new(status: u16, body: Value) -> Self {
        Self { body, status }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(status::OK, body)
    }

    pub fn not_found() -> Self {
        Self::new(status::NOT_FOUND, Value::Null)
    }

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarMode {
    Active,
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarAction {
    Set,
    Read,
}

/// Body of a `var` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarMessage {
    pub name: String,
    pub mode: VarMode,
    pub action: VarAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
}

impl VarMessage {
    pub fn set(name: impl Into<String>, mode: VarMode, value: Value, from: PeerId, time: u64) -> Self {
        Self {
            name: name.into(),
            mode,
            action: VarAction::Set,
            value: Some(value),
            from: Some(from),
            time: Some(time),
        }
    }

    pub fn read(name: impl Into<String>, mode: VarMode) -> Self {
        Self {
            name: name.into(),
            mode,
            action: VarAction::Read,
            value: None,
            from: None,
            time: None,
        }
    }
}

/// A variable's value with its LWW stamp, as carried in snapshots and read replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarState {
    #[serde(default)]
    pub value: Value,
    pub time: u64,
    pub from: PeerId,
}

/// Init response body: one flat map per mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSnapshot {
    #[serde(default)]
    pub active: BTreeMap<String, VarState>,
    #[serde(default)]
    pub lazy: BTreeMap<String, VarState>,
}

/// Envelope decoded into its typed form.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Init { credential: String },
    Response { id: u32, response: Response },
    Heartbeat,
    Post { path: String, body: Value },
    Var(VarMessage),
    DisconnectRequest,
    /// Server notice carries a reason; client confirmation carries none.
    Disconnect { reason: Option<String> },
    Socket(Value),
}

impl Message {
    /// Decode an envelope. `Ok(None)` for unknown types (dropped for forward compatibility).
    pub fn decode(envelope: &Envelope) -> Result<Option<Message>, DecodeError> {
        let (primary, sub) = split_type(&envelope.kind);
        let Some(kind) = MessageKind::from_primary(primary) else {
            return Ok(None);
        };
        let body = &envelope.body;
        let msg = match kind {
            MessageKind::Init => Message::Init {
                credential: match body {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    _ => return Err(DecodeError::Credential),
                },
            },
            MessageKind::Heartbeat => Message::Heartbeat,
            MessageKind::Post => Message::Post {
                path: sub.ok_or(DecodeError::MissingPath(kind))?.to_owned(),
                body: body.clone(),
            },
            MessageKind::Response => {
                let raw = sub.ok_or(DecodeError::MissingPath(kind))?;
                let id = raw
                    .parse::<u32>()
                    .map_err(|_| DecodeError::ResponseId(raw.to_owned()))?;
                let response = serde_json::from_value(body.clone())
                    .map_err(|e| DecodeError::Body { kind, source: e })?;
                Message::Response { id, response }
            }
            MessageKind::Var => Message::Var(
                serde_json::from_value(body.clone())
                    .map_err(|e| DecodeError::Body { kind, source: e })?,
            ),
            MessageKind::DisconnectRequest => Message::DisconnectRequest,
            MessageKind::Disconnect => Message::Disconnect {
                reason: body.as_str().map(str::to_owned),
            },
            MessageKind::Socket => Message::Socket(body.clone()),
        };
        Ok(Some(msg))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Init { .. } => MessageKind::Init,
            Message::Response { .. } => MessageKind::Response,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::Post { .. } => MessageKind::Post,
            Message::Var(_) => MessageKind::Var,
            Message::DisconnectRequest => MessageKind::DisconnectRequest,
            Message::Disconnect { .. } => MessageKind::Disconnect,
            Message::Socket(_) => MessageKind::Socket,
        }
    }

    /// Split into the wire type string and body.
    pub fn into_parts(self) -> (String, Value) {
        let kind = self.kind();
        match self {
            Message::Init { credential } => (kind.as_str().to_owned(), Value::String(credential)),
            Message::Response { id, response } => (
                format!("response/{id}"),
                serde_json::json!({ "body": response.body, "status": response.status }),
            ),
            Message::Heartbeat | Message::DisconnectRequest => (kind.as_str().to_owned(), Value::Null),
            Message::Post { path, body } => (format!("post/{path}"), body),
            Message::Var(var) => (
                kind.as_str().to_owned(),
                serde_json::to_value(var).unwrap_or(Value::Null),
            ),
            Message::Disconnect { reason } => (
                kind.as_str().to_owned(),
                reason.map(Value::String).unwrap_or(Value::Null),
            ),
            Message::Socket(body) => (kind.as_str().to_owned(), body),
        }
    }

    pub fn into_envelope(self, id: Option<u32>, sent: u64) -> Envelope {
        let (kind, body) = self.into_parts();
        Envelope::new(kind, body, id, sent)
    }
}

/// Error decoding a known message type (malformed body or type suffix).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{} envelope without sub-path", .0.as_str())]
    MissingPath(MessageKind),
    #[error("invalid response id {0:?}")]
    ResponseId(String),
    #[error("init credential must be a string")]
    Credential,
    #[error("malformed {} body: {source}", .kind.as_str())]
    Body {
        kind: MessageKind,
        source: serde_json::Error,
    },
}
