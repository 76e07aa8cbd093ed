pub mod paths;

use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single JSON line on the socket.
pub const MAX_JSON_LINE_BYTES: usize = 1024 * 1024;

/// Opaque proof of ownership minted on acquire.
pub type SessionId = String;

/// Device path as reported by the transport enumeration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PathInternal(pub String);

/// Stable device path handed out to callers in descriptors.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PathPublic(pub String);

impl PathInternal {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PathPublic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PathInternal {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PathInternal {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PathPublic {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PathPublic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PathInternal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PathPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptor keys owned by the service; transport metadata may not use them.
pub const RESERVED_DESCRIPTOR_KEYS: [&str; 3] = ["path", "session", "sessionOwner"];

/// One enumerated device as reported by the transport, without ownership.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DescriptorApiLevel {
    pub path: PathInternal,
    /// Product/type tags and anything else the transport reports.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl DescriptorApiLevel {
    pub fn new(path: impl Into<PathInternal>) -> Self {
        Self {
            path: path.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One device slot with its current ownership overlaid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub path: PathPublic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_owner: Option<String>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Client-to-service requests. Serialized adjacently tagged as
/// `{"type": ..., "payload": ...}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Request {
    Handshake,
    EnumerateDone(EnumerateDoneRequest),
    AcquireIntent(AcquireIntentRequest),
    AcquireDone(AcquireDoneRequest),
    ReleaseIntent(ReleaseIntentRequest),
    ReleaseDone(ReleaseDoneRequest),
    GetSessions,
    GetPathBySession(GetPathBySessionRequest),
    Dispose,
}

impl Request {
    /// Wire name of the request type.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Handshake => "handshake",
            Request::EnumerateDone(_) => "enumerateDone",
            Request::AcquireIntent(_) => "acquireIntent",
            Request::AcquireDone(_) => "acquireDone",
            Request::ReleaseIntent(_) => "releaseIntent",
            Request::ReleaseDone(_) => "releaseDone",
            Request::GetSessions => "getSessions",
            Request::GetPathBySession(_) => "getPathBySession",
            Request::Dispose => "dispose",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnumerateDoneRequest {
    pub descriptors: Vec<DescriptorApiLevel>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AcquireIntentRequest {
    pub path: PathPublic,
    /// Session the caller believes currently owns `path`.
    #[serde(
        default,
        alias = "previousSession",
        skip_serializing_if = "Option::is_none"
    )]
    pub previous: Option<SessionId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcquireDoneRequest {
    pub path: PathInternal,
    /// Session returned by the matching intent. When present the service
    /// refuses to finish anyone else's pending acquire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_owner: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReleaseIntentRequest {
    pub session: SessionId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReleaseDoneRequest {
    pub path: PathInternal,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetPathBySessionRequest {
    pub session: SessionId,
}

/// Success payload carrying a full descriptor snapshot
/// (enumerateDone, releaseDone, getSessions).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DescriptorsPayload {
    pub descriptors: Vec<Descriptor>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcquireIntentPayload {
    pub session: SessionId,
    pub path: PathInternal,
    /// Descriptor as it was owned by the superseded session on a hand-off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_request: Option<Descriptor>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AcquireDonePayload {
    pub session: SessionId,
    pub descriptors: Vec<Descriptor>,
}

/// Success payload of releaseIntent and getPathBySession.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PathPayload {
    pub path: PathInternal,
}

/// Request as it travels on the wire: `{type, payload?, caller?, id?}`.
///
/// The payload stays untyped until [`MessageEnvelope::to_request`] so a
/// malformed request can still be answered with its correlation id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl MessageEnvelope {
    pub fn new(request: &Request) -> serde_json::Result<Self> {
        let mut value = serde_json::to_value(request)?;
        let Some(object) = value.as_object_mut() else {
            return Err(serde_json::Error::custom(
                "request did not serialize to an object",
            ));
        };
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(serde_json::Error::custom("request is missing its type tag")),
        };
        Ok(Self {
            kind,
            payload: object.remove("payload"),
            caller: None,
            id: None,
        })
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Id echoed back in the response; 0 when the caller sent none.
    pub fn correlation_id(&self) -> u64 {
        self.id.unwrap_or(0)
    }

    /// Resolve the typed request. Fails on unknown `type` or a payload that
    /// does not fit the operation. `null` and `{}` both count as no payload.
    pub fn to_request(&self) -> serde_json::Result<Request> {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(payload) = self.payload.as_ref().filter(|p| !is_empty_payload(p)) {
            object.insert("payload".to_string(), payload.clone());
        }
        serde_json::from_value(Value::Object(object))
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Service-to-client response: `{success, payload?, error?, id}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    /// Human-readable detail, set for protocol-level errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub id: u64,
}

impl ResponseEnvelope {
    pub fn ok(id: u64, payload: Option<Value>) -> Self {
        Self {
            success: true,
            payload,
            error: None,
            message: None,
            id,
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: Option<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(code),
            message,
            id,
        }
    }

    /// Split into the success payload or the failure code with its detail.
    /// A failure envelope without a code counts as a protocol error.
    pub fn into_result(self) -> Result<Option<Value>, (ErrorCode, Option<String>)> {
        if self.success {
            Ok(self.payload)
        } else {
            Err((self.error.unwrap_or(ErrorCode::InvalidRequest), self.message))
        }
    }
}

/// Closed set of failure kinds carried in the failure envelope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionWrongPrevious,
    DescriptorNotFound,
    SessionNotFound,
    /// Protocol-level: unknown type or malformed payload.
    InvalidRequest,
    /// The service failed to produce an answer; not the caller's fault.
    ServerError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SessionWrongPrevious => "SESSION_WRONG_PREVIOUS",
            ErrorCode::DescriptorNotFound => "DESCRIPTOR_NOT_FOUND",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::ServerError => "SERVER_ERROR",
        }
    }

    /// Whether this is an arbitration outcome rather than a protocol fault.
    pub fn is_domain(&self) -> bool {
        !matches!(self, ErrorCode::InvalidRequest | ErrorCode::ServerError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications pushed to every connected context.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    Descriptors(Vec<Descriptor>),
    ReleaseRequest(Descriptor),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Descriptors(_) => EventKind::Descriptors,
            Event::ReleaseRequest(_) => EventKind::ReleaseRequest,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Descriptors,
    ReleaseRequest,
}

/// Any line the service writes to a socket client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Event { event: Event },
    Response(ResponseEnvelope),
}
