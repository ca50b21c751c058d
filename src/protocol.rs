//! NOODLES wire protocol: message tags, CBOR framing, and the communication
//! payloads that are not components.
//!
//! A frame is one top-level CBOR array alternating `tag, payload, tag,
//! payload, …`. Tags are small integers fixed by the NOODLES message spec;
//! payloads are CBOR maps with the canonical field names. Several logical
//! messages may ride in one frame and are processed in order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use thiserror::Error;

use crate::ids::{ComponentKind, EntityId, MethodId, PlotId, SignalId, TableId};

// Server → client tags.
pub const TAG_DOCUMENT_UPDATE: u64 = 31;
pub const TAG_DOCUMENT_RESET: u64 = 32;
pub const TAG_SIGNAL_INVOKE: u64 = 33;
pub const TAG_METHOD_REPLY: u64 = 34;
pub const TAG_INIT_DONE: u64 = 35;

// Client → server tags.
pub const TAG_INTRO: u64 = 0;
pub const TAG_INVOKE_METHOD: u64 = 1;

/// Tag of the `Create` message for `kind`.
pub fn create_tag(kind: ComponentKind) -> u64 {
    match kind {
        ComponentKind::Method => 0,
        ComponentKind::Signal => 2,
        ComponentKind::Entity => 4,
        ComponentKind::Plot => 7,
        ComponentKind::Buffer => 10,
        ComponentKind::BufferView => 12,
        ComponentKind::Material => 14,
        ComponentKind::Image => 17,
        ComponentKind::Texture => 19,
        ComponentKind::Sampler => 21,
        ComponentKind::Light => 23,
        ComponentKind::Geometry => 26,
        ComponentKind::Table => 28,
    }
}

/// Tag of the `Update` message for `kind`, for the kinds that have one.
pub fn update_tag(kind: ComponentKind) -> Option<u64> {
    match kind {
        ComponentKind::Entity => Some(5),
        ComponentKind::Plot => Some(8),
        ComponentKind::Material => Some(15),
        ComponentKind::Light => Some(24),
        ComponentKind::Table => Some(29),
        _ => None,
    }
}

/// Tag of the `Delete` message for `kind`.
pub fn delete_tag(kind: ComponentKind) -> u64 {
    match kind {
        ComponentKind::Method => 1,
        ComponentKind::Signal => 3,
        ComponentKind::Entity => 6,
        ComponentKind::Plot => 9,
        ComponentKind::Buffer => 11,
        ComponentKind::BufferView => 13,
        ComponentKind::Material => 16,
        ComponentKind::Image => 18,
        ComponentKind::Texture => 20,
        ComponentKind::Sampler => 22,
        ComponentKind::Light => 25,
        ComponentKind::Geometry => 27,
        ComponentKind::Table => 30,
    }
}

/// Method exception codes (JSON-RPC style, per the NOODLES spec).
pub mod exception_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMETERS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Implementation-defined (reserved server-error range): delete refused
    /// because live components still reference the target.
    pub const IN_USE: i64 = -32000;
}

/// Error raised by a method handler and relayed to the invoking client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("method exception {code}: {}", .message.as_deref().unwrap_or(""))]
pub struct MethodException {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MethodException {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn method_not_found() -> Self {
        Self::new(exception_codes::METHOD_NOT_FOUND, "Method Not Found")
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(exception_codes::INVALID_PARAMETERS, message)
    }

    pub fn internal_error() -> Self {
        Self::new(exception_codes::INTERNAL_ERROR, "Internal Error")
    }

    pub fn in_use(message: impl Into<String>) -> Self {
        Self::new(exception_codes::IN_USE, message)
    }
}

/// Target a method or signal is invoked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeContext {
    Entity(EntityId),
    Table(TableId),
    Plot(PlotId),
}

#[derive(Serialize, Deserialize, Default)]
struct ContextFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    table: Option<TableId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plot: Option<PlotId>,
}

impl Serialize for InvokeContext {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields = ContextFields::default();
        match *self {
            InvokeContext::Entity(id) => fields.entity = Some(id),
            InvokeContext::Table(id) => fields.table = Some(id),
            InvokeContext::Plot(id) => fields.plot = Some(id),
        }
        fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InvokeContext {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = ContextFields::deserialize(deserializer)?;
        match (fields.entity, fields.table, fields.plot) {
            (Some(id), None, None) => Ok(InvokeContext::Entity(id)),
            (None, Some(id), None) => Ok(InvokeContext::Table(id)),
            (None, None, Some(id)) => Ok(InvokeContext::Plot(id)),
            _ => Err(serde::de::Error::custom(
                "context must name exactly one of entity/table/plot",
            )),
        }
    }
}

/// Reply to a method invocation, targeted at the invoking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub invoke_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_exception: Option<MethodException>,
}

/// Broadcast notification that a signal fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInvoke {
    pub id: SignalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<InvokeContext>,
    pub signal_data: Vec<Value>,
}

/// Document-level method/signal listing sent with every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub methods_list: Vec<MethodId>,
    pub signals_list: Vec<SignalId>,
}

/// Client handshake: the first (and only first) message a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intro {
    pub client_name: String,
}

/// Client request to run a method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub method: MethodId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<InvokeContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<Value>,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Any message a client may legally send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Intro(Intro),
    Invoke(InvokeRequest),
}

/// Protocol-level failures; any of these tears the session down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("cbor: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("frame is not an array of tag/payload pairs")]
    BadFraming,
    #[error("unknown message tag {0}")]
    UnknownTag(u64),
    #[error("payload for tag {0} is not a map")]
    BadPayload(u64),
}

/// One tagged logical message, payload already rendered to a CBOR value.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedMessage {
    pub tag: u64,
    pub payload: Value,
}

impl TaggedMessage {
    pub fn new<T: Serialize>(tag: u64, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            tag,
            payload: serde_cbor::value::to_value(payload)?,
        })
    }

    /// Empty-map payload, for messages that carry no fields (InitDone).
    pub fn empty(tag: u64) -> Self {
        Self {
            tag,
            payload: Value::Map(BTreeMap::new()),
        }
    }
}

/// Encode messages into a single wire frame.
pub fn encode_frame(messages: &[TaggedMessage]) -> Result<Vec<u8>, ProtocolError> {
    let mut items = Vec::with_capacity(messages.len() * 2);
    for msg in messages {
        items.push(Value::Integer(msg.tag as i128));
        items.push(msg.payload.clone());
    }
    Ok(serde_cbor::to_vec(&Value::Array(items))?)
}

/// Split a frame back into tagged messages without interpreting payloads.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<TaggedMessage>, ProtocolError> {
    let value: Value = serde_cbor::from_slice(bytes)?;
    let Value::Array(items) = value else {
        return Err(ProtocolError::BadFraming);
    };
    if items.len() % 2 != 0 {
        return Err(ProtocolError::BadFraming);
    }

    let mut messages = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(tag), Some(payload)) = (iter.next(), iter.next()) {
        let Value::Integer(tag) = tag else {
            return Err(ProtocolError::BadFraming);
        };
        let tag = u64::try_from(tag).map_err(|_| ProtocolError::BadFraming)?;
        messages.push(TaggedMessage { tag, payload });
    }
    Ok(messages)
}

/// Decode an inbound frame into client messages. Unknown tags fail the
/// session; unknown payload fields are ignored.
pub fn decode_client_frame(bytes: &[u8]) -> Result<Vec<ClientMessage>, ProtocolError> {
    let mut out = Vec::new();
    for msg in decode_frame(bytes)? {
        if !matches!(msg.payload, Value::Map(_)) {
            return Err(ProtocolError::BadPayload(msg.tag));
        }
        let parsed = match msg.tag {
            TAG_INTRO => ClientMessage::Intro(serde_cbor::value::from_value(msg.payload)?),
            TAG_INVOKE_METHOD => {
                ClientMessage::Invoke(serde_cbor::value::from_value(msg.payload)?)
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        out.push(parsed);
    }
    Ok(out)
}
