//! Wire frames exchanged between the relay and dashboard clients.
//!
//! Every frame is a JSON text frame of the form `{"type": ..., "payload": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::events::{
    decode, AlertPayload, ComplianceUpdate, DocumentUpdate, EventKind, EventPayload,
    FinancialUpdate, TaxUpdate,
};

/// Error codes carried in `error` frames.
pub mod codes {
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }
}

/// Server → client frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    FinancialUpdate(FinancialUpdate),
    ComplianceUpdate(ComplianceUpdate),
    TaxUpdate(TaxUpdate),
    DocumentUpdate(DocumentUpdate),
    Alert(AlertPayload),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload::new(code, message))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::FinancialUpdate(_) => EventKind::FinancialUpdate.as_str(),
            Self::ComplianceUpdate(_) => EventKind::ComplianceUpdate.as_str(),
            Self::TaxUpdate(_) => EventKind::TaxUpdate.as_str(),
            Self::DocumentUpdate(_) => EventKind::DocumentUpdate.as_str(),
            Self::Alert(_) => EventKind::Alert.as_str(),
            Self::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<EventPayload> for ServerMessage {
    fn from(payload: EventPayload) -> Self {
        match payload {
            EventPayload::FinancialUpdate(p) => Self::FinancialUpdate(p),
            EventPayload::ComplianceUpdate(p) => Self::ComplianceUpdate(p),
            EventPayload::TaxUpdate(p) => Self::TaxUpdate(p),
            EventPayload::DocumentUpdate(p) => Self::DocumentUpdate(p),
            EventPayload::Alert(p) => Self::Alert(p),
        }
    }
}

/// Kinds a client may send to the relay.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessageKind {
    SyncRequest,
    ActionComplete,
    SettingsUpdate,
}

impl ClientMessageKind {
    pub const ALL: [ClientMessageKind; 3] = [
        ClientMessageKind::SyncRequest,
        ClientMessageKind::ActionComplete,
        ClientMessageKind::SettingsUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyncRequest => "sync_request",
            Self::ActionComplete => "action_complete",
            Self::SettingsUpdate => "settings_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Dashboard sections to resync; absent means everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

crate::events::open_payload! {
    SyncRequest => extra,
    ActionComplete => extra,
    SettingsUpdate => settings,
}

/// Client → server frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    SyncRequest(SyncRequest),
    ActionComplete(ActionComplete),
    SettingsUpdate(SettingsUpdate),
}

impl ClientMessage {
    pub fn kind(&self) -> ClientMessageKind {
        match self {
            Self::SyncRequest(_) => ClientMessageKind::SyncRequest,
            Self::ActionComplete(_) => ClientMessageKind::ActionComplete,
            Self::SettingsUpdate(_) => ClientMessageKind::SettingsUpdate,
        }
    }

    /// Resolve a raw envelope into a typed message.
    ///
    /// Returns `Ok(None)` for kinds the relay does not handle.
    pub fn from_raw(raw: RawMessage) -> Result<Option<Self>, ProtocolError> {
        let Some(kind) = ClientMessageKind::parse(&raw.kind) else {
            return Ok(None);
        };
        let payload = if raw.payload.is_null() {
            Value::Object(Map::new())
        } else {
            raw.payload
        };
        let message = match kind {
            ClientMessageKind::SyncRequest => Self::SyncRequest(decode(kind.as_str(), payload)?),
            ClientMessageKind::ActionComplete => {
                Self::ActionComplete(decode(kind.as_str(), payload)?)
            }
            ClientMessageKind::SettingsUpdate => {
                Self::SettingsUpdate(decode(kind.as_str(), payload)?)
            }
        };
        Ok(Some(message))
    }
}

/// Untyped envelope used where the set of kinds is open.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl RawMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}
