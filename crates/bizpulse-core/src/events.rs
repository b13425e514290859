//! Business events published by business logic and relayed to dashboards.
//!
//! Payloads are typed per kind. Fields the relay does not know about are kept
//! verbatim in each payload's `extra` map, so the relay never loses data a
//! publisher attached. Amounts are [`Number`]s, so `1200` stays an integer on
//! the wire, and an explicit `null` is relayed as `null`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use crate::errors::ProtocolError;
use crate::ids::BusinessId;

/// Closed set of event kinds the relay understands.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FinancialUpdate,
    ComplianceUpdate,
    TaxUpdate,
    DocumentUpdate,
    Alert,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::FinancialUpdate,
        EventKind::ComplianceUpdate,
        EventKind::TaxUpdate,
        EventKind::DocumentUpdate,
        EventKind::Alert,
    ];

    /// Wire name, identical to the `type` field of a server message.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FinancialUpdate => "financial_update",
            Self::ComplianceUpdate => "compliance_update",
            Self::TaxUpdate => "tax_update",
            Self::DocumentUpdate => "document_update",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_owned()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cash_flow: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_margin: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debt_ratio: Option<Number>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_due: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_due_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiring_documents: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    /// `info`, `warning`, `critical`; free-form on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a business event, one variant per [`EventKind`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    FinancialUpdate(FinancialUpdate),
    ComplianceUpdate(ComplianceUpdate),
    TaxUpdate(TaxUpdate),
    DocumentUpdate(DocumentUpdate),
    Alert(AlertPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::FinancialUpdate(_) => EventKind::FinancialUpdate,
            Self::ComplianceUpdate(_) => EventKind::ComplianceUpdate,
            Self::TaxUpdate(_) => EventKind::TaxUpdate,
            Self::DocumentUpdate(_) => EventKind::DocumentUpdate,
            Self::Alert(_) => EventKind::Alert,
        }
    }

    /// Build a typed payload for `kind` from untyped JSON. `null` is treated
    /// as an empty payload.
    pub fn from_json(kind: EventKind, value: Value) -> Result<Self, ProtocolError> {
        let value = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        let payload = match kind {
            EventKind::FinancialUpdate => Self::FinancialUpdate(decode(kind.as_str(), value)?),
            EventKind::ComplianceUpdate => Self::ComplianceUpdate(decode(kind.as_str(), value)?),
            EventKind::TaxUpdate => Self::TaxUpdate(decode(kind.as_str(), value)?),
            EventKind::DocumentUpdate => Self::DocumentUpdate(decode(kind.as_str(), value)?),
            EventKind::Alert => Self::Alert(decode(kind.as_str(), value)?),
        };
        Ok(payload)
    }
}

/// A payload struct with a flattened map for keys it does not model.
pub(crate) trait OpenPayload: DeserializeOwned {
    fn extra_mut(&mut self) -> &mut Map<String, Value>;
}

macro_rules! open_payload {
    ($($ty:ty => $field:ident),* $(,)?) => {
        $(impl $crate::events::OpenPayload for $ty {
            fn extra_mut(&mut self) -> &mut ::serde_json::Map<String, ::serde_json::Value> {
                &mut self.$field
            }
        })*
    };
}
pub(crate) use open_payload;

open_payload! {
    FinancialUpdate => extra,
    ComplianceUpdate => extra,
    TaxUpdate => extra,
    DocumentUpdate => extra,
    AlertPayload => extra,
}

/// Deserialize `value` as `T`, keeping explicit nulls.
///
/// `Option` fields read `null` as absent, so null-valued keys are set aside
/// before decoding and land in the `extra` map afterwards.
pub(crate) fn decode<T: OpenPayload>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    let (nulls, value) = match value {
        Value::Object(fields) => {
            let (nulls, rest): (Map<String, Value>, Map<String, Value>) =
                fields.into_iter().partition(|(_, v)| v.is_null());
            (nulls, Value::Object(rest))
        }
        other => (Map::new(), other),
    };
    let mut payload: T =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind: kind.to_owned(),
            reason: e.to_string(),
        })?;
    payload.extra_mut().extend(nulls);
    Ok(payload)
}

/// A state change announced for exactly one business.
#[derive(Clone, Debug, PartialEq)]
pub struct BusinessEvent {
    pub business_id: BusinessId,
    pub payload: EventPayload,
}

impl BusinessEvent {
    pub fn new(business_id: impl Into<BusinessId>, payload: EventPayload) -> Self {
        Self {
            business_id: business_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
