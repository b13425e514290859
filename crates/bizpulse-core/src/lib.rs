//! # bizpulse-core
//!
//! Shared vocabulary of the bizpulse relay: identifiers, business events and
//! the JSON frames exchanged with dashboard clients.

pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;

pub use errors::ProtocolError;
pub use events::{
    AlertPayload, BusinessEvent, ComplianceUpdate, DocumentUpdate, EventKind, EventPayload,
    FinancialUpdate, TaxUpdate,
};
pub use ids::{BusinessId, ConnectionId, SubscriptionId};
pub use messages::{
    ActionComplete, ClientMessage, ClientMessageKind, ErrorPayload, RawMessage, ServerMessage,
    SettingsUpdate, SyncRequest,
};
