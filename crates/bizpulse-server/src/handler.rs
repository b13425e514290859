//! Inbound frame dispatch: parses client text frames and routes known kinds
//! to an [`InboundHandler`].

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use bizpulse_core::messages::codes;
use bizpulse_core::{
    ActionComplete, BusinessId, ClientMessage, RawMessage, ServerMessage, SettingsUpdate,
    SyncRequest,
};
use futures::FutureExt;
use tracing::{debug, error, instrument, warn};

/// Failure reported by an [`InboundHandler`]; sent back as an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct InboundError {
    pub code: String,
    pub message: String,
}

impl InboundError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self::new(codes::HANDLER_FAILED, message)
    }
}

/// Application hook for client → server messages.
///
/// Every method defaults to a no-op. `Ok(Some(reply))` sends `reply` to the
/// originating connection only.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_sync_request(
        &self,
        _business_id: &BusinessId,
        _request: SyncRequest,
    ) -> Result<Option<ServerMessage>, InboundError> {
        Ok(None)
    }

    async fn on_action_complete(
        &self,
        _business_id: &BusinessId,
        _action: ActionComplete,
    ) -> Result<Option<ServerMessage>, InboundError> {
        Ok(None)
    }

    async fn on_settings_update(
        &self,
        _business_id: &BusinessId,
        _update: SettingsUpdate,
    ) -> Result<Option<ServerMessage>, InboundError> {
        Ok(None)
    }
}

/// Handler that accepts every message and never replies.
pub struct NoopInboundHandler;

#[async_trait]
impl InboundHandler for NoopInboundHandler {}

/// Handle one inbound text frame for a connection bound to `business_id`.
///
/// Returns the frame to send back, if any. Malformed input yields an `error`
/// frame; unknown kinds are logged and ignored. Nothing here closes the
/// connection.
#[instrument(skip_all, fields(business_id = %business_id, kind))]
pub async fn handle_message(
    text: &str,
    business_id: &BusinessId,
    handler: &dyn InboundHandler,
) -> Option<ServerMessage> {
    let raw = match RawMessage::parse(text) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "invalid JSON received");
            return Some(ServerMessage::error(e.code(), format!("Invalid JSON: {e}")));
        }
    };
    let _ = tracing::Span::current().record("kind", raw.kind.as_str());

    let message = match ClientMessage::from_raw(raw) {
        Ok(Some(message)) => message,
        Ok(None) => {
            debug!("ignoring unknown message kind");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "invalid payload received");
            return Some(ServerMessage::error(e.code(), e.to_string()));
        }
    };

    let dispatch = async {
        match message {
            ClientMessage::SyncRequest(req) => handler.on_sync_request(business_id, req).await,
            ClientMessage::ActionComplete(action) => {
                handler.on_action_complete(business_id, action).await
            }
            ClientMessage::SettingsUpdate(update) => {
                handler.on_settings_update(business_id, update).await
            }
        }
    };

    match AssertUnwindSafe(dispatch).catch_unwind().await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            warn!(code = %e.code, error = %e.message, "inbound handler failed");
            Some(ServerMessage::error(e.code, e.message))
        }
        Err(_) => {
            error!("inbound handler panicked");
            Some(ServerMessage::error(codes::UNKNOWN_ERROR, "internal error"))
        }
    }
}
