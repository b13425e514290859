//! Reconnecting client agent.
//!
//! One background task owns the socket. It dispatches inbound frames to the
//! [`HandlerRegistry`], forwards queued outbound frames, and on disconnect
//! waits out the [`ReconnectPolicy`] before trying again.

use std::sync::Arc;

use bizpulse_core::{ClientMessage, RawMessage};
use bizpulse_settings::ClientSettings;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::ClientError;
use crate::handlers::{lifecycle, HandlerId, HandlerRegistry};
use crate::transport::{CloseInfo, Connector, Frame, Transport, WsConnector};

const AUTH_FAILED_CODE: u16 = 1008;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Reconnect attempts exhausted. `connect` starts over.
    Failed,
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub token: Option<String>,
    pub policy: ReconnectPolicy,
    pub outbound_queue_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_settings(&ClientSettings::default())
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            token: None,
            policy: ReconnectPolicy::from_settings(settings),
            outbound_queue_capacity: settings.outbound_queue_capacity.max(1),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    handlers: Arc<HandlerRegistry>,
    state: watch::Sender<ConnectionState>,
    /// Present only while Open.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum SessionEnd {
    Cancelled,
    /// The connector never produced a transport.
    Refused(ClientError),
    Closed(Option<CloseInfo>),
    Failed(ClientError),
}

pub struct ClientAgent {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl ClientAgent {
    pub fn new(connector: Arc<dyn Connector>, options: ClientOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                options,
                handlers: Arc::new(HandlerRegistry::new()),
                state,
                outbound: Mutex::new(None),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Agent over a real `WebSocket`.
    pub fn websocket(options: ClientOptions) -> Self {
        Self::new(Arc::new(WsConnector), options)
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.shared.handlers
    }

    pub fn on<F>(&self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.handlers.on(kind, handler)
    }

    pub fn off(&self, kind: &str, id: HandlerId) -> bool {
        self.shared.handlers.off(kind, id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Start connecting to `url` in the background.
    ///
    /// A no-op while a connection is already active. Must be called inside a
    /// Tokio runtime.
    pub fn connect(&self, url: impl Into<String>) -> Result<(), ClientError> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ClientError::InvalidUrl(url));
        }

        let mut driver = self.driver.lock();
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Failed => {}
            state => {
                debug!(?state, "connect ignored, agent already active");
                return Ok(());
            }
        }
        if let Some(old) = driver.take() {
            old.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        self.shared.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(drive(self.shared.clone(), url, cancel.clone()));
        *driver = Some(Driver { cancel, task });
        Ok(())
    }

    /// Close the socket and stop reconnecting.
    pub async fn disconnect(&self) {
        let driver = self.driver.lock().take();
        if let Some(Driver { cancel, task }) = driver {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "client driver ended abnormally");
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    pub fn send(&self, message: &ClientMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(error = %e, "failed to serialize message");
                false
            }
        }
    }

    /// Send an arbitrary JSON frame.
    pub fn send_raw(&self, value: Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Queue a text frame. Returns false, with a warning, unless Open.
    fn send_text(&self, text: String) -> bool {
        let sender = match self.state() {
            ConnectionState::Open => self.shared.outbound.lock().clone(),
            _ => None,
        };
        let Some(sender) = sender else {
            warn!("websocket not connected, message not sent");
            return false;
        };
        match sender.try_send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "outbound queue rejected message");
                false
            }
        }
    }
}

impl Drop for ClientAgent {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.cancel.cancel();
        }
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "client state changed");
        }
    }

    fn connection_error(&self, e: &ClientError) {
        let _ = self
            .handlers
            .dispatch(lifecycle::CONNECTION_ERROR, &json!({ "message": e.to_string() }));
    }

    fn dispatch_text(&self, text: &str) {
        match RawMessage::parse(text) {
            Ok(raw) => {
                let _ = self.handlers.dispatch(&raw.kind, &raw.payload);
            }
            Err(e) => warn!(error = %e, "failed to parse server message"),
        }
    }

    async fn run_open(
        &self,
        mut transport: Box<dyn Transport>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (tx, mut rx) = mpsc::channel(self.options.outbound_queue_capacity.max(1));
        *self.outbound.lock() = Some(tx);
        self.set_state(ConnectionState::Open);

        let end = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    if let Err(e) = transport.close().await {
                        debug!(error = %e, "close handshake failed");
                    }
                    break SessionEnd::Cancelled;
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = transport.send_text(text).await {
                        break SessionEnd::Failed(e);
                    }
                }
                frame = transport.next_frame() => match frame {
                    Some(Ok(Frame::Text(text))) => self.dispatch_text(&text),
                    Some(Ok(Frame::Close(info))) => break SessionEnd::Closed(info),
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    None => break SessionEnd::Closed(None),
                },
            }
        };

        *self.outbound.lock() = None;
        end
    }
}

/// Connect, run, and reconnect until cancelled or out of attempts.
///
/// The attempt counter resets only after a session that was open and ended
/// for a reason other than a credential rejection. A 1008 close counts as a
/// failed attempt, so a revoked token ends in `Failed`.
async fn drive(shared: Arc<Shared>, url: String, cancel: CancellationToken) {
    let policy = shared.options.policy.clone();
    let mut attempts: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);
        let end = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = shared.connector.connect(&url, shared.options.token.as_deref()) => match result {
                Ok(transport) => {
                    info!(url = %url, "connected to relay");
                    shared.run_open(transport, &cancel).await
                }
                Err(e) => SessionEnd::Refused(e),
            },
        };

        if matches!(end, SessionEnd::Cancelled) {
            break;
        }
        shared.set_state(ConnectionState::Reconnecting);

        match end {
            SessionEnd::Cancelled => break,
            SessionEnd::Refused(e) => {
                warn!(error = %e, attempt = attempts, "connect attempt failed");
                shared.connection_error(&e);
            }
            SessionEnd::Closed(Some(info)) if info.code == AUTH_FAILED_CODE => {
                warn!(reason = %info.reason, attempt = attempts, "relay rejected credentials");
                let _ = shared.handlers.dispatch(
                    lifecycle::AUTH_FAILED,
                    &json!({ "code": info.code, "reason": info.reason }),
                );
            }
            SessionEnd::Closed(info) => {
                info!(code = ?info.as_ref().map(|i| i.code), "relay connection closed");
                attempts = 0;
            }
            SessionEnd::Failed(e) => {
                warn!(error = %e, "relay connection failed");
                attempts = 0;
                shared.connection_error(&e);
            }
        }

        if attempts >= policy.max_attempts {
            error!(attempts, "max reconnection attempts reached");
            shared.set_state(ConnectionState::Failed);
            let _ = shared
                .handlers
                .dispatch(lifecycle::MAX_RECONNECT_ATTEMPTS, &Value::Null);
            return;
        }

        attempts += 1;
        let delay = policy.delay(attempts);
        info!(
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ConnectionState::Disconnected);
}
