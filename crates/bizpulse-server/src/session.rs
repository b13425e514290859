//! `WebSocket` session lifecycle: one authenticated dashboard from
//! registration through disconnect.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bizpulse_telemetry::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_CONNECTION_DURATION_SECONDS,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::handler::{handle_message, InboundHandler};
use crate::heartbeat::{Beat, Heartbeat};
use crate::registry::ConnectionRegistry;

pub(crate) struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub inbound: Arc<dyn InboundHandler>,
    pub heartbeat: Heartbeat,
}

/// Run a session for an authenticated connection.
///
/// 1. Marks the connection Open and registers it under its business
/// 2. Spawns the writer: drains the send queue, pings, closes on request
///    or heartbeat timeout
/// 3. Reads inbound frames and answers through the send queue
/// 4. On either side ending, unregisters exactly once
#[instrument(skip_all, fields(conn_id = %connection.id, business_id = %connection.business_id()))]
pub(crate) async fn run_ws_session(
    ws: WebSocket,
    connection: Arc<ClientConnection>,
    send_rx: mpsc::Receiver<Arc<str>>,
    ctx: SessionContext,
) {
    let (ws_tx, ws_rx) = ws.split();

    let _ = connection.mark_open();
    ctx.registry.add(connection.clone());
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        send_rx,
        connection.clone(),
        ctx.heartbeat,
    ));
    let reader = read_loop(ws_rx, connection.clone(), ctx.inbound);

    tokio::select! {
        () = reader => {}
        _ = &mut writer => {}
    }
    writer.abort();

    if connection.close() {
        let _ = ctx
            .registry
            .remove(connection.business_id(), &connection.id);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        let age = connection.age();
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(age.as_secs_f64());
        info!(
            duration_secs = age.as_secs(),
            dropped = connection.drop_count(),
            "client disconnected"
        );
    }
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    connection: Arc<ClientConnection>,
    inbound: Arc<dyn InboundHandler>,
) {
    while let Some(frame) = ws_rx.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        };
        connection.mark_alive();

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let Some(reply) = handle_message(&text, connection.business_id(), inbound.as_ref()).await
        else {
            continue;
        };
        match reply.to_json() {
            Ok(json) => {
                if !connection.send(Arc::from(json)) {
                    warn!("failed to enqueue reply (queue full or closed)");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize reply"),
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Arc<str>>,
    connection: Arc<ClientConnection>,
    mut heartbeat: Heartbeat,
) {
    let close_requested = connection.close_token();
    let mut ticker = tokio::time::interval(heartbeat.interval());
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = close_requested.cancelled() => {
                debug!("close requested");
                let _ = ws_tx.send(close_message(close_code::AWAY, "Server shutting down")).await;
                break;
            }
            msg = send_rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => match heartbeat.on_tick(connection.check_alive()) {
                Beat::Ping => {
                    if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
                Beat::TimedOut => {
                    warn!(
                        silent_for = ?connection.last_seen_elapsed(),
                        "client unresponsive, disconnecting"
                    );
                    let _ = ws_tx.send(close_message(close_code::AWAY, "Heartbeat timeout")).await;
                    break;
                }
            },
        }
    }
}

pub(crate) fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
