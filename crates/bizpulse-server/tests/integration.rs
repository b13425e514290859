//! End-to-end tests against a live relay using a real `WebSocket` client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

use bizpulse_core::{
    AlertPayload, BusinessId, ComplianceUpdate, ServerMessage, SettingsUpdate, SyncRequest,
};
use bizpulse_server::{
    DrainOutcome, EventBus, InboundError, InboundHandler, JwtAuthenticator, RelayServer,
    StaticTokenAuthenticator, TokenAuthenticator,
};
use bizpulse_settings::ServerSettings;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn test_config() -> ServerSettings {
    ServerSettings {
        port: 0,
        ..ServerSettings::default()
    }
}

fn static_auth() -> Arc<dyn TokenAuthenticator> {
    Arc::new(StaticTokenAuthenticator::new([
        ("t1", "biz1"),
        ("t1b", "biz1"),
        ("t2", "biz2"),
    ]))
}

/// Boot a relay and return it with its WS URL.
async fn boot_with(server: RelayServer) -> (Arc<RelayServer>, String) {
    let server = Arc::new(server);
    let (addr, _handle) = server.listen().await.unwrap();
    (server, format!("ws://{addr}/ws"))
}

async fn boot() -> (Arc<RelayServer>, String) {
    boot_with(RelayServer::new(
        test_config(),
        Arc::new(EventBus::new()),
        static_auth(),
    ))
    .await
}

async fn connect_bearer(url: &str, token: &str) -> WsStream {
    let mut request = url.into_client_request().unwrap();
    let _ = request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    let (ws, _) = timeout(TIMEOUT, connect_async(request))
        .await
        .unwrap()
        .unwrap();
    ws
}

async fn wait_for_connections(server: &RelayServer, expected: usize) {
    timeout(TIMEOUT, async {
        while server.registry().connection_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {expected} connections, have {}",
            server.registry().connection_count()
        )
    });
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert no text frame arrives within `QUIET`.
async fn assert_silent(ws: &mut WsStream) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(QUIET, ws.next()).await {
        panic!("unexpected frame: {text}");
    }
}

async fn expect_close_code(ws: &mut WsStream) -> u16 {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

fn at_risk() -> ComplianceUpdate {
    ComplianceUpdate {
        status: Some("At Risk".into()),
        ..Default::default()
    }
}

// ── Fan-out isolation ──

#[tokio::test]
async fn events_reach_only_their_business() {
    let (server, url) = boot().await;
    let mut a1 = connect_bearer(&url, "t1").await;
    let mut a2 = connect_bearer(&url, "t1b").await;
    let mut b1 = connect_bearer(&url, "t2").await;
    wait_for_connections(&server, 3).await;

    let report = server.events().emit_compliance_update("biz1", at_risk());
    assert_eq!(report.listeners, 1);

    let expected = json!({"type": "compliance_update", "payload": {"status": "At Risk"}});
    assert_eq!(next_json(&mut a1).await, expected);
    assert_eq!(next_json(&mut a2).await, expected);
    assert_silent(&mut b1).await;
}

#[tokio::test]
async fn events_for_business_without_connections_go_nowhere() {
    let (server, url) = boot().await;
    let mut a = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    let _ = server.events().emit_alert("biz404", AlertPayload::default());
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn per_connection_order_is_publish_order() {
    let (server, url) = boot().await;
    let mut ws = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    let events = server.events();
    for i in 0..20 {
        let _ = events
            .emit_json(
                bizpulse_core::EventKind::FinancialUpdate,
                "biz1",
                json!({"cashFlow": i}),
            )
            .unwrap();
    }
    for i in 0..20 {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["payload"]["cashFlow"], i);
    }
}

#[tokio::test]
async fn amounts_and_nulls_arrive_as_published() {
    let (server, url) = boot().await;
    let mut ws = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    let _ = server
        .events()
        .emit_json(
            bizpulse_core::EventKind::FinancialUpdate,
            "biz1",
            json!({"cashFlow": 1200, "profitMargin": null, "debtRatio": 0.5}),
        )
        .unwrap();

    let text = loop {
        match timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => break text.as_str().to_owned(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert!(text.contains(r#""cashFlow":1200"#), "{text}");
    let frame: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(
        frame["payload"],
        json!({"cashFlow": 1200, "profitMargin": null, "debtRatio": 0.5})
    );
}

// ── Authentication ──

#[tokio::test]
async fn invalid_token_closes_with_1008() {
    let (server, url) = boot().await;
    let mut ws = connect_bearer(&url, "wrong").await;
    assert_eq!(expect_close_code(&mut ws).await, 1008);
    assert_eq!(server.registry().connection_count(), 0);
}

#[tokio::test]
async fn missing_token_closes_with_1008() {
    let (server, url) = boot().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(expect_close_code(&mut ws).await, 1008);
    assert_eq!(server.registry().connection_count(), 0);
}

#[tokio::test]
async fn query_param_token_is_accepted() {
    let (server, url) = boot().await;
    let (mut ws, _) = connect_async(format!("{url}?token=t2")).await.unwrap();
    wait_for_connections(&server, 1).await;
    assert_eq!(server.registry().get(&BusinessId::from("biz2")).len(), 1);

    let _ = server.events().emit_alert(
        "biz2",
        AlertPayload {
            severity: Some("warning".into()),
            title: Some("Cash Flow Alert".into()),
            message: Some("Negative cash flow detected".into()),
            ..Default::default()
        },
    );
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "alert");
    assert_eq!(frame["payload"]["title"], "Cash Flow Alert");
}

#[tokio::test]
async fn jwt_token_binds_subject_business() {
    let jwt = Arc::new(JwtAuthenticator::new("test-secret", None));
    let token = jwt
        .mint_token(&BusinessId::from("acme"), Duration::from_secs(60))
        .unwrap();
    let (server, url) = boot_with(RelayServer::new(
        test_config(),
        Arc::new(EventBus::new()),
        jwt,
    ))
    .await;

    let mut ws = connect_bearer(&url, &token).await;
    wait_for_connections(&server, 1).await;
    let _ = server.events().emit_compliance_update("acme", at_risk());
    assert_eq!(next_json(&mut ws).await["type"], "compliance_update");
}

// ── Inbound messages ──

#[tokio::test]
async fn malformed_json_gets_error_frame_and_connection_stays_open() {
    let (server, url) = boot().await;
    let mut ws = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    ws.send(Message::text("this is not json")).await.unwrap();
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["payload"]["code"], "INVALID_JSON");

    let _ = server.events().emit_compliance_update("biz1", at_risk());
    assert_eq!(next_json(&mut ws).await["type"], "compliance_update");
    assert_eq!(server.registry().connection_count(), 1);
}

#[tokio::test]
async fn unknown_kind_is_ignored() {
    let (server, url) = boot().await;
    let mut ws = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    ws.send(Message::text(r#"{"type":"launch_rockets","payload":{}}"#))
        .await
        .unwrap();
    assert_silent(&mut ws).await;
    assert_eq!(server.registry().connection_count(), 1);
}

#[derive(Default)]
struct RecordingHandler {
    syncs: Mutex<Vec<(String, Option<Vec<String>>)>>,
}

#[async_trait]
impl InboundHandler for RecordingHandler {
    async fn on_sync_request(
        &self,
        business_id: &BusinessId,
        request: SyncRequest,
    ) -> Result<Option<ServerMessage>, InboundError> {
        self.syncs
            .lock()
            .push((business_id.to_string(), request.sections));
        Ok(Some(ServerMessage::ComplianceUpdate(at_risk())))
    }

    async fn on_settings_update(
        &self,
        _business_id: &BusinessId,
        _update: SettingsUpdate,
    ) -> Result<Option<ServerMessage>, InboundError> {
        Err(InboundError::handler_failed("settings are read-only"))
    }
}

#[tokio::test]
async fn inbound_handler_sees_business_and_replies_to_sender_only() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, url) = boot_with(
        RelayServer::new(test_config(), Arc::new(EventBus::new()), static_auth())
            .with_inbound_handler(handler.clone()),
    )
    .await;
    let mut sender = connect_bearer(&url, "t1").await;
    let mut sibling = connect_bearer(&url, "t1b").await;
    wait_for_connections(&server, 2).await;

    sender
        .send(Message::text(
            r#"{"type":"sync_request","payload":{"sections":["compliance"]}}"#,
        ))
        .await
        .unwrap();
    assert_eq!(next_json(&mut sender).await["type"], "compliance_update");
    assert_silent(&mut sibling).await;
    assert_eq!(
        handler.syncs.lock().as_slice(),
        [("biz1".to_string(), Some(vec!["compliance".to_string()]))]
    );

    sender
        .send(Message::text(r#"{"type":"settings_update","payload":{"theme":"dark"}}"#))
        .await
        .unwrap();
    let frame = next_json(&mut sender).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["payload"]["code"], "HANDLER_FAILED");
    assert_eq!(frame["payload"]["message"], "settings are read-only");
}

// ── Lifecycle ──

#[tokio::test]
async fn client_close_unregisters_connection() {
    let (server, url) = boot().await;
    let mut a = connect_bearer(&url, "t1").await;
    let _b = connect_bearer(&url, "t2").await;
    wait_for_connections(&server, 2).await;
    assert_eq!(server.registry().business_count(), 2);

    a.close(None).await.unwrap();
    wait_for_connections(&server, 1).await;
    assert_eq!(server.registry().business_count(), 1);
    assert!(server.registry().get(&BusinessId::from("biz1")).is_empty());
}

#[tokio::test]
async fn connection_cap_refuses_upgrade_with_503() {
    let config = ServerSettings {
        max_connections: 1,
        ..test_config()
    };
    let (server, url) =
        boot_with(RelayServer::new(config, Arc::new(EventBus::new()), static_auth())).await;
    let _first = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    let mut request = url.as_str().into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("Authorization", HeaderValue::from_static("Bearer t2"));
    match connect_async(request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 503);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}

#[tokio::test]
async fn silent_client_is_dropped_by_heartbeat() {
    let config = ServerSettings {
        heartbeat_interval_secs: 1,
        heartbeat_timeout_secs: 1,
        ..test_config()
    };
    let (server, url) =
        boot_with(RelayServer::new(config, Arc::new(EventBus::new()), static_auth())).await;
    // Never polled, so pings go unanswered.
    let _silent = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let (server, url) = boot().await;
    let mut ws = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    server.shutdown();
    assert_eq!(expect_close_code(&mut ws).await, 1001);
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn shutdown_and_drain_stops_listener_and_closes_sockets() {
    let server = Arc::new(RelayServer::new(
        test_config(),
        Arc::new(EventBus::new()),
        static_auth(),
    ));
    let (addr, listener) = server.listen().await.unwrap();
    let url = format!("ws://{addr}/ws");
    let mut ws = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    let outcome = server.shutdown_and_drain(listener, TIMEOUT).await;
    assert_eq!(outcome, DrainOutcome::Stopped);
    assert_eq!(expect_close_code(&mut ws).await, 1001);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn health_over_http() {
    let (server, url) = boot().await;
    let _ws = connect_bearer(&url, "t1").await;
    wait_for_connections(&server, 1).await;

    let health_url = url.replace("ws://", "http://").replace("/ws", "/health");
    let body: Value = reqwest::get(&health_url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["businesses"], 1);
}
