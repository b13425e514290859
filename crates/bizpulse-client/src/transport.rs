//! Socket abstraction the agent drives, plus the tokio-tungstenite
//! implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::ClientError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// A frame surfaced to the agent. Control frames are handled below this.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<CloseInfo>),
}

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ClientError>;

    /// Next frame, or `None` once the stream has ended. Must be cancel-safe.
    async fn next_frame(&mut self) -> Option<Result<Frame, ClientError>>;

    async fn close(&mut self) -> Result<(), ClientError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<Box<dyn Transport>, ClientError>;
}

/// Plain `ws://` connector; the token travels as `Authorization: Bearer`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<Box<dyn Transport>, ClientError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl(format!("{url}: {e}")))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::Connect(format!("unusable token: {e}")))?;
            let _ = request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
        self.ws
            .send(Message::text(text))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, ClientError>> {
        loop {
            let msg = match self.ws.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                },
                Message::Close(frame) => {
                    return Some(Ok(Frame::Close(frame.map(|f| CloseInfo {
                        code: u16::from(f.code),
                        reason: f.reason.to_string(),
                    }))))
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }
}
