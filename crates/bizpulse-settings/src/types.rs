//! Settings structs. Every section fills missing keys from its `Default`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BizpulseSettings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

impl BizpulseSettings {
    /// Reject combinations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalSecs must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutSecs must not be shorter than the interval".into(),
            ));
        }
        if self.client.max_delay_ms < self.client.base_delay_ms {
            return Err(SettingsError::InvalidValue(
                "client.maxDelayMs must be >= client.baseDelayMs".into(),
            ));
        }
        Ok(())
    }
}

/// Relay server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Per-connection outbound queue length.
    pub send_queue_capacity: usize,
    /// Interval between server pings.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            max_connections: 500,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
        }
    }
}

/// How bearer tokens resolve to business ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// HS256 JWTs whose `sub` claim is the business id.
    #[default]
    Jwt,
    /// Fixed token table, for local development.
    Static,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    pub mode: AuthMode,
    /// HS256 signing secret. No default: `serve` and `token` refuse to run in
    /// `jwt` mode until one is configured.
    pub jwt_secret: String,
    /// Expected `iss` claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_issuer: Option<String>,
    /// Lifetime of tokens minted by `bizpulse token`.
    pub token_ttl_secs: u64,
    /// Token → business id, used when `mode` is `static`.
    pub static_tokens: BTreeMap<String, String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            mode: AuthMode::Jwt,
            jwt_secret: String::new(),
            jwt_issuer: None,
            token_ttl_secs: 3600,
            static_tokens: BTreeMap::new(),
        }
    }
}

impl AuthSettings {
    /// The configured JWT secret, rejecting a blank one.
    pub fn require_jwt_secret(&self) -> Result<&str> {
        let secret = self.jwt_secret.trim();
        if secret.is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.jwtSecret must be set (BIZPULSE_JWT_SECRET) in jwt mode".into(),
            ));
        }
        Ok(&self.jwt_secret)
    }
}

/// Reconnect policy for the client agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub outbound_queue_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            outbound_queue_capacity: 64,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
    /// Per-module level overrides, e.g. `bizpulse_server = "debug"`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            modules: BTreeMap::new(),
        }
    }
}
