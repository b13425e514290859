//! # bizpulse-server
//!
//! Real-time relay between business logic and connected dashboards.
//!
//! - [`bus::EventBus`]: in-process publish/subscribe keyed by event kind
//! - [`registry::ConnectionRegistry`]: live connections grouped by business
//! - [`server::RelayServer`]: Axum HTTP + `WebSocket` gateway with token auth,
//!   heartbeat, per-connection send queues and graceful shutdown

#![deny(unsafe_code)]

pub mod auth;
pub mod bus;
pub mod connection;
pub mod error;
pub mod handler;
pub mod health;
pub mod heartbeat;
pub mod registry;
pub mod relay;
pub mod server;
mod session;
pub mod shutdown;

pub use auth::{
    build_authenticator, extract_token, AuthError, JwtAuthenticator, StaticTokenAuthenticator,
    TokenAuthenticator,
};
pub use bus::{BusinessEvents, EventBus, ListenerError, PublishReport};
pub use connection::{ClientConnection, ReadyState};
pub use error::ServerError;
pub use handler::{InboundError, InboundHandler, NoopInboundHandler};
pub use registry::{ConnectionRegistry, FanOutReport};
pub use relay::RelayBridge;
pub use server::RelayServer;
pub use shutdown::{DrainOutcome, ShutdownCoordinator, DRAIN_TIMEOUT};
