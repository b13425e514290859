//! # bizpulse-client
//!
//! Dashboard-side agent for the bizpulse relay: connects with a bearer token,
//! dispatches server messages to handlers registered by `type`, and
//! reconnects with exponential backoff until it gives up.

#![deny(unsafe_code)]

pub mod agent;
pub mod backoff;
pub mod error;
pub mod handlers;
pub mod transport;

pub use agent::{ClientAgent, ClientOptions, ConnectionState};
pub use backoff::ReconnectPolicy;
pub use error::ClientError;
pub use handlers::{lifecycle, HandlerId, HandlerRegistry};
pub use transport::{CloseInfo, Connector, Frame, Transport, WsConnector};
