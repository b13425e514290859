mod logging;
pub mod metrics;

pub use logging::{filter_directives, init_telemetry, TelemetryError};
pub use metrics::{install_recorder, render};
