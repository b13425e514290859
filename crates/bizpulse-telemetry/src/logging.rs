use bizpulse_settings::{LogFormat, LoggingSettings};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Build the `EnvFilter` directive string from settings: the default level
/// followed by one `module=level` entry per override.
pub fn filter_directives(settings: &LoggingSettings) -> String {
    let mut directives = settings.level.to_lowercase();
    for (module, level) in &settings.modules {
        directives.push_str(&format!(",{}={}", module, level.to_lowercase()));
    }
    directives
}

/// Initialize the tracing subscriber. Call once at startup.
///
/// `RUST_LOG` wins over the configured levels when it is set.
pub fn init_telemetry(settings: &LoggingSettings) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(settings))
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };

    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}
