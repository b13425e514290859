//! # bizpulse-settings
//!
//! Layered configuration for the relay server, the client agent and logging.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`BizpulseSettings::default()`]
//! 2. **Settings file**: `~/.bizpulse/settings.json` or an explicit path
//! 3. **Environment variables**: `BIZPULSE_*` overrides
//!
//! There is no global instance: the binary loads settings once and hands
//! the sections to the components that need them.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_file_layers, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::*;
