//! # lifeline-settings
//!
//! Configuration with layered sources.
//!
//! Settings are resolved in three layers (in priority order):
//! 1. **Compiled defaults**: [`LifelineSettings::default()`]
//! 2. **Settings file**: `$LIFELINE_SETTINGS` or `~/.lifeline/settings.json`,
//!    deep-merged over the defaults
//! 3. **Environment variables**: `LIFELINE_*` overrides (highest priority)
//!
//! The loaded value is validated once and then handed to the client or server
//! as an immutable snapshot. There is no process-wide settings singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
