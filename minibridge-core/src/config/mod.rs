//! Bridge configuration.
//!
//! YAML is the only on-disk format. Everything the bridge runs on is derived
//! from a validated [`BridgeConfig`] through its conversion methods.

pub mod duration_format;
pub mod error;
pub mod loader;
pub mod schema;

pub use error::ConfigError;
pub use loader::{
    CONFIG_ENV_VAR, default_config_paths, find_config_file, load_and_validate, load_config,
    substitute_env_vars,
};
pub use schema::{
    BridgeConfig, DEFAULT_POLICER_TIMEOUT, PolicerYamlConfig, ServerConfig, SessionYamlConfig,
    TelemetryYamlConfig,
};
