//! Configuration schema and loading.
//!
//! The YAML file has four top-level keys: `targets`, `tenants`,
//! `provider_key_pools`, and `client_profiles`. Validation is strict:
//! unknown fields, missing environment variables, duplicate key IDs,
//! non-positive limits, and dangling target references all fail startup.

mod loader;
mod schema;

pub use loader::{load_config, load_config_str};
pub use schema::*;

/// Configuration errors; all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML syntax: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("target '{target}': {message}")]
    InvalidTarget { target: String, message: String },
    #[error("tenant '{tenant}': {message}")]
    InvalidTenant { tenant: String, message: String },
    #[error("client profile '{profile}': {message}")]
    InvalidProfile { profile: String, message: String },
    #[error("provider key pool '{provider}': {message}")]
    InvalidPool { provider: String, message: String },
    #[error("environment variable '{0}' referenced in config is not set")]
    MissingEnv(String),
}
