//! CLI error types.

use wm_config::ConfigError;
use wm_markup::RegistryError;

/// CLI error type.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Format(String),

    #[error("{0}")]
    Validation(String),
}
