//! Common error types for Switchyard components.

use thiserror::Error;

/// Common errors that can occur across Switchyard components
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type alias using `SwitchyardError`
pub type Result<T> = std::result::Result<T, SwitchyardError>;
