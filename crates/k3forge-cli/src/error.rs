//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Forge(#[from] k3forge::Error),

    #[error("config file not found: {path}")]
    ConfigNotFound { path: PathBuf },
}
