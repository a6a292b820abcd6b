use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineType;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The engine executable is missing from every known install location.
    #[error("{engine} executable not found (searched: {})", format_searched(.searched))]
    Installation {
        engine: EngineType,
        searched: Vec<PathBuf>,
    },

    #[error("{engine} launch failed: {message}")]
    Launch {
        engine: EngineType,
        message: String,
    },

    #[error("connect to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    #[error("page creation failed: {0}")]
    PageCreation(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("navigation timed out after {0}ms")]
    NavigationTimeout(u64),

    /// A driver call outside the launch/page-creation paths failed
    /// (close, reload, viewport reset, ...).
    #[error("engine driver error: {0}")]
    Driver(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_searched(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
