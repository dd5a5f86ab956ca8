use std::path::PathBuf;

use thiserror::Error;

use crate::sandbox::SandboxError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of a single fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Server answered with a non-2xx status.
    #[error("HTTP {status} {reason}")]
    HttpStatus { status: u16, reason: String },

    /// DNS, connect, TLS, timeout or body-read failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Terminal failure of a run. Only `Network` is ever retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] FetchError),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("structure error: {0}")]
    Structure(String),

    #[error("filesystem error: {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("XML write error: {0}")]
    Render(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Network(_) => "NetworkError",
            Error::Extraction(_) => "ExtractionError",
            Error::Sandbox(_) => "SandboxError",
            Error::Structure(_) => "StructureError",
            Error::Filesystem { .. } => "FilesystemError",
            Error::Config(_) => "ConfigError",
            Error::Render(_) | Error::Xml(_) => "RenderError",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }
}
