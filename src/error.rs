// Error types for wecare-sync.
// Covers API transport errors, credential errors, storage and configuration errors.

use reqwest::StatusCode;
use thiserror::Error;

use crate::cache::StorageError;
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum WeCareError {
    #[error("API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed: invalid or expired token")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Server error {status}: {message}")]
    Server { status: StatusCode, message: String },

    #[error("HTTP {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("No credential stored")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

impl WeCareError {
    /// HTTP status carried by this error, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            WeCareError::Http(e) => e.status(),
            WeCareError::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            WeCareError::NotFound(_) => Some(StatusCode::NOT_FOUND),
            WeCareError::Server { status, .. } | WeCareError::Status { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// 401-equivalent failures. These are never retried.
    pub fn is_auth_error(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// Failures where no response was received (connection refused, timeout, DNS).
    pub fn is_network_error(&self) -> bool {
        matches!(self, WeCareError::Http(e) if e.status().is_none())
    }

    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| s.is_server_error())
    }

    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        if self.is_network_error() {
            "Network connection failed. Please check your internet connection.".to_string()
        } else if self.is_auth_error() {
            "Authentication failed. Please log in again.".to_string()
        } else if self.is_server_error() {
            "Server error occurred. Please try again later.".to_string()
        } else {
            self.to_string()
        }
    }
}

pub type Result<T> = std::result::Result<T, WeCareError>;
