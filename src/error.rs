use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DiffError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Story enumeration failed: {0}")]
    Enumeration(String),

    #[error("Capture failed for {url}: {reason}")]
    Capture { url: String, reason: String },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Comparison failed: {0}")]
    Comparison(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DiffError {
    pub fn capture(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        DiffError::Capture {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// How far an error is allowed to propagate.
    pub fn scope(&self) -> ErrorScope {
        match self {
            DiffError::Capture { .. } | DiffError::Timeout(_) | DiffError::Comparison(_) => {
                ErrorScope::Local
            }
            DiffError::Image(_) => ErrorScope::Local,
            DiffError::Publish(_) => ErrorScope::Deferred,
            _ => ErrorScope::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.scope(), ErrorScope::Fatal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Skips the affected story only
    Local,
    /// Reported after all comparison work is done, marks the run failed
    Deferred,
    /// Aborts the run before (or instead of) the batch phase
    Fatal,
}

/// Non-fatal configuration finding, logged at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationWarning {
    pub field: &'static str,
    pub message: String,
}

impl ConfigurationWarning {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigurationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl From<std::io::Error> for DiffError {
    fn from(err: std::io::Error) -> Self {
        DiffError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DiffError {
    fn from(err: serde_json::Error) -> Self {
        DiffError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for DiffError {
    fn from(err: image::ImageError) -> Self {
        DiffError::Image(err.to_string())
    }
}

impl From<reqwest::Error> for DiffError {
    fn from(err: reqwest::Error) -> Self {
        DiffError::Publish(err.to_string())
    }
}
