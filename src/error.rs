use thiserror::Error;

/// Error types for generation, refinement and session operations.
#[derive(Debug, Error)]
pub enum StudioError {
    #[error("Gemini client error: {0}")]
    Gemini(#[from] gemini_rust::ClientError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Context error: {0}")]
    Context(String),

    #[error("Session store is no longer running")]
    StoreClosed,
}

impl StudioError {
    /// Create a transport error from any displayable message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error came from talking to the model.
    ///
    /// These are the failures the gateway retries; everything else is raised immediately.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Gemini(_) | Self::Http(_) | Self::Transport(_) | Self::Timeout { .. }
        )
    }

    /// Whether this error is a configuration problem that should skip a task.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StudioError>;

/// Extension trait for adding context to errors.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn with_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<StudioError>> ResultExt<T> for std::result::Result<T, E> {
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let base_err = e.into();
            StudioError::Context(format!("{}: {}", context.into(), base_err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_family_is_retryable() {
        assert!(StudioError::transport("connection reset").is_transport());
        assert!(StudioError::Timeout { after_ms: 60_000 }.is_transport());
        assert!(!StudioError::config("bad schema").is_transport());
        assert!(!StudioError::StoreClosed.is_transport());
    }

    #[test]
    fn with_context_prefixes_message() {
        let err: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let wrapped = err.with_context("loading profiles").unwrap_err();
        assert!(wrapped.to_string().contains("loading profiles: I/O error: missing"));
    }
}
