//! Error types for the conversational agent

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Turn Pipeline Errors
    // =============================

    /// Missing credential or invalid setting. Aborts the turn before any model call.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Model provider error: {0}")]
    ProviderError(String),

    #[error("Tool execution error: {0}")]
    ToolExecutionError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Message store error: {0}")]
    StoreError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Schedule error: {0}")]
    ScheduleError(String),

    #[error("Turn cancelled")]
    Cancelled,

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the error should abort the whole turn instead of being
    /// reported in-conversation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::ConfigurationError(_) | AgentError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AgentError::ConfigurationError("GEMINI_API_KEY".into()).is_fatal());
        assert!(AgentError::Cancelled.is_fatal());
        assert!(!AgentError::ProviderError("timeout".into()).is_fatal());
        assert!(!AgentError::ToolExecutionError("boom".into()).is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = AgentError::ToolNotFound("get_weather_information".into());
        assert_eq!(err.to_string(), "Tool not found: get_weather_information");
    }
}
