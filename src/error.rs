use thiserror::Error;

// ============================================================================
// Main Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection drop, non-2xx response, or any other network failure.
    /// Surfaced to the caller; the owning session transitions to `Errored`.
    #[error("transport error: {0}")]
    Transport(String),

    /// A unary endpoint returned a body we could not decode. Malformed frames
    /// inside the generation stream are never raised as this; they are dropped
    /// by the decoder.
    #[error("decode error: {0}")]
    Decode(String),

    /// An operation was invoked from the wrong session state, e.g. `start`
    /// while a run is active or `cancel` with nothing running.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ClientError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Error Conversion Implementations
// ============================================================================

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(format!("response body: {}", err))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(format!("IO error: {}", err))
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn log_error(error: &ClientError) {
    match error {
        ClientError::Transport(_) => log::error!("{}", error),
        _ => log::warn!("{}", error),
    }
}

// ============================================================================
// Tests
// ============================================================================
