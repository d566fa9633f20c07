use crate::error::{ClientError, Result};

// ============================================================================
// Configuration
// ============================================================================

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the generation backend.
    pub base_url: String,
    /// Bound on the mpsc channel carrying session events back to the caller.
    pub event_buffer: usize,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            event_buffer: 100,
        }
    }

    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let base_url =
            std::env::var("AUTOGENESIS_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ClientError::config(format!(
                "AUTOGENESIS_URL must be an http(s) URL, got '{}'",
                base_url
            )));
        }
        let event_buffer = match std::env::var("AUTOGENESIS_EVENT_BUFFER") {
            Ok(v) => v
                .parse()
                .map_err(|_| ClientError::config("AUTOGENESIS_EVENT_BUFFER must be an integer"))?,
            Err(_) => 100,
        };
        Ok(Self {
            base_url,
            event_buffer,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

/// Host applications call this once at startup. Safe to skip if the host wires
/// up its own logger.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

// ============================================================================
// Tests
// ============================================================================
