pub mod annotate;
pub mod client;
pub mod config;
pub mod error;
pub mod preview;
pub mod session;
pub mod stream;
pub mod types;
pub mod workspace;

pub use crate::client::ApiClient;
pub use crate::config::{ClientConfig, init_logging};
pub use crate::error::{ClientError, Result};
pub use crate::preview::{PreviewDocument, compose};
pub use crate::session::{
    CancellationToken, SessionEvent, SessionState, SessionStatus, StreamSession,
};
pub use crate::stream::SseFrameDecoder;
pub use crate::types::{AgentResult, ProgressUpdate, Review, RunRequest};
