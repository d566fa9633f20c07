use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::types::{
    DeployRequest, DeployResponse, ExplainRequest, ExplainResponse, FixRequest, FixResponse,
    Intelligence, MemoryProject, RunRequest, ServiceStatus, SkillTree, Template,
};

// ============================================================================
// API Client
// ============================================================================

/// HTTP boundary to the generation backend. Everything except `/run-stream`
/// is a plain unary JSON call.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the generation stream. The returned stream yields raw byte chunks;
    /// framing and JSON decoding happen in `SseFrameDecoder`.
    pub async fn run_stream(&self, request: &RunRequest) -> Result<BoxStream<'static, Result<Bytes>>> {
        let response = self
            .http
            .post(self.config.endpoint("/run-stream"))
            .json(request)
            .send()
            .await?;

        let response = response.error_for_status().map_err(ClientError::from)?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ClientError::from))
            .boxed())
    }

    // ------------------------------------------------------------------
    // Unary endpoints
    // ------------------------------------------------------------------

    pub async fn explain(&self, code: &str, language: &str) -> Result<ExplainResponse> {
        self.post(
            "/explain",
            &ExplainRequest {
                code: code.to_string(),
                language: language.to_string(),
            },
        )
        .await
    }

    pub async fn fix(&self, code: &str, error: &str) -> Result<FixResponse> {
        self.post(
            "/fix",
            &FixRequest {
                code: code.to_string(),
                error: error.to_string(),
            },
        )
        .await
    }

    pub async fn deploy(&self, project_name: &str) -> Result<DeployResponse> {
        self.post(
            "/deploy",
            &DeployRequest {
                project_name: project_name.to_string(),
            },
        )
        .await
    }

    pub async fn intelligence(&self) -> Result<Intelligence> {
        self.get("/intelligence").await
    }

    pub async fn skills(&self) -> Result<SkillTree> {
        self.get("/skills").await
    }

    pub async fn templates(&self) -> Result<Vec<Template>> {
        self.get("/templates").await
    }

    pub async fn memory(&self) -> Result<Vec<MemoryProject>> {
        self.get("/memory").await
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        self.get("/status").await
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(self.config.endpoint(path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.config.endpoint(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

// ============================================================================
// Tests
// ============================================================================
