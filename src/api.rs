//! Client side of the remote pipeline service.
//!
//! Every endpoint answers with a streamed event body (see [`crate::stream`]).
//! The flows only talk to [`PipelineApi`], so tests can swap the HTTP
//! transport for a scripted one.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ServerConfig;
use crate::errors::ApiError;
use crate::stream::ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Analyze,
    AnalyzeGaps,
    CreateIssues,
    AssignCodingAgent,
    ExecuteLocalAgent,
    Deploy,
    Validate,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Analyze => "/api/analyze",
            Self::AnalyzeGaps => "/api/analyze-gaps",
            Self::CreateIssues => "/api/create-issues",
            Self::AssignCodingAgent => "/api/assign-coding-agent",
            Self::ExecuteLocalAgent => "/api/execute-local-agent",
            Self::Deploy => "/api/deploy",
            Self::Validate => "/api/validate",
        }
    }

    /// Short name used as the activity-log source.
    pub fn name(&self) -> &'static str {
        self.path().trim_start_matches("/api/")
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

#[async_trait]
pub trait PipelineApi: Send + Sync {
    /// Start a request and return its streamed body.
    ///
    /// A `Null` body on [`Endpoint::Analyze`] issues a GET (the server picks
    /// the latest meeting); everything else is a JSON POST.
    async fn open_stream(&self, endpoint: Endpoint, body: Value) -> Result<ByteStream, ApiError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(server: &ServerConfig) -> Result<Self, ApiError> {
        Self::new(
            server.base_url.clone(),
            Duration::from_secs(server.connect_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }
}

#[async_trait]
impl PipelineApi for HttpApi {
    async fn open_stream(&self, endpoint: Endpoint, body: Value) -> Result<ByteStream, ApiError> {
        let url = self.url(endpoint);
        let request = if endpoint == Endpoint::Analyze && body.is_null() {
            self.client.get(&url)
        } else {
            self.client.post(&url).json(&body)
        };
        debug!(%url, "Opening event stream");

        let response = request
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| {
                    if text.trim().is_empty() {
                        format!("{} failed with status {}", endpoint.path(), status)
                    } else {
                        text
                    }
                });
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ApiError::from))
            .boxed())
    }
}
