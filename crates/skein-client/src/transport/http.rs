//! HTTP transport for the ingestion API.
//!
//! Batches are POSTed to `{base_url}/call/batch` as `{"batch": [...]}` with
//! bearer authentication. The backend answers with one result per entry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use skein_trace::CallOp;

use super::{BatchRequest, BatchResponse, EntryOutcome, Transport};
use crate::config::{ClientConfig, DEFAULT_BASE_URL};
use crate::error::{ClientError, Result};

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL of the ingestion API.
    pub base_url: String,

    /// API key sent as a bearer token.
    pub api_key: Option<String>,

    /// Project the calls belong to.
    pub project_id: Option<String>,

    /// Request timeout.
    pub timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            project_id: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("SKEIN_API_KEY").map_err(|_| {
            ClientError::Config("SKEIN_API_KEY environment variable not set".to_string())
        })?;
        let base_url =
            std::env::var("SKEIN_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(base_url).with_api_key(api_key))
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project_id = Some(project.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<&ClientConfig> for HttpTransportConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            base_url: config.transport.base_url.clone(),
            api_key: config.transport.api_key.clone(),
            project_id: Some(config.project.clone()),
            timeout: config.timeout(),
        }
    }
}

/// Ingestion API transport.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(HttpTransportConfig::from_env()?)
    }

    fn batch_url(&self) -> String {
        format!("{}/call/batch", self.config.base_url.trim_end_matches('/'))
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.config.base_url.trim_end_matches('/'))
    }

    fn add_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(header::CONTENT_TYPE, "application/json");
        match &self.config.api_key {
            Some(key) => builder.header(header::AUTHORIZATION, format!("Bearer {}", key)),
            None => builder,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[CallOp]) -> Result<Vec<EntryOutcome>> {
        let body = BatchRequest {
            project_id: self.config.project_id.clone(),
            batch: batch.to_vec(),
        };

        let response = self
            .add_headers(self.client.post(self.batch_url()))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: BatchResponse = serde_json::from_str(&text)?;
        if parsed.results.len() != batch.len() {
            tracing::warn!(
                expected = batch.len(),
                received = parsed.results.len(),
                "Backend returned a mismatched result count"
            );
        }
        Ok(parsed.results)
    }

    fn name(&self) -> &str {
        "http"
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .add_headers(self.client.get(self.health_url()))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::Rejected {
                status: response.status().as_u16(),
                message: "health check failed".to_string(),
            })
        }
    }
}
