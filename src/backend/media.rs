//! Media server registration for published episodes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

const SERVICE: &str = "media server";

/// The server episodes are published to.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Registers a finished video and returns the server's id for it.
    async fn register(&self, path: &str, title: &str) -> Result<String, BackendError>;
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    path: &'a str,
    title: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: String,
}

/// Stand-in used when no media server URL is configured; every
/// registration fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredMediaServer;

#[async_trait]
impl MediaServer for UnconfiguredMediaServer {
    async fn register(&self, _path: &str, _title: &str) -> Result<String, BackendError> {
        Err(BackendError::NotConfigured(SERVICE))
    }
}

/// `POST {base}/media` with `{"path", "title"}`.
#[derive(Debug, Clone)]
pub struct HttpMediaServer {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpMediaServer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl MediaServer for HttpMediaServer {
    async fn register(&self, path: &str, title: &str) -> Result<String, BackendError> {
        let mut request = self
            .client
            .post(format!("{}/media", self.base_url))
            .json(&RegisterRequest { path, title });
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: RegisterResponse = response
            .json()
            .await
            .map_err(|e| BackendError::invalid(SERVICE, e.to_string()))?;
        Ok(body.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_server_refuses_registration() {
        let err = UnconfiguredMediaServer
            .register("/renders/episodes/e1.mp4", "Pilot")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotConfigured("media server")));
        assert_eq!(err.to_string(), "No media server configured");
    }
}
