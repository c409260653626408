//! HTTP client for the service process contract (`/init` plus routes).

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::{OrchestratorError, OrchestratorResult};

pub const INIT_PATH: &str = "/init";

#[derive(Debug, Clone)]
pub struct ServiceClient {
    client: Client,
    host: String,
}

impl ServiceClient {
    pub fn new(host: impl Into<String>, timeout: Duration) -> OrchestratorResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }

    pub fn endpoint(&self, port: u16, path: &str) -> OrchestratorResult<Url> {
        let base = format!("http://{}:{}/", self.host, port);
        Url::parse(&base)
            .and_then(|u| u.join(path))
            .map_err(|e| {
                OrchestratorError::Configuration(format!("invalid endpoint {}{}: {}", base, path, e))
            })
    }

    /// POST `body` as JSON. Non-2xx answers become `Upstream` carrying the
    /// verbatim response body.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        port: u16,
        path: &str,
        body: &T,
    ) -> OrchestratorResult<Value> {
        let url = self.endpoint(port, path)?;
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("reading response from {}: {}", url, e)))?;

        if !status.is_success() {
            return Err(OrchestratorError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            OrchestratorError::Internal(format!("response from {} is not JSON: {}", url, e))
        })
    }

    /// One attempt of the initialization handshake.
    pub async fn init<T: Serialize + ?Sized>(&self, port: u16, descriptor: &T) -> OrchestratorResult<()> {
        self.post_json(port, INIT_PATH, descriptor).await.map(|_| ())
    }
}
