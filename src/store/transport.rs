use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use super::signer::SignedHeaders;
use super::StoreError;

/// Delivers one signed batch to the store.
#[async_trait]
pub trait StoreTransport: Send + Sync {
    /// POST `body` to `endpoint`. Non-2xx responses and timeouts are errors.
    async fn send(&self, endpoint: &str, headers: &SignedHeaders, body: String) -> Result<Value, StoreError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl StoreTransport for HttpTransport {
    async fn send(&self, endpoint: &str, headers: &SignedHeaders, body: String) -> Result<Value, StoreError> {
        let mut request = self.client.post(endpoint).body(body);
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status: status.as_u16(), body });
        }
        Ok(response.json::<Value>().await?)
    }
}
