pub mod item;
pub mod signer;
pub mod transport;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::events::{EventSink, StatusEvent};
use crate::keys::SeenSet;
use crate::record::Record;
use item::StoreItem;
use signer::{SigningParams, BATCH_WRITE_TARGET};
use transport::StoreTransport;

/// Hard per-request item limit of the store's batch write.
pub const MAX_BATCH_ITEMS: usize = 25;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store credentials are not configured (run `shelf_scraper configure`)")]
    CredentialsMissing,
    #[error("credential store unavailable: {0:#}")]
    Database(anyhow::Error),
    #[error("request signing failed: {0}")]
    Signing(#[from] signer::SignError),
    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Where the writer gets its key pair. Missing keys are `CredentialsMissing`.
pub trait CredentialSource: Send + Sync {
    fn load(&self) -> Result<Credentials, StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub region: String,
    pub service: String,
    pub table_name: String,
    /// Overrides `https://<service>.<region>.amazonaws.com/`, e.g. for a local store.
    pub endpoint: Option<String>,
    /// Pause between consecutive batch sends.
    pub chunk_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            region: "us-east-1".to_string(),
            service: "dynamodb".to_string(),
            table_name: "shelf-products".to_string(),
            endpoint: None,
            chunk_delay: Duration::from_millis(300),
        }
    }
}

impl StoreConfig {
    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(url) => url.clone(),
            None => format!("https://{}/", self.default_host()),
        }
    }

    /// Host header value the signature is computed over.
    pub fn host(&self) -> String {
        self.endpoint
            .as_deref()
            .and_then(|e| Url::parse(e).ok())
            .and_then(|u| {
                let host = u.host_str()?.to_string();
                Some(match u.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host,
                })
            })
            .unwrap_or_else(|| self.default_host())
    }

    fn default_host(&self) -> String {
        format!("{}.{}.amazonaws.com", self.service, self.region)
    }
}

/// Aggregate outcome of one `write` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub success: bool,
    pub count: usize,
    /// Items in batches the store accepted.
    pub written: usize,
    pub batch_count: usize,
    pub succeeded_batches: usize,
    pub failed_batches: usize,
    pub errors: Vec<String>,
}

/// Sends records to the store in signed, paced batches of at most
/// `MAX_BATCH_ITEMS`. Batches go out one at a time; a failed batch is
/// recorded and the next one is still attempted.
pub struct BatchWriter<T, C> {
    transport: T,
    credentials: C,
    config: StoreConfig,
    events: EventSink,
}

impl<T: StoreTransport, C: CredentialSource> BatchWriter<T, C> {
    pub fn new(transport: T, credentials: C, config: StoreConfig) -> Self {
        BatchWriter { transport, credentials, config, events: EventSink::default() }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn write(&self, records: &[Record]) -> Result<WriteSummary, StoreError> {
        self.write_at(records, Utc::now()).await
    }

    /// `write` with an explicit clock for key and expiry derivation.
    pub async fn write_at(&self, records: &[Record], now: DateTime<Utc>) -> Result<WriteSummary, StoreError> {
        let credentials = self.credentials.load()?;

        let items = build_items(records, now);
        let chunks: Vec<&[StoreItem]> = items.chunks(MAX_BATCH_ITEMS).collect();
        let total = chunks.len();
        info!("Writing {} items in {} batches", items.len(), total);

        let mut summary = WriteSummary { count: items.len(), batch_count: total, ..Default::default() };

        for (i, chunk) in chunks.iter().enumerate() {
            debug!("Sending batch {}/{} ({} items)", i + 1, total, chunk.len());
            let requests = chunk.iter().map(StoreItem::put_request).collect();
            let ok = match self.send_batch(requests, &credentials).await {
                Ok(_) => {
                    summary.succeeded_batches += 1;
                    summary.written += chunk.len();
                    true
                }
                Err(e) => {
                    warn!("Batch {}/{} failed: {}", i + 1, total, e);
                    summary.failed_batches += 1;
                    summary.errors.push(format!("batch {}: {}", i + 1, e));
                    false
                }
            };
            self.events.emit(StatusEvent::BatchSent { index: i + 1, total, ok });

            if i + 1 < total {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
        }

        summary.success = summary.failed_batches == 0;
        info!(
            "Write finished: {}/{} items written, {} batches ok, {} failed",
            summary.written, summary.count, summary.succeeded_batches, summary.failed_batches
        );
        Ok(summary)
    }

    /// Send a one-item batch that expires in an hour.
    pub async fn check_connectivity(&self) -> Result<Value, StoreError> {
        let credentials = self.credentials.load()?;
        self.send_batch(vec![item::check_item(Utc::now())], &credentials).await
    }

    async fn send_batch(&self, requests: Vec<Value>, credentials: &Credentials) -> Result<Value, StoreError> {
        let body = serde_json::to_string(&item::batch_write_body(&self.config.table_name, requests))?;
        let host = self.config.host();
        let headers = signer::sign(
            &SigningParams {
                method: "POST",
                host: &host,
                region: &self.config.region,
                service: &self.config.service,
                target: BATCH_WRITE_TARGET,
                access_key: &credentials.access_key_id,
                secret_key: &credentials.secret_access_key,
                now: Utc::now(),
            },
            &body,
        )?;
        self.transport.send(&self.config.endpoint(), &headers, body).await
    }
}

/// Key every record against one fresh seen-set.
pub fn build_items(records: &[Record], now: DateTime<Utc>) -> Vec<StoreItem> {
    let mut seen = SeenSet::new();
    records.iter().map(|r| StoreItem::build(r, &mut seen, now)).collect()
}
