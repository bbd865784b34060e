use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::extractor::provider::DEFAULT_SELECTOR;
use crate::extractor::{BackoffPolicy, ReadinessPolicy};
use crate::store::StoreConfig;

/// Runtime settings. Later sources override earlier ones:
/// built-in defaults, `shelf_scraper.toml`, then `SHELF_*` env vars.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub region: String,
    pub service: String,
    pub table_name: String,
    pub endpoint: Option<String>,
    pub db_path: PathBuf,
    pub request_timeout_secs: u64,
    pub chunk_delay_ms: u64,
    pub provider_selector: String,

    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub settle_ms: u64,

    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub budget_secs: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_builder(
            defaults()?
                .add_source(File::with_name("shelf_scraper").required(false))
                .add_source(Environment::with_prefix("SHELF")),
        )
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings: Settings = builder
            .build()
            .context("Failed to load settings")?
            .try_deserialize()
            .context("Invalid settings")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            bail!("region must not be empty");
        }
        if self.service.trim().is_empty() {
            bail!("service must not be empty");
        }
        if self.table_name.trim().is_empty() {
            bail!("table_name must not be empty");
        }
        if self.poll_attempts == 0 {
            bail!("poll_attempts must be at least 1");
        }
        if self.initial_delay_ms == 0 || self.max_delay_ms < self.initial_delay_ms {
            bail!(
                "backoff delays must satisfy 0 < initial_delay_ms ({}) <= max_delay_ms ({})",
                self.initial_delay_ms,
                self.max_delay_ms
            );
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        scraper::Selector::parse(&self.provider_selector)
            .map_err(|e| anyhow::anyhow!("provider_selector {:?} is invalid: {}", self.provider_selector, e))?;
        if let Some(endpoint) = &self.endpoint {
            url::Url::parse(endpoint).with_context(|| format!("endpoint {:?} is not a URL", endpoint))?;
        }
        Ok(())
    }

    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.poll_attempts,
            settle: Duration::from_millis(self.settle_ms),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_jitter: Duration::from_millis(self.jitter_ms),
            budget: Duration::from_secs(self.budget_secs),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            region: self.region.clone(),
            service: self.service.clone(),
            table_name: self.table_name.clone(),
            endpoint: self.endpoint.clone(),
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
    let builder = Config::builder()
        .set_default("region", "us-east-1")?
        .set_default("service", "dynamodb")?
        .set_default("table_name", "shelf-products")?
        .set_default("db_path", "data/shelf.sqlite")?
        .set_default("request_timeout_secs", 30)?
        .set_default("chunk_delay_ms", 300)?
        .set_default("provider_selector", DEFAULT_SELECTOR)?
        .set_default("poll_interval_ms", 1000)?
        .set_default("poll_attempts", 15)?
        .set_default("settle_ms", 500)?
        .set_default("initial_delay_ms", 1000)?
        .set_default("max_delay_ms", 10_000)?
        .set_default("jitter_ms", 1000)?
        .set_default("budget_secs", 90)?;
    Ok(builder)
}
