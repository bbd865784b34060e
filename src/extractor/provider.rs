use std::sync::Arc;

use anyhow::anyhow;
use scraper::{Html, Selector};
use serde_json::Value;
use thiserror::Error;

use crate::page::Page;

pub const DEFAULT_SELECTOR: &str = "script#product-data";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider is not ready")]
    NotReady,
    #[error("page unavailable: {0:#}")]
    Page(anyhow::Error),
    #[error("provider payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The upstream product capability. It may be absent, present but not yet
/// ready, or ready and returning one of the payload shapes `normalize` knows.
pub trait ProductSource: Send + Sync {
    fn is_available(&self) -> bool;
    fn extract(&self) -> Result<Value, ProviderError>;
}

/// Reads a JSON payload published by the page in a `<script>` element,
/// e.g. `<script id="product-data" type="application/json">[...]</script>`.
///
/// The source is only available once the element exists *and* has content;
/// an empty placeholder element still counts as not ready.
pub struct EmbeddedJsonSource {
    page: Arc<dyn Page>,
    selector: String,
}

impl EmbeddedJsonSource {
    pub fn new(page: Arc<dyn Page>, selector: &str) -> anyhow::Result<Self> {
        Selector::parse(selector).map_err(|e| anyhow!("Invalid provider selector {:?}: {}", selector, e))?;
        Ok(EmbeddedJsonSource { page, selector: selector.to_string() })
    }

    fn payload(&self) -> Result<Option<String>, ProviderError> {
        let html = self.page.html().map_err(ProviderError::Page)?;
        Ok(embedded_payload(&html, &self.selector))
    }
}

impl ProductSource for EmbeddedJsonSource {
    fn is_available(&self) -> bool {
        matches!(self.payload(), Ok(Some(_)))
    }

    fn extract(&self) -> Result<Value, ProviderError> {
        let payload = self.payload()?.ok_or(ProviderError::NotReady)?;
        Ok(serde_json::from_str(&payload)?)
    }
}

/// Text of the first element matching `selector`, if it has any.
fn embedded_payload(html: &str, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let doc = Html::parse_document(html);
    doc.select(&selector)
        .map(|el| el.text().collect::<String>())
        .map(|t| t.trim().to_string())
        .find(|t| !t.is_empty())
}
