use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

/// Query-string parameters retailers commonly use for the search box.
const SEARCH_PARAMS: &[&str] = &["q", "query", "search", "keyword", "searchTerm", "term", "p", "s", "k"];

/// A read-only view of the document being scraped.
#[async_trait]
pub trait Page: Send + Sync {
    /// Current markup of the document.
    fn html(&self) -> Result<String>;
    /// Current location of the document.
    fn location(&self) -> String;
    /// Pick up changes at the page's origin. Pages that read their source
    /// on every call have nothing to do.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// A page backed by a file on disk, re-read on every call so that a page
/// still being written (or navigated) is observed as it changes.
pub struct FilePage {
    path: PathBuf,
}

impl FilePage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FilePage { path: path.into() }
    }

    fn fallback_location(&self) -> String {
        let abs = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        Url::from_file_path(&abs)
            .map(String::from)
            .unwrap_or_else(|_| format!("file://{}", abs.display()))
    }
}

#[async_trait]
impl Page for FilePage {
    fn html(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))
    }

    fn location(&self) -> String {
        self.html()
            .ok()
            .and_then(|html| declared_location(&html))
            .unwrap_or_else(|| self.fallback_location())
    }
}

/// A remote page. Each `refresh` fetches the URL again; `html` and `location`
/// return the latest snapshot.
pub struct HttpPage {
    client: reqwest::Client,
    url: String,
    snapshot: RwLock<Snapshot>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    location: String,
    html: String,
}

impl HttpPage {
    pub async fn fetch(client: reqwest::Client, url: &str) -> Result<Self> {
        let snapshot = fetch_snapshot(&client, url).await?;
        Ok(HttpPage { client, url: url.to_string(), snapshot: RwLock::new(snapshot) })
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Page for HttpPage {
    fn html(&self) -> Result<String> {
        Ok(self.snapshot().html)
    }

    fn location(&self) -> String {
        self.snapshot().location
    }

    async fn refresh(&self) -> Result<()> {
        let snapshot = fetch_snapshot(&self.client, &self.url).await?;
        debug!("Refreshed {} ({} bytes)", snapshot.location, snapshot.html.len());
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }
}

/// Location is what the document declares, else the final URL after redirects.
async fn fetch_snapshot(client: &reqwest::Client, url: &str) -> Result<Snapshot> {
    info!("Fetching page: {}", url);
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()?;
    let final_url = response.url().to_string();
    let html = response.text().await.context("Failed to read page body")?;
    let location = declared_location(&html).unwrap_or(final_url);
    Ok(Snapshot { location, html })
}

/// Build a page from a CLI target: `http(s)://` URLs are fetched,
/// anything else is treated as a local file.
pub async fn open(client: &reqwest::Client, target: &str) -> Result<Box<dyn Page>> {
    if target.starts_with("http://") || target.starts_with("https://") {
        Ok(Box::new(HttpPage::fetch(client.clone(), target).await?))
    } else {
        let path = Path::new(target);
        anyhow::ensure!(path.exists(), "No such file: {}", target);
        Ok(Box::new(FilePage::new(path)))
    }
}

/// `<link rel="canonical">` or `og:url`, whichever the document declares first.
pub fn declared_location(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let candidates = [
        ("link[rel=\"canonical\"]", "href"),
        ("meta[property=\"og:url\"]", "content"),
    ];
    candidates.iter().find_map(|(css, attr)| {
        let selector = Selector::parse(css).ok()?;
        doc.select(&selector)
            .filter_map(|el| el.value().attr(attr))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    })
}

/// The search query a results page was opened with, if any.
pub fn search_query(location: &str) -> Option<String> {
    let url = Url::parse(location).ok()?;

    for param in SEARCH_PARAMS {
        if let Some((_, value)) = url.query_pairs().find(|(k, _)| k == param) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    let (_, rest) = url.path().split_once("/search/")?;
    let term = rest.split('/').next().unwrap_or_default().replace('-', " ");
    let term = term.trim();
    (!term.is_empty()).then(|| term.to_string())
}
