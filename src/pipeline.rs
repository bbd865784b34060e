use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::events::{EventSink, StatusEvent};
use crate::extractor::{ExtractionSource, Extractor};
use crate::page::{search_query, Page};
use crate::record::Record;
use crate::store::item::StoreItem;
use crate::store::transport::StoreTransport;
use crate::store::{build_items, BatchWriter, CredentialSource, StoreError};

/// Aggregate outcome of one extraction-and-write run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub location: String,
    pub source: ExtractionSource,
    pub found: usize,
    pub written: usize,
    pub batch_count: usize,
    pub succeeded_batches: usize,
    pub failed_batches: usize,
    pub success: bool,
    /// A newer run started first; nothing was written.
    pub stale: bool,
    pub error: Option<String>,
}

impl RunReport {
    fn new(collected: &Collected) -> Self {
        RunReport {
            location: collected.location.clone(),
            source: collected.source,
            found: collected.records.len(),
            written: 0,
            batch_count: 0,
            succeeded_batches: 0,
            failed_batches: 0,
            success: true,
            stale: false,
            error: None,
        }
    }
}

/// Records shaped from one extraction.
#[derive(Debug, Clone)]
pub struct Collected {
    pub location: String,
    pub source: ExtractionSource,
    pub records: Vec<Record>,
}

/// Hands out generation tickets. Starting a run makes every earlier ticket stale.
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    generation: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct RunTicket {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl RunTracker {
    pub fn begin(&self) -> RunTicket {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        RunTicket { generation, current: Arc::clone(&self.generation) }
    }
}

impl RunTicket {
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

/// Page → Extractor → Normalizer → BatchWriter, for one page.
pub struct Pipeline<T, C> {
    page: Arc<dyn Page>,
    extractor: Extractor,
    writer: BatchWriter<T, C>,
    events: EventSink,
    tracker: RunTracker,
}

impl<T, C> Pipeline<T, C>
where
    T: StoreTransport + 'static,
    C: CredentialSource + 'static,
{
    pub fn new(page: Arc<dyn Page>, extractor: Extractor, writer: BatchWriter<T, C>, events: EventSink) -> Self {
        Pipeline { page, extractor, writer, events, tracker: RunTracker::default() }
    }

    /// Extract and shape records without writing them.
    ///
    /// Records without their own search term inherit the one the payload was
    /// wrapped with, or failing that the query in the page location.
    pub async fn collect(&self, dom_only: bool) -> Collected {
        let extraction = self.extractor.extract(dom_only).await;
        let location = self.page.location();
        let captured_at = Utc::now();
        let context_term = extraction
            .normalized
            .search_term
            .clone()
            .or_else(|| search_query(&location));

        let records: Vec<Record> = extraction
            .normalized
            .items
            .iter()
            .filter_map(|raw| Record::from_raw(raw, &location, captured_at))
            .map(|mut record| {
                if record.search_term.is_none() {
                    record.search_term = context_term.clone();
                }
                record
            })
            .collect();

        info!(
            "Found {} products on {} via {} ({} attempts)",
            records.len(),
            location,
            extraction.source,
            extraction.attempts
        );
        self.events.emit(StatusEvent::Found { count: records.len(), source: extraction.source });
        Collected { location, source: extraction.source, records }
    }

    /// The put requests a run would send, without credentials or network.
    pub async fn preview(&self, dom_only: bool) -> Vec<Value> {
        let collected = self.collect(dom_only).await;
        build_items(&collected.records, Utc::now())
            .iter()
            .map(StoreItem::put_request)
            .collect()
    }

    /// One full run. Only a credential failure is returned as an error;
    /// failed batches are reported in the `RunReport`.
    pub async fn run(&self, dom_only: bool) -> Result<RunReport, StoreError> {
        let ticket = self.tracker.begin();
        self.run_ticketed(ticket, dom_only).await
    }

    async fn run_ticketed(&self, ticket: RunTicket, dom_only: bool) -> Result<RunReport, StoreError> {
        let collected = self.collect(dom_only).await;
        let mut report = RunReport::new(&collected);

        if !ticket.is_current() {
            info!("Discarding {} products from superseded run on {}", report.found, report.location);
            report.stale = true;
            report.success = false;
            self.events.emit(StatusEvent::Finished(report.clone()));
            return Ok(report);
        }

        if collected.records.is_empty() {
            info!("Nothing to write for {}", report.location);
            self.events.emit(StatusEvent::Finished(report.clone()));
            return Ok(report);
        }

        match self.writer.write(&collected.records).await {
            Ok(summary) => {
                report.written = summary.written;
                report.batch_count = summary.batch_count;
                report.succeeded_batches = summary.succeeded_batches;
                report.failed_batches = summary.failed_batches;
                report.success = summary.success;
                if !summary.errors.is_empty() {
                    report.error = Some(summary.errors.join("; "));
                }
                self.events.emit(StatusEvent::Finished(report.clone()));
                Ok(report)
            }
            Err(e) => {
                report.success = false;
                report.error = Some(e.to_string());
                self.events.emit(StatusEvent::Finished(report));
                Err(e)
            }
        }
    }

    /// Run now, then again whenever the page location changes. The page is
    /// refreshed on every tick before its location is compared. A new run
    /// aborts the previous one; if the old task still reaches its write, its
    /// stale ticket makes it discard the results. Never returns.
    pub async fn watch(self: Arc<Self>, poll: Duration, dom_only: bool) {
        let mut location = self.page.location();
        info!("Watching {} (every {}ms)", location, poll.as_millis());
        let mut current = self.spawn_run(dom_only);

        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.page.refresh().await {
                warn!("Refresh failed, keeping the last snapshot: {:#}", e);
                continue;
            }
            let now = self.page.location();
            if now == location {
                continue;
            }
            info!("Navigation detected: {} -> {}", location, now);
            self.events.emit(StatusEvent::NavigationDetected { location: now.clone() });
            location = now;
            current.abort();
            current = self.spawn_run(dom_only);
        }
    }

    fn spawn_run(self: &Arc<Self>, dom_only: bool) -> JoinHandle<()> {
        let ticket = self.tracker.begin();
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pipeline.run_ticketed(ticket, dom_only).await {
                warn!("Run failed: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::provider::{EmbeddedJsonSource, ProductSource, DEFAULT_SELECTOR};
    use crate::extractor::{BackoffPolicy, ReadinessPolicy};
    use crate::page::testing::{serve, MemoryPage};
    use crate::page::{open, FilePage};
    use crate::store::testing::{FakeTransport, FixedCredentials};
    use crate::store::StoreConfig;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn backoff() -> BackoffPolicy {
        BackoffPolicy { max_jitter: Duration::ZERO, budget: Duration::from_secs(5), ..BackoffPolicy::default() }
    }

    fn pipeline(
        page: Arc<dyn Page>,
        transport: FakeTransport,
        credentials: FixedCredentials,
        events: EventSink,
    ) -> Pipeline<FakeTransport, FixedCredentials> {
        let provider: Arc<dyn ProductSource> =
            Arc::new(EmbeddedJsonSource::new(page.clone(), DEFAULT_SELECTOR).unwrap());
        let extractor = Extractor::new(page.clone(), Some(provider), ReadinessPolicy::default(), backoff())
            .with_events(events.clone());
        let writer = BatchWriter::new(transport, credentials, StoreConfig::default()).with_events(events.clone());
        Pipeline::new(page, extractor, writer, events)
    }

    fn search_page(products: Value) -> String {
        format!(
            r#"<html><head><link rel="canonical" href="https://shop.example/search?q=coffee"></head>
            <body><script id="product-data" type="application/json">{}</script></body></html>"#,
            products
        )
    }

    fn grid_page(canonical: &str, name: &str) -> String {
        format!(
            r#"<html><head><link rel="canonical" href="{}"></head><body>
            <div class="product-grid"><div class="product"><span class="product-name">{}</span></div></div>
            </body></html>"#,
            canonical, name
        )
    }

    fn thirty_with_a_duplicate() -> Value {
        let mut products: Vec<Value> = (0..28).map(|i| json!({"name": format!("Blend {}", i)})).collect();
        products.push(json!({"name": "House Roast", "brand": "Acme"}));
        products.push(json!({"name": "House Roast", "brand": "Acme"}));
        json!(products)
    }

    fn items(sent: &crate::store::testing::Sent) -> Vec<Value> {
        sent.body["RequestItems"]["shelf-products"].as_array().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_with_duplicate_names() {
        let page: Arc<dyn Page> =
            Arc::new(MemoryPage::new("https://shop.example/search?q=coffee", search_page(thirty_with_a_duplicate())));
        let transport = FakeTransport::default();
        let p = pipeline(page, transport.clone(), FixedCredentials::valid(), EventSink::default());

        let report = p.run(false).await.unwrap();
        assert_eq!(report.source, ExtractionSource::Provider);
        assert_eq!(report.found, 30);
        assert_eq!(report.written, 30);
        assert_eq!(report.batch_count, 2);
        assert!(report.success);

        let sent = transport.sent();
        assert_eq!(items(&sent[0]).len(), 25);
        let last = items(&sent[1]);
        assert_eq!(last.len(), 5);

        let sk = |i: usize| last[i]["PutRequest"]["Item"]["SK"]["S"].as_str().unwrap().to_string();
        assert_eq!(format!("{}#1", sk(3)), sk(4));
        assert_eq!(
            last[4]["PutRequest"]["Item"]["ProductData"]["M"]["search"],
            json!({"S": "coffee"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batches_are_not_counted_as_written() {
        let products: Vec<Value> = (0..60).map(|i| json!({"name": format!("Blend {}", i)})).collect();
        let page: Arc<dyn Page> = Arc::new(MemoryPage::new("https://shop.example/", search_page(json!(products))));
        let transport = FakeTransport::failing_on(&[2]);
        let p = pipeline(page, transport.clone(), FixedCredentials::valid(), EventSink::default());

        let report = p.run(false).await.unwrap();
        assert_eq!(report.found, 60);
        assert_eq!(report.written, 35);
        assert_eq!(report.succeeded_batches, 2);
        assert_eq!(report.failed_batches, 1);
        assert!(!report.success);
        assert!(report.error.is_some());
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_fail_the_run() {
        let page: Arc<dyn Page> = Arc::new(MemoryPage::new("https://shop.example/", search_page(json!([{"name": "Tea"}]))));
        let transport = FakeTransport::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let p = pipeline(page, transport.clone(), FixedCredentials(None), EventSink::new(tx));

        let err = p.run(false).await.unwrap_err();
        assert!(matches!(err, StoreError::CredentialsMissing));
        assert!(transport.sent().is_empty());
        drop(p);

        let mut finished = None;
        while let Some(event) = rx.recv().await {
            if let StatusEvent::Finished(report) = event {
                finished = Some(report);
            }
        }
        let report = finished.unwrap();
        assert!(!report.success);
        assert!(report.error.unwrap().contains("credentials"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_writes_nothing() {
        let page: Arc<dyn Page> = Arc::new(MemoryPage::new("https://shop.example/", "<p>closed</p>"));
        let transport = FakeTransport::default();
        let p = pipeline(page, transport.clone(), FixedCredentials(None), EventSink::default());

        let report = p.run(false).await.unwrap();
        assert_eq!(report.source, ExtractionSource::Dom);
        assert_eq!(report.found, 0);
        assert_eq!(report.batch_count, 0);
        assert!(report.success);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_run_discards_its_results() {
        let page: Arc<dyn Page> = Arc::new(MemoryPage::new("https://shop.example/", search_page(json!([{"name": "Tea"}]))));
        let transport = FakeTransport::default();
        let p = pipeline(page, transport.clone(), FixedCredentials::valid(), EventSink::default());

        let old = p.tracker.begin();
        let _newer = p.tracker.begin();
        let report = p.run_ticketed(old, false).await.unwrap();

        assert!(report.stale);
        assert_eq!(report.found, 1);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn tickets_go_stale_in_order() {
        let tracker = RunTracker::default();
        let a = tracker.begin();
        assert!(a.is_current());
        let b = tracker.begin();
        assert!(!a.is_current());
        assert!(b.is_current());
    }

    #[tokio::test(start_paused = true)]
    async fn preview_uses_wrapper_search_term() {
        let payload = json!({"searchTerm": "oat milk", "products": [{"name": "Oatly"}]});
        let page: Arc<dyn Page> = Arc::new(MemoryPage::new("https://shop.example/", search_page(payload)));
        let p = pipeline(page, FakeTransport::default(), FixedCredentials(None), EventSink::default());

        let requests = p.preview(false).await;
        assert_eq!(requests.len(), 1);
        let item = &requests[0]["PutRequest"]["Item"];
        assert_eq!(item["GSI3PK"], json!({"S": "SEARCH#oat"}));
        assert_eq!(item["ProductData"]["M"]["search"], json!({"S": "oat milk"}));
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_starts_a_new_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, grid_page("https://shop.example/search?q=tea", "Green Tea")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let page: Arc<dyn Page> = Arc::new(FilePage::new(&path));
        let transport = FakeTransport::default();
        let p = Arc::new(pipeline(page, transport.clone(), FixedCredentials::valid(), EventSink::new(tx)));
        let watcher = tokio::spawn(p.watch(Duration::from_millis(200), true));

        let mut finished = Vec::new();
        let mut navigated = false;
        let collected = tokio::time::timeout(Duration::from_secs(60), async {
            while let Some(event) = rx.recv().await {
                match event {
                    StatusEvent::Finished(report) => {
                        finished.push(report);
                        if finished.len() == 1 {
                            std::fs::write(&path, grid_page("https://shop.example/search?q=coffee", "Dark Roast")).unwrap();
                        } else {
                            break;
                        }
                    }
                    StatusEvent::NavigationDetected { location } => {
                        assert_eq!(location, "https://shop.example/search?q=coffee");
                        navigated = true;
                    }
                    _ => {}
                }
            }
        })
        .await;
        watcher.abort();

        assert!(collected.is_ok());
        assert!(navigated);
        assert_eq!(finished[0].location, "https://shop.example/search?q=tea");
        assert_eq!(finished[1].location, "https://shop.example/search?q=coffee");
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn watch_refreshes_remote_pages() {
        let addr = serve(vec![
            (200, grid_page("https://shop.example/search?q=tea", "Green Tea")),
            (200, grid_page("https://shop.example/search?q=coffee", "Dark Roast")),
        ])
        .await;
        let page: Arc<dyn Page> = Arc::from(open(&reqwest::Client::new(), &format!("http://{}/", addr)).await.unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = FakeTransport::default();
        let p = Arc::new(pipeline(page, transport.clone(), FixedCredentials::valid(), EventSink::new(tx)));
        let watcher = tokio::spawn(p.watch(Duration::from_millis(50), true));

        let mut finished = Vec::new();
        let mut navigated = false;
        let collected = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                match event {
                    StatusEvent::Finished(report) => {
                        finished.push(report);
                        if finished.len() == 2 {
                            break;
                        }
                    }
                    StatusEvent::NavigationDetected { .. } => navigated = true,
                    _ => {}
                }
            }
        })
        .await;
        watcher.abort();

        assert!(collected.is_ok());
        assert!(navigated);
        assert_eq!(finished[0].location, "https://shop.example/search?q=tea");
        assert_eq!(finished[1].location, "https://shop.example/search?q=coffee");
        assert_eq!(transport.sent().len(), 2);
    }
}
