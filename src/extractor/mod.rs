pub mod dom;
pub mod provider;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::events::{EventSink, StatusEvent};
use crate::normalize::{normalize, Normalized};
use crate::page::Page;
use provider::ProductSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionSource {
    Provider,
    Dom,
}

impl ExtractionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionSource::Provider => "provider",
            ExtractionSource::Dom => "dom",
        }
    }
}

impl fmt::Display for ExtractionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("provider not ready after {attempts} polls")]
    ProviderUnavailable { attempts: u32 },
}

/// How long to wait for the provider to exist before giving up on it.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Pause after the provider appears, before its first use.
    pub settle: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        ReadinessPolicy {
            interval: Duration::from_secs(1),
            max_attempts: 15,
            settle: Duration::from_millis(500),
        }
    }
}

/// Retry schedule for extraction calls that come back empty.
///
/// Delays start at `initial_delay`, double up to `max_delay`, and each gets up
/// to `max_jitter` of random extra. The whole loop is bounded by `budget`
/// wall-clock time rather than an attempt count.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    pub budget: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_jitter: Duration::from_secs(1),
            budget: Duration::from_secs(90),
        }
    }
}

impl BackoffPolicy {
    /// The delay schedule before jitter. Never ends.
    pub fn delays(&self) -> Delays {
        Delays { next: self.initial_delay.min(self.max_delay), max: self.max_delay }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=max_ms))
        }
    }
}

/// Doubling delays capped at `max`.
#[derive(Debug, Clone)]
pub struct Delays {
    next: Duration,
    max: Duration,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next;
        self.next = delay.saturating_mul(2).min(self.max);
        Some(delay)
    }
}

/// Outcome of one extraction call.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub source: ExtractionSource,
    pub normalized: Normalized,
    pub attempts: u32,
}

/// Retry state for a single backoff loop; dropped when the loop returns.
struct Attempt {
    count: u32,
    started: Instant,
    delays: Delays,
}

/// Acquires products from the provider, falling back to the DOM.
///
/// ```text
/// WaitingForProvider --ready--> Extracting(provider) --empty after budget--+
///        |                                                                   |
///        +--polls exhausted-----------------------> Extracting(dom) <--------+
/// ```
pub struct Extractor {
    page: Arc<dyn Page>,
    provider: Option<Arc<dyn ProductSource>>,
    readiness: ReadinessPolicy,
    backoff: BackoffPolicy,
    events: EventSink,
}

impl Extractor {
    pub fn new(
        page: Arc<dyn Page>,
        provider: Option<Arc<dyn ProductSource>>,
        readiness: ReadinessPolicy,
        backoff: BackoffPolicy,
    ) -> Self {
        Extractor { page, provider, readiness, backoff, events: EventSink::default() }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Full extraction. Never fails: an absent provider falls back to the
    /// DOM, and an exhausted budget yields an empty result.
    pub async fn extract(&self, dom_only: bool) -> Extraction {
        if !dom_only {
            match &self.provider {
                Some(provider) => match self.wait_for_provider(provider.as_ref()).await {
                    Ok(()) => {
                        let extraction = self
                            .with_backoff(ExtractionSource::Provider, || from_provider(provider.as_ref()))
                            .await;
                        if !extraction.normalized.is_empty() {
                            return extraction;
                        }
                        info!("Provider yielded nothing, falling back to DOM extraction");
                    }
                    Err(e) => {
                        info!("{}, falling back to DOM extraction", e);
                        self.events.emit(StatusEvent::ProviderUnavailable);
                    }
                },
                None => {
                    debug!("No provider configured, using DOM extraction");
                    self.events.emit(StatusEvent::ProviderUnavailable);
                }
            }
        }

        let location = self.page.location();
        self.with_backoff(ExtractionSource::Dom, || self.from_dom(&location)).await
    }

    /// Poll until the provider reports ready, then let it settle.
    pub async fn wait_for_provider(&self, provider: &dyn ProductSource) -> Result<(), ExtractError> {
        let max_attempts = self.readiness.max_attempts;
        for attempt in 1..=max_attempts {
            debug!("Checking for provider (attempt {}/{})", attempt, max_attempts);
            self.events.emit(StatusEvent::WaitingForProvider { attempt, max_attempts });

            if provider.is_available() {
                info!("Provider ready after {} polls", attempt);
                self.events.emit(StatusEvent::ProviderReady);
                sleep(self.readiness.settle).await;
                return Ok(());
            }
            if attempt < max_attempts {
                sleep(self.readiness.interval).await;
            }
        }
        Err(ExtractError::ProviderUnavailable { attempts: max_attempts })
    }

    /// Call `extract` until it yields something or the budget runs out.
    /// Returns the last result either way.
    pub async fn with_backoff<F>(&self, source: ExtractionSource, mut extract: F) -> Extraction
    where
        F: FnMut() -> Normalized,
    {
        let budget = self.backoff.budget;
        let mut state = Attempt {
            count: 0,
            started: Instant::now(),
            delays: self.backoff.delays(),
        };

        loop {
            state.count += 1;
            self.events.emit(StatusEvent::Extracting { source, attempt: state.count });

            let normalized = extract();
            let elapsed = state.started.elapsed();
            if !normalized.is_empty() {
                info!(
                    "Extracted {} products from {} after {} attempts",
                    normalized.len(),
                    source,
                    state.count
                );
                return Extraction { source, normalized, attempts: state.count };
            }
            if elapsed >= budget {
                warn!(
                    "No products from {} after {} attempts ({:.1}s)",
                    source,
                    state.count,
                    elapsed.as_secs_f64()
                );
                return Extraction { source, normalized, attempts: state.count };
            }

            let delay = state.delays.next().unwrap_or(self.backoff.max_delay);
            let wait = (delay + self.backoff.jitter()).min(budget - elapsed);
            debug!(
                "Attempt {} from {} empty, retrying in {:.1}s ({:.1}s left)",
                state.count,
                source,
                wait.as_secs_f64(),
                (budget - elapsed).as_secs_f64()
            );
            sleep(wait).await;
        }
    }

    fn from_dom(&self, location: &str) -> Normalized {
        match self.page.html() {
            Ok(html) => dom::extract_from_dom(&html, location).into(),
            Err(e) => {
                warn!("DOM unavailable: {:#}", e);
                Normalized::default()
            }
        }
    }
}

fn from_provider(provider: &dyn ProductSource) -> Normalized {
    match provider.extract() {
        Ok(raw) => normalize(raw),
        Err(e) => {
            warn!("Provider extraction failed: {}", e);
            Normalized::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::MemoryPage;
    use provider::ProviderError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Becomes available after `ready_after` polls and returns an empty list
    /// for the first `empty_for` extract calls.
    struct ScriptedSource {
        polls: AtomicU32,
        calls: AtomicU32,
        ready_after: u32,
        empty_for: u32,
    }

    impl ScriptedSource {
        fn new(ready_after: u32, empty_for: u32) -> Self {
            ScriptedSource { polls: AtomicU32::new(0), calls: AtomicU32::new(0), ready_after, empty_for }
        }
    }

    impl ProductSource for ScriptedSource {
        fn is_available(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }

        fn extract(&self) -> Result<Value, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.empty_for {
                Ok(json!([]))
            } else {
                Ok(json!({"products": [{"name": "Tea"}, {"name": "Rye"}]}))
            }
        }
    }

    const GRID: &str = r#"<div class="product-grid"><div class="product"><span class="product-name">Dom Tea</span></div></div>"#;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy { max_jitter: Duration::ZERO, ..BackoffPolicy::default() }
    }

    fn extractor(html: &str, provider: Option<Arc<dyn ProductSource>>) -> Extractor {
        let page: Arc<dyn Page> = Arc::new(MemoryPage::new("https://shop.example/", html));
        Extractor::new(page, provider, ReadinessPolicy::default(), no_jitter())
    }

    #[test]
    fn delay_schedule_is_non_decreasing_and_capped() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Duration> = policy.delays().take(50).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[4], Duration::from_secs(10));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= policy.max_delay));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_the_delay_schedule() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(700),
            max_jitter: Duration::ZERO,
            budget: Duration::from_secs(3),
        };
        let page: Arc<dyn Page> = Arc::new(MemoryPage::new("", ""));
        let ex = Extractor::new(page, None, ReadinessPolicy::default(), policy.clone());

        let mut calls = Vec::new();
        ex.with_backoff(ExtractionSource::Dom, || {
            calls.push(Instant::now());
            Normalized::default()
        })
        .await;

        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        let expected: Vec<Duration> = policy.delays().take(gaps.len()).collect();
        assert_eq!(gaps, expected);
        assert_eq!(
            expected,
            [300, 600, 700, 700, 700].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            assert!(policy.jitter() <= policy.max_jitter);
        }
        assert_eq!(no_jitter().jitter(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_attempts_stop_at_the_budget() {
        let ex = extractor("", None);
        let started = Instant::now();
        let extraction = ex.with_backoff(ExtractionSource::Dom, Normalized::default).await;

        assert!(extraction.normalized.is_empty());
        // 1 + 2 + 4 + 8 + 7 * 10 = 85s of full sleeps, then 5s clamped to the budget.
        assert_eq!(extraction.attempts, 13);
        assert_eq!(started.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_attempts_never_overrun_the_budget() {
        let page: Arc<dyn Page> = Arc::new(MemoryPage::new("", ""));
        let ex = Extractor::new(page, None, ReadinessPolicy::default(), BackoffPolicy::default());
        let started = Instant::now();
        ex.with_backoff(ExtractionSource::Dom, Normalized::default).await;
        assert!(started.elapsed() <= Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_products_appear() {
        let source = ScriptedSource::new(1, 3);
        let ex = extractor("", None);
        let started = Instant::now();
        let extraction = ex
            .with_backoff(ExtractionSource::Provider, || from_provider(&source))
            .await;

        assert_eq!(extraction.attempts, 4);
        assert_eq!(extraction.normalized.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_provider_then_settles() {
        let source: Arc<dyn ProductSource> = Arc::new(ScriptedSource::new(4, 0));
        let ex = extractor("", Some(source.clone()));
        let started = Instant::now();
        ex.wait_for_provider(source.as_ref()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(3 * 1000 + 500));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_path_wins_when_ready() {
        let source: Arc<dyn ProductSource> = Arc::new(ScriptedSource::new(2, 1));
        let ex = extractor(GRID, Some(source));
        let extraction = ex.extract(false).await;
        assert_eq!(extraction.source, ExtractionSource::Provider);
        assert_eq!(extraction.normalized.len(), 2);
        assert_eq!(extraction.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_provider_falls_back_to_dom() {
        let source: Arc<dyn ProductSource> = Arc::new(ScriptedSource::new(u32::MAX, 0));
        let ex = extractor(GRID, Some(source));
        let started = Instant::now();
        let extraction = ex.extract(false).await;

        assert_eq!(extraction.source, ExtractionSource::Dom);
        assert_eq!(extraction.normalized.items[0]["name"], "Dom Tea");
        // 15 polls, 14 intervals apart.
        assert_eq!(started.elapsed(), Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_provider_and_empty_dom_is_empty() {
        let source: Arc<dyn ProductSource> = Arc::new(ScriptedSource::new(u32::MAX, 0));
        let ex = extractor("<p>nothing here</p>", Some(source));
        let extraction = ex.extract(false).await;
        assert_eq!(extraction.source, ExtractionSource::Dom);
        assert!(extraction.normalized.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dom_only_skips_the_provider() {
        let source = Arc::new(ScriptedSource::new(1, 0));
        let ex = extractor(GRID, Some(source.clone()));
        let extraction = ex.extract(true).await;
        assert_eq!(extraction.source, ExtractionSource::Dom);
        assert_eq!(source.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_events_are_emitted() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let source: Arc<dyn ProductSource> = Arc::new(ScriptedSource::new(2, 0));
        let ex = extractor("", Some(source)).with_events(EventSink::new(tx));
        ex.extract(false).await;
        drop(ex);

        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert!(matches!(events[0], StatusEvent::WaitingForProvider { attempt: 1, max_attempts: 15 }));
        assert!(events.iter().any(|e| matches!(e, StatusEvent::ProviderReady)));
        assert!(matches!(
            events.last(),
            Some(StatusEvent::Extracting { source: ExtractionSource::Provider, attempt: 1 })
        ));
    }
}
