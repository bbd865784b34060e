use tokio::sync::mpsc::UnboundedSender;

use crate::extractor::ExtractionSource;
use crate::pipeline::RunReport;

/// Progress notifications for whoever is displaying the run.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    WaitingForProvider { attempt: u32, max_attempts: u32 },
    ProviderReady,
    ProviderUnavailable,
    Extracting { source: ExtractionSource, attempt: u32 },
    Found { count: usize, source: ExtractionSource },
    BatchSent { index: usize, total: usize, ok: bool },
    NavigationDetected { location: String },
    Finished(RunReport),
}

/// Optional sink for `StatusEvent`s. Sending never blocks and a closed
/// receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<StatusEvent>>);

impl EventSink {
    pub fn new(tx: UnboundedSender<StatusEvent>) -> Self {
        EventSink(Some(tx))
    }

    pub fn emit(&self, event: StatusEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
