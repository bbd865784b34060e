mod db;
mod events;
mod extractor;
mod keys;
mod normalize;
mod page;
mod pipeline;
mod record;
mod settings;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use events::{EventSink, StatusEvent};
use extractor::provider::{EmbeddedJsonSource, ProductSource};
use extractor::Extractor;
use page::Page;
use pipeline::{Pipeline, RunReport};
use settings::Settings;
use store::transport::HttpTransport;
use store::BatchWriter;

#[derive(Parser)]
#[command(name = "shelf_scraper", about = "Scrape product listings into a signed batch-write store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract products from a page and write them to the store
    Scrape {
        /// Local HTML file or http(s) URL
        target: String,
        /// Skip the embedded provider and read the product grid directly
        #[arg(long)]
        dom_only: bool,
        /// Print the store items instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-run whenever the page location changes, until Ctrl-C
    Watch {
        /// Local HTML file or http(s) URL
        target: String,
        /// Location poll interval
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
        #[arg(long)]
        dom_only: bool,
    },
    /// Save store credentials to the local database
    Configure {
        #[arg(long)]
        access_key_id: String,
        #[arg(long)]
        secret_access_key: String,
    },
    /// Send a single test item to verify credentials and table access
    Check,
    /// Show run statistics
    Stats,
}

type HttpPipeline = Pipeline<HttpTransport, db::SqliteCredentials>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Scrape { target, dom_only, dry_run } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let pipeline = build_pipeline(&settings, &target, EventSink::new(tx)).await?;
            let drain = spawn_event_log(rx, settings.db_path.clone());

            if dry_run {
                let requests = pipeline.preview(dom_only).await;
                drop(pipeline);
                let _ = drain.await;
                println!("{}", serde_json::to_string_pretty(&requests)?);
                println!("Dry run: {} items not sent.", requests.len());
                return Ok(());
            }

            let outcome = pipeline.run(dom_only).await;
            drop(pipeline);
            let _ = drain.await;
            let report = outcome.context("Write aborted")?;
            print_report(&report);
            Ok(())
        }
        Commands::Watch { target, interval_ms, dom_only } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let pipeline = Arc::new(build_pipeline(&settings, &target, EventSink::new(tx)).await?);
            let _drain = spawn_event_log(rx, settings.db_path.clone());

            println!("Watching {} (Ctrl-C to stop)...", target);
            tokio::select! {
                _ = pipeline.watch(Duration::from_millis(interval_ms), dom_only) => {}
                _ = tokio::signal::ctrl_c() => {
                    println!("\nStopped watching.");
                }
            }
            Ok(())
        }
        Commands::Configure { access_key_id, secret_access_key } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            db::save_credentials(&conn, access_key_id.trim(), secret_access_key.trim())?;
            println!("Credentials saved to {:?}", settings.db_path);
            Ok(())
        }
        Commands::Check => {
            let writer = build_writer(&settings)?;
            let config = writer.config();
            println!("Checking table {} at {}...", config.table_name, config.endpoint());
            match writer.check_connectivity().await {
                Ok(response) => {
                    println!("OK: store accepted a test write.");
                    info!("Store response: {}", response);
                    Ok(())
                }
                Err(e) => Err(anyhow::Error::new(e).context("Connectivity check failed")),
            }
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Runs:           {}", s.runs);
            println!("Failed runs:    {}", s.failed_runs);
            println!("Found:          {}", s.found);
            println!("Written:        {}", s.written);
            println!("Batches ok:     {}", s.batches_ok);
            println!("Batches failed: {}", s.batches_failed);
            println!("Last run:       {}", s.last_run.as_deref().unwrap_or("-"));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_writer(settings: &Settings) -> anyhow::Result<BatchWriter<HttpTransport, db::SqliteCredentials>> {
    let transport = HttpTransport::new(settings.request_timeout())?;
    let credentials = db::SqliteCredentials::new(&settings.db_path);
    Ok(BatchWriter::new(transport, credentials, settings.store_config()))
}

async fn build_pipeline(settings: &Settings, target: &str, events: EventSink) -> anyhow::Result<HttpPipeline> {
    let client = reqwest::Client::builder()
        .timeout(settings.request_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    let page: Arc<dyn Page> = Arc::from(page::open(&client, target).await?);
    let provider: Arc<dyn ProductSource> =
        Arc::new(EmbeddedJsonSource::new(page.clone(), &settings.provider_selector)?);

    let extractor = Extractor::new(page.clone(), Some(provider), settings.readiness(), settings.backoff())
        .with_events(events.clone());
    let writer = build_writer(settings)?.with_events(events.clone());
    Ok(Pipeline::new(page, extractor, writer, events))
}

/// Turn status events into log lines and a batch progress bar. Finished runs
/// that were not superseded go into the run log.
fn spawn_event_log(mut rx: UnboundedReceiver<StatusEvent>, db_path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        while let Some(event) = rx.recv().await {
            match event {
                StatusEvent::WaitingForProvider { attempt, max_attempts } => {
                    pb.set_message(format!("waiting for provider ({}/{})", attempt, max_attempts));
                    pb.tick();
                }
                StatusEvent::ProviderReady => info!("Provider ready"),
                StatusEvent::ProviderUnavailable => info!("Provider unavailable, reading the page directly"),
                StatusEvent::Extracting { source, attempt } => {
                    pb.set_message(format!("extracting from {} (attempt {})", source, attempt));
                    pb.tick();
                }
                StatusEvent::Found { count, source } => {
                    pb.set_message(format!("found {} products via {}", count, source));
                }
                StatusEvent::BatchSent { index, total, ok } => {
                    pb.set_length(total as u64);
                    pb.set_position(index as u64);
                    if !ok {
                        warn!("Batch {}/{} failed", index, total);
                    }
                }
                StatusEvent::NavigationDetected { location } => {
                    pb.reset();
                    pb.set_message(format!("navigated to {}", location));
                }
                StatusEvent::Finished(report) => {
                    pb.finish_and_clear();
                    if report.stale {
                        continue;
                    }
                    if let Err(e) = record_run(&db_path, &report) {
                        warn!("Failed to record run: {:#}", e);
                    }
                }
            }
        }
    })
}

fn record_run(db_path: &std::path::Path, report: &RunReport) -> anyhow::Result<()> {
    let conn = db::connect(db_path)?;
    db::init_schema(&conn)?;
    db::insert_run(&conn, report)?;
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Found {} products on {} via {}.", report.found, report.location, report.source);
    println!(
        "Wrote {} items in {} batches ({} ok, {} failed).",
        report.written, report.batch_count, report.succeeded_batches, report.failed_batches
    );
    if let Some(error) = &report.error {
        println!("Errors: {}", error);
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
