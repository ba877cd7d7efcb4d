//! CLI entry point for transit_fetch.
//!
//! Fetches transit feed endpoints under a shared byte-rate budget, either
//! once or as a polling loop that mixes latency-sensitive and background
//! traffic, and records the timing of every fetch as CSV.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_fetch::{
    Error, FetchOutcome, Priority, PriorityFetchScheduler, RegulatedFetcher, WaitMode,
    config::FetchConfig,
    fetch::get_request,
    output::{append_record, print_json, print_pretty},
    stats::FetchRecord,
};

const DEFAULT_LOG_FILE: &str = "logs/transit_fetch.log";

#[derive(Parser)]
#[command(name = "transit_fetch")]
#[command(about = "Rate-regulated fetching of transit feed endpoints", long_about = None)]
struct Cli {
    /// JSON config file (regulator, timeouts, API key)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL once under the regulator
    Fetch {
        #[arg(value_name = "URL")]
        url: String,

        /// CSV file to append results to
        #[arg(short, long, default_value = "data.csv")]
        output: String,

        /// Also log the record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Poll a URL at high priority while fetching a bulk URL in the background
    Poll {
        /// Latency-sensitive endpoint (e.g. vehicle locations)
        #[arg(value_name = "URL")]
        url: String,

        /// Background endpoint fetched at low priority (e.g. route config)
        #[arg(short, long)]
        bulk_url: Option<String>,

        /// Sample rate: poll every X seconds
        #[arg(short = 'r', long, default_value_t = 10)]
        sample_rate: u64,

        /// Number of samples to collect (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 0)]
        num_samples: usize,

        /// CSV file to append results to
        #[arg(short, long, default_value = "data.csv")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging()?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FetchConfig::load(path)?,
        None => FetchConfig::default(),
    };

    match cli.command {
        Commands::Fetch { url, output, json } => {
            fetch_once(&config, &url, &output, json).await?
        }
        Commands::Poll {
            url,
            bulk_url,
            sample_rate,
            num_samples,
            output,
        } => poll(&config, &url, bulk_url, sample_rate, num_samples, &output).await?,
    }

    Ok(())
}

/// Installs stderr logging filtered by `RUST_LOG` and a daily JSON log file
/// filtered by `RUST_LOG_JSON`. The returned guard flushes the file on drop.
fn init_logging() -> Result<WorkerGuard> {
    let log_file_path = std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| DEFAULT_LOG_FILE.into());
    let log_file_path = Path::new(&log_file_path);
    let log_dir = log_file_path.parent().unwrap_or(Path::new("logs"));
    let log_file_name = log_file_path
        .file_name()
        .unwrap_or(OsStr::new("transit_fetch.log"));

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, log_file_name));

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(file_writer)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()?;
    Ok(guard)
}

/// Performs one regulated fetch, records it, then serves the incurred wait.
#[tracing::instrument(skip(config), fields(url = %url))]
async fn fetch_once(config: &FetchConfig, url: &str, output: &str, json: bool) -> Result<()> {
    let regulator = config.regulator.build()?;
    let fetcher = RegulatedFetcher::new(config.http_client()?, regulator);

    let (outcome, debt) = fetcher
        .fetch_with_regulation(get_request(url)?, WaitMode::NonBlocking)
        .await?;

    let record = FetchRecord::from_outcome(url, Priority::High, &outcome)
        .with_label("fetch")
        .with_debt(debt);
    info!(
        status = ?record.status,
        bytes = record.bytes,
        elapsed_ms = record.elapsed_ms,
        debt_ms = record.debt_ms,
        "Fetched"
    );
    if json {
        print_json(&record)?;
    } else {
        print_pretty(&record);
    }
    append_record(output, &record)?;

    if !debt.is_zero() {
        tokio::time::sleep(debt).await;
    }
    Ok(())
}

/// Polls `url` at high priority and, if given, `bulk_url` at low priority
/// until the sample limit or Ctrl-C, then drains the scheduler.
#[tracing::instrument(skip(config, bulk_url), fields(url = %url, sample_rate, num_samples))]
async fn poll(
    config: &FetchConfig,
    url: &str,
    bulk_url: Option<String>,
    sample_rate: u64,
    num_samples: usize,
    output: &str,
) -> Result<()> {
    let regulator = config.regulator.build()?;
    let fetcher = Arc::new(RegulatedFetcher::new(config.http_client()?, regulator.clone()));
    let scheduler = PriorityFetchScheduler::spawn(fetcher);

    let background = bulk_url.map(|bulk_url| {
        let scheduler = scheduler.clone();
        let output = output.to_string();
        let span = tracing::info_span!("background", url = %bulk_url);
        tokio::spawn(fetch_background(scheduler, bulk_url, output).instrument(span))
    });

    if num_samples == 0 {
        info!(sample_rate, "Polling infinitely. Press Ctrl+C to stop.");
    } else {
        info!(num_samples, sample_rate, "Starting sample collection");
    }

    let result = tokio::select! {
        result = poll_samples(&scheduler, url, sample_rate, num_samples, output) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, draining background fetch");
            Ok(())
        }
    };

    scheduler.close().await;
    regulator.close();
    if let Some(task) = background {
        let _ = task.await;
    }

    info!(output, "Finished polling");
    result
}

async fn poll_samples(
    scheduler: &PriorityFetchScheduler,
    url: &str,
    sample_rate: u64,
    num_samples: usize,
    output: &str,
) -> Result<()> {
    let mut sample_count = 0;
    loop {
        // Check if we've reached the sample limit (0 = infinite)
        if num_samples > 0 && sample_count >= num_samples {
            return Ok(());
        }
        sample_count += 1;

        let result = scheduler.fetch(get_request(url)?, Priority::High).await;
        record(output, "poll", url, Priority::High, result)?;

        if num_samples == 0 || sample_count < num_samples {
            tokio::time::sleep(Duration::from_secs(sample_rate)).await;
        }
    }
}

/// Pause after a failed background fetch; the scheduler only spaces out
/// requests that actually moved bytes.
const BACKGROUND_FAILURE_PAUSE: Duration = Duration::from_secs(5);

/// Fetches `url` back to back at low priority; the scheduler spaces the
/// requests out to repay the polling loop's debt.
async fn fetch_background(scheduler: PriorityFetchScheduler, url: String, output: String) {
    loop {
        let request = match get_request(&url) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Invalid background URL");
                return;
            }
        };

        let result = scheduler.fetch(request, Priority::Low).await;
        if matches!(result, Err(Error::FetcherClosed)) {
            return;
        }
        match record(&output, "background", &url, Priority::Low, result) {
            Ok(false) => {}
            Ok(true) => tokio::time::sleep(BACKGROUND_FAILURE_PAUSE).await,
            Err(e) => error!(error = %e, "Failed to write background record"),
        }
    }
}

/// Logs and appends one fetch result; returns whether the fetch failed.
fn record(
    output: &str,
    label: &str,
    url: &str,
    priority: Priority,
    result: transit_fetch::Result<FetchOutcome>,
) -> Result<bool> {
    let record = match result {
        Ok(outcome) => {
            let record = FetchRecord::from_outcome(url, priority, &outcome);
            if record.is_error() {
                warn!(
                    priority = priority.as_str(),
                    error = record.error_message.as_deref().unwrap_or_default(),
                    "Fetch failed"
                );
            } else {
                info!(
                    priority = priority.as_str(),
                    status = ?record.status,
                    bytes = record.bytes,
                    elapsed_ms = record.elapsed_ms,
                    "Fetched"
                );
            }
            record
        }
        Err(e) => {
            error!(priority = priority.as_str(), error = %e, "Fetch rejected");
            FetchRecord::from_error("fetch_rejected", &e.to_string())
        }
    };
    let failed = record.is_error();
    append_record(output, &record.with_label(label))?;
    Ok(failed)
}
