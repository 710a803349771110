//! Scrape scheduling.
//!
//! [`scrape`] tries sources in priority order and returns the first
//! non-empty batch of new records. [`drain`] repeats `scrape` on an interval
//! until a full pass finds nothing, which means every source was tried and
//! came back empty.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Record, ScrapeOptions};
use crate::store::sqlite::SqliteBackend;
use crate::store::Backend;
use crate::traits::{Source, SourceRegistry};

/// Run sources in order until one yields new records.
///
/// Each source gets a fresh connection to its own database. The connection
/// is closed before moving on, whether the source succeeded or failed. A
/// failing source aborts the call with [`Error::SourceFetch`]; sources after
/// it are not tried.
pub async fn scrape(
    backend: &dyn Backend,
    sources: &[Arc<dyn Source>],
    options: &ScrapeOptions,
) -> Result<Vec<Record>> {
    for source in sources {
        debug!(source = source.id(), "scraping");
        let store = backend.open(source.database_name()).await?;
        let fetched = source.run(store.as_ref(), options).await;
        store.close().await;

        let records = fetched.map_err(|error| Error::SourceFetch {
            source_id: source.id().to_string(),
            error,
        })?;

        if !records.is_empty() {
            info!(source = source.id(), count = records.len(), "scraped new records");
            return Ok(records);
        }
    }
    Ok(Vec::new())
}

/// Settings for the [`drain`] loop.
#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
    pub scrape: ScrapeOptions,
}

impl DrainOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_millis(config.scrape.interval_ms),
            max_consecutive_failures: config.scrape.max_consecutive_failures,
            scrape: ScrapeOptions {
                limit: config.scrape.limit,
                filter: None,
            },
        }
    }
}

/// Totals for one [`drain`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub cycles: u64,
    pub records: u64,
    pub failed_cycles: u64,
}

/// Scrape repeatedly until a cycle comes back empty.
///
/// Failed cycles are logged and retried on the next interval. After
/// `max_consecutive_failures` failures in a row the last error is returned.
pub async fn drain(
    backend: &dyn Backend,
    sources: &[Arc<dyn Source>],
    options: &DrainOptions,
) -> Result<DrainReport> {
    let mut report = DrainReport::default();
    let mut consecutive_failures = 0u32;

    loop {
        report.cycles += 1;
        match scrape(backend, sources, &options.scrape).await {
            Ok(records) if records.is_empty() => {
                info!(cycles = report.cycles, records = report.records, "all sources drained");
                return Ok(report);
            }
            Ok(records) => {
                consecutive_failures = 0;
                report.records += records.len() as u64;
            }
            Err(e) => {
                report.failed_cycles += 1;
                consecutive_failures += 1;
                warn!(error = %e, consecutive_failures, "scrape cycle failed");
                if consecutive_failures >= options.max_consecutive_failures {
                    return Err(e);
                }
            }
        }

        debug!(interval_ms = options.interval.as_millis() as u64, "sleeping");
        tokio::time::sleep(options.interval).await;
    }
}

/// `neuralfm scrape`: drain every configured source, or run a single pass.
pub async fn run_scrape(
    config: &Config,
    limit: Option<usize>,
    filter: Option<String>,
    once: bool,
) -> anyhow::Result<()> {
    let registry = SourceRegistry::from_config(config);
    if registry.is_empty() {
        anyhow::bail!("No sources configured. Add a [sources.filesystem.<name>] section.");
    }
    let backend = SqliteBackend::new(&config.db.dir);

    let mut options = DrainOptions::from_config(config);
    if limit.is_some() {
        options.scrape.limit = limit;
    }
    options.scrape.filter = filter;

    if once {
        let records = scrape(&backend, registry.sources(), &options.scrape).await?;
        println!("scrape");
        println!("  new records: {}", records.len());
        println!("ok");
        return Ok(());
    }

    let report = drain(&backend, registry.sources(), &options).await?;
    println!("scrape");
    println!("  cycles: {}", report.cycles);
    println!("  new records: {}", report.records);
    println!("  failed cycles: {}", report.failed_cycles);
    println!("ok");
    Ok(())
}
