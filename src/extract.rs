//! Feature extraction over unprocessed records.
//!
//! A [`FeatureExtraction`] pairs one source with one extractor. Each run
//! finds the records of the source's collection that have no feature
//! document under the extractor's field, computes one per record, and
//! attaches it with an atomic single-record write. A record is processed at
//! most once: after its features are attached it never matches again, even
//! if its payload changes.
//!
//! Write failures are per-record and soft: the record is returned without
//! features, logged, and picked up again by the next run. A failing feature
//! computation aborts the run.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::Record;
use crate::store::sqlite::SqliteBackend;
use crate::store::{Backend, Filter, Store};
use crate::traits::{ExtractorRegistry, FeatureExtractor, Source, SourceRegistry};

/// Result of processing one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutcome {
    /// The record, with the feature document attached when `updated`.
    pub record: Record,
    pub updated: bool,
}

/// Runs one extractor over one source's collection.
pub struct FeatureExtraction {
    backend: Arc<dyn Backend>,
    source: Arc<dyn Source>,
    extractor: Arc<dyn FeatureExtractor>,
}

impl FeatureExtraction {
    /// Fails with [`Error::Precondition`] when the source does not list the
    /// extractor as compatible.
    pub fn new(
        backend: Arc<dyn Backend>,
        source: Arc<dyn Source>,
        extractor: Arc<dyn FeatureExtractor>,
    ) -> Result<Self> {
        if !source.is_compatible_with(extractor.id()) {
            return Err(Error::Precondition(format!(
                "source '{}' is not compatible with extractor '{}'",
                source.id(),
                extractor.id()
            )));
        }
        Ok(Self {
            backend,
            source,
            extractor,
        })
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn extractor(&self) -> &Arc<dyn FeatureExtractor> {
        &self.extractor
    }

    /// Extract features for every unprocessed record.
    pub async fn run(&self) -> Result<Vec<ExtractionOutcome>> {
        let store = self.backend.open(self.source.database_name()).await?;
        let result = self.run_with(store.as_ref()).await;
        store.close().await;
        result
    }

    async fn run_with(&self, store: &dyn Store) -> Result<Vec<ExtractionOutcome>> {
        let field = self.extractor.features_field();
        let collection = self.source.collection_name();

        let pending = store
            .find(collection, &Filter::MissingFeature(field.clone()))
            .await?;
        info!(
            source = self.source.id(),
            extractor = self.extractor.id(),
            pending = pending.len(),
            "found records needing feature extraction"
        );

        let mut outcomes = Vec::with_capacity(pending.len());
        for record in pending {
            outcomes.push(self.extract_one(store, collection, &field, record).await?);
        }
        Ok(outcomes)
    }

    async fn extract_one(
        &self,
        store: &dyn Store,
        collection: &str,
        field: &str,
        mut record: Record,
    ) -> Result<ExtractionOutcome> {
        debug!(fingerprint = %record.fingerprint, "extracting features");

        let features = self
            .extractor
            .extract(&record)
            .and_then(|f| {
                if f.is_null() {
                    anyhow::bail!("extractor '{}' returned null features", self.extractor.id());
                }
                Ok(f)
            })
            .map_err(|error| Error::Extraction {
                fingerprint: record.fingerprint.clone(),
                error,
            })?;

        match store
            .set_feature(collection, &record.fingerprint, field, &features)
            .await
        {
            Ok(ack) if ack.is_ok() => {
                record.features.insert(field.to_string(), features);
                Ok(ExtractionOutcome {
                    record,
                    updated: true,
                })
            }
            Ok(ack) => {
                warn!(
                    fingerprint = %record.fingerprint,
                    ack = ack.count,
                    "feature write not acknowledged, record left for next run"
                );
                Ok(ExtractionOutcome {
                    record,
                    updated: false,
                })
            }
            Err(e) => {
                warn!(
                    fingerprint = %record.fingerprint,
                    error = %e,
                    "feature write failed, record left for next run"
                );
                Ok(ExtractionOutcome {
                    record,
                    updated: false,
                })
            }
        }
    }

    /// Records that already carry this extractor's features.
    pub async fn records_with_features(&self) -> Result<Vec<Record>> {
        self.find(Filter::HasFeature(self.extractor.features_field()))
            .await
    }

    /// Records with the given fingerprints, in store order.
    pub async fn records_by_fingerprints(&self, fingerprints: &[String]) -> Result<Vec<Record>> {
        self.find(Filter::Fingerprints(fingerprints.to_vec())).await
    }

    async fn find(&self, filter: Filter) -> Result<Vec<Record>> {
        let store = self.backend.open(self.source.database_name()).await?;
        let found = store.find(self.source.collection_name(), &filter).await;
        store.close().await;
        found
    }
}

/// Totals for one [`extract_all`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub runs: u64,
    pub updated: u64,
    pub skipped: u64,
}

/// Run every registered extractor over every compatible source.
pub async fn extract_all(
    backend: Arc<dyn Backend>,
    sources: &SourceRegistry,
    extractors: &ExtractorRegistry,
) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();
    for extractor in extractors.extractors() {
        for source in sources.compatible_with(extractor.id()) {
            let run = FeatureExtraction::new(backend.clone(), source, extractor.clone())?;
            let outcomes = run.run().await?;
            report.runs += 1;
            for outcome in &outcomes {
                if outcome.updated {
                    report.updated += 1;
                } else {
                    report.skipped += 1;
                }
            }
        }
    }
    Ok(report)
}

/// `neuralfm extract`: run every extractor, or only `extractor`, over its
/// compatible sources.
pub async fn run_extract(config: &Config, extractor: Option<&str>) -> anyhow::Result<()> {
    let sources = SourceRegistry::from_config(config);
    let builtins = ExtractorRegistry::with_builtins();
    let extractors = match extractor {
        Some(id) => {
            let found = builtins
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("Unknown extractor '{}'", id))?;
            let mut only = ExtractorRegistry::new();
            only.register(found);
            only
        }
        None => builtins,
    };

    let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(&config.db.dir));
    let report = extract_all(backend, &sources, &extractors).await?;

    println!("extract");
    println!("  runs: {}", report.runs);
    println!("  updated: {}", report.updated);
    println!("  skipped: {}", report.skipped);
    println!("ok");
    Ok(())
}
