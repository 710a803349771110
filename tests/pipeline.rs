//! End-to-end tests of the scrape → extract → train pipeline over the
//! in-memory backend.
//!
//! The in-memory backend counts open connections, which lets these tests
//! check that every operation releases what it opened, including on the
//! failure paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use neuralfm::classifier_store::StoreClassifier;
use neuralfm::config::{ClassifierConfig, NormalizerConfig};
use neuralfm::error::Error;
use neuralfm::extract::FeatureExtraction;
use neuralfm::extractor_twitter::TwitterFeatureExtractor;
use neuralfm::model::{ModelState, RunOutcome, TrainableModel};
use neuralfm::models::{Record, ScrapeOptions};
use neuralfm::network::{NetworkOptions, TrainingOptions};
use neuralfm::normalizer_bow::BagOfWordsNormalizer;
use neuralfm::scrape::{drain, scrape, DrainOptions};
use neuralfm::store::memory::MemoryBackend;
use neuralfm::store::{Ack, Backend, Filter, Store};
use neuralfm::traits::{FeatureExtractor, Source};
use serde_json::{json, Value};

// ─── Test sources ───────────────────────────────────────────────────

/// A source that stores and returns one queued batch per call.
struct QueueSource {
    id: &'static str,
    batches: Mutex<VecDeque<Result<Vec<Record>>>>,
    calls: AtomicUsize,
    extractors: Vec<String>,
}

impl QueueSource {
    fn new(id: &'static str, batches: Vec<Result<Vec<Record>>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            batches: Mutex::new(batches.into()),
            calls: AtomicUsize::new(0),
            extractors: vec!["twitter".to_string()],
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for QueueSource {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        "queued test batches"
    }

    fn compatible_extractors(&self) -> &[String] {
        &self.extractors
    }

    async fn run(&self, store: &dyn Store, _options: &ScrapeOptions) -> Result<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.batches.lock().unwrap().pop_front();
        let records = match next {
            Some(batch) => batch?,
            None => Vec::new(),
        };
        for record in &records {
            store.insert(self.collection_name(), record).await?;
        }
        Ok(records)
    }
}

fn tweet(fingerprint: &str, text: &str) -> Record {
    Record::new(
        fingerprint,
        json!({
            "id_str": fingerprint,
            "full_text": text,
            "favorite_count": 1,
            "retweet_count": 0,
            "created_at": "Wed Oct 10 20:19:24 +0000 2018",
            "user": { "screen_name": "synfonaut" },
        }),
    )
}

fn as_sources(sources: &[Arc<QueueSource>]) -> Vec<Arc<dyn Source>> {
    sources
        .iter()
        .map(|s| s.clone() as Arc<dyn Source>)
        .collect()
}

// ─── Scrape scheduling ──────────────────────────────────────────────

#[tokio::test]
async fn scrape_returns_first_non_empty_source() {
    let backend = MemoryBackend::new();
    let a = QueueSource::new("a", vec![Ok(vec![])]);
    let b = QueueSource::new("b", vec![Ok(vec![tweet("b1", "x"), tweet("b2", "y")])]);
    let c = QueueSource::new("c", vec![Ok(vec![tweet("c1", "z")])]);

    let sources = as_sources(&[a.clone(), b.clone(), c.clone()]);
    let records = scrape(&backend, &sources, &ScrapeOptions::default())
        .await
        .unwrap();

    let fps: Vec<_> = records.iter().map(|r| r.fingerprint.as_str()).collect();
    assert_eq!(fps, vec!["b1", "b2"]);
    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 0));
    assert_eq!(backend.opened_total(), 2);
    assert_eq!(backend.open_connections(), 0);
}

#[tokio::test]
async fn scrape_with_nothing_new_is_empty() {
    let backend = MemoryBackend::new();
    let sources = [QueueSource::new("a", vec![]), QueueSource::new("b", vec![])];
    let records = scrape(&backend, &as_sources(&sources), &ScrapeOptions::default())
        .await
        .unwrap();
    assert!(records.is_empty());
    assert!(sources.iter().all(|s| s.calls() == 1));
}

#[tokio::test]
async fn failing_source_releases_its_connection() {
    let backend = MemoryBackend::new();
    let broken = QueueSource::new("broken", vec![Err(anyhow::anyhow!("upstream 503"))]);
    let after = QueueSource::new("after", vec![Ok(vec![tweet("x", "x")])]);

    let err = scrape(&backend, &as_sources(&[broken, after.clone()]), &ScrapeOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SourceFetch { ref source_id, .. } if source_id == "broken"));
    assert_eq!(after.calls(), 0);
    assert_eq!(backend.open_connections(), 0);
}

fn fast_drain(max_consecutive_failures: u32) -> DrainOptions {
    DrainOptions {
        interval: Duration::ZERO,
        max_consecutive_failures,
        scrape: ScrapeOptions::default(),
    }
}

#[tokio::test]
async fn drain_runs_until_a_cycle_is_empty() {
    let backend = MemoryBackend::new();
    let source = QueueSource::new(
        "bsv",
        vec![
            Ok(vec![tweet("1", "a"), tweet("2", "b")]),
            Ok(vec![tweet("3", "c")]),
        ],
    );

    let report = drain(&backend, &as_sources(&[source.clone()]), &fast_drain(3))
        .await
        .unwrap();

    assert_eq!(report.cycles, 3);
    assert_eq!(report.records, 3);
    assert_eq!(report.failed_cycles, 0);
    assert_eq!(source.calls(), 3);
    assert_eq!(backend.open_connections(), 0);
}

#[tokio::test]
async fn drain_survives_a_transient_failure() {
    let backend = MemoryBackend::new();
    let source = QueueSource::new(
        "bsv",
        vec![Err(anyhow::anyhow!("timeout")), Ok(vec![tweet("1", "a")])],
    );

    let report = drain(&backend, &as_sources(&[source]), &fast_drain(2))
        .await
        .unwrap();
    assert_eq!(report.cycles, 3);
    assert_eq!(report.records, 1);
    assert_eq!(report.failed_cycles, 1);
}

#[tokio::test]
async fn drain_gives_up_after_repeated_failures() {
    let backend = MemoryBackend::new();
    let source = QueueSource::new(
        "bsv",
        (0..5).map(|_| Err(anyhow::anyhow!("down"))).collect(),
    );

    let err = drain(&backend, &as_sources(&[source.clone()]), &fast_drain(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SourceFetch { .. }));
    assert_eq!(source.calls(), 2);
    assert_eq!(backend.open_connections(), 0);
}

// ─── Feature extraction ─────────────────────────────────────────────

async fn seed(backend: &MemoryBackend, records: &[Record]) {
    let store = backend.open("bsv").await.unwrap();
    for record in records {
        store.insert("records", record).await.unwrap();
    }
    store.close().await;
}

fn extraction(backend: Arc<dyn Backend>, source: Arc<QueueSource>) -> FeatureExtraction {
    FeatureExtraction::new(backend, source, Arc::new(TwitterFeatureExtractor)).unwrap()
}

#[tokio::test]
async fn extraction_is_idempotent() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, &[tweet("f1", "bitcoin scales"), tweet("f2", "fees are low")]).await;
    let run = extraction(backend.clone(), QueueSource::new("bsv", vec![]));

    let first = run.run().await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|o| o.updated));
    assert_eq!(
        first[0].record.features["twitter_features"]["text"],
        "bitcoin scales"
    );

    let second = run.run().await.unwrap();
    assert!(second.is_empty());

    let featured = run.records_with_features().await.unwrap();
    assert_eq!(featured.len(), 2);
    let f2 = run.records_by_fingerprints(&["f2".to_string()]).await.unwrap();
    assert_eq!(f2[0].features["twitter_features"]["fingerprint"], "f2");
    assert_eq!(backend.open_connections(), 0);
}

#[tokio::test]
async fn null_features_are_reprocessed() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, &[tweet("f1", "bitcoin")]).await;
    let store = backend.open("bsv").await.unwrap();
    store
        .set_feature("records", "f1", "twitter_features", &Value::Null)
        .await
        .unwrap();
    store.close().await;

    let outcomes = extraction(backend.clone(), QueueSource::new("bsv", vec![]))
        .run()
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].updated);
}

/// Wraps the memory backend with stores that never acknowledge feature
/// writes.
struct NoAckBackend(Arc<MemoryBackend>);

struct NoAckStore(Box<dyn Store>);

#[async_trait]
impl Store for NoAckStore {
    fn database(&self) -> &str {
        self.0.database()
    }

    async fn find(&self, collection: &str, filter: &Filter) -> neuralfm::error::Result<Vec<Record>> {
        self.0.find(collection, filter).await
    }

    async fn set_feature(
        &self,
        _collection: &str,
        _fingerprint: &str,
        _field: &str,
        _value: &Value,
    ) -> neuralfm::error::Result<Ack> {
        Ok(Ack::new(0))
    }

    async fn insert(&self, collection: &str, record: &Record) -> neuralfm::error::Result<Ack> {
        self.0.insert(collection, record).await
    }

    async fn delete_many(&self, collection: &str) -> neuralfm::error::Result<u64> {
        self.0.delete_many(collection).await
    }

    async fn create_unique_index(&self, collection: &str) -> neuralfm::error::Result<()> {
        self.0.create_unique_index(collection).await
    }

    async fn close(&self) {
        self.0.close().await
    }
}

#[async_trait]
impl Backend for NoAckBackend {
    async fn open(&self, database: &str) -> neuralfm::error::Result<Box<dyn Store>> {
        Ok(Box::new(NoAckStore(self.0.open(database).await?)))
    }
}

#[tokio::test]
async fn unacknowledged_writes_are_soft_failures() {
    let memory = Arc::new(MemoryBackend::new());
    seed(&memory, &[tweet("f1", "a"), tweet("f2", "b")]).await;
    let source = QueueSource::new("bsv", vec![]);

    let flaky = extraction(Arc::new(NoAckBackend(memory.clone())), source.clone());
    let outcomes = flaky.run().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| !o.updated && o.record.features.is_empty()));
    assert_eq!(memory.open_connections(), 0);

    // Still pending for the next run.
    let healthy = extraction(memory.clone(), source);
    let outcomes = healthy.run().await.unwrap();
    assert_eq!(outcomes.iter().filter(|o| o.updated).count(), 2);
}

#[tokio::test]
async fn extraction_error_aborts_the_run() {
    let backend = Arc::new(MemoryBackend::new());
    seed(
        &backend,
        &[tweet("f1", "ok"), Record::new("bad", json!({ "full_text": "no user" }))],
    )
    .await;

    let err = extraction(backend.clone(), QueueSource::new("bsv", vec![]))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Extraction { ref fingerprint, .. } if fingerprint == "bad"));
    assert_eq!(backend.open_connections(), 0);
}

#[test]
fn incompatible_extractor_is_rejected() {
    struct Images;
    impl FeatureExtractor for Images {
        fn id(&self) -> &str {
            "image"
        }
        fn extract(&self, _record: &Record) -> Result<Value> {
            bail!("unused")
        }
    }

    let result = FeatureExtraction::new(
        Arc::new(MemoryBackend::new()),
        QueueSource::new("bsv", vec![]),
        Arc::new(Images),
    );
    assert!(matches!(result, Err(Error::Precondition(_))));
}

// ─── Training ───────────────────────────────────────────────────────

fn bow_model(
    backend: Arc<MemoryBackend>,
    source: Arc<QueueSource>,
) -> (TrainableModel, Arc<StoreClassifier>) {
    let extractor: Arc<dyn FeatureExtractor> = Arc::new(TwitterFeatureExtractor);
    let classifier = Arc::new(StoreClassifier::new(
        backend.clone(),
        source.clone(),
        ClassifierConfig::default(),
    ));
    let normalizer = BagOfWordsNormalizer::new(
        backend.clone(),
        source.clone(),
        extractor.clone(),
        NormalizerConfig::default(),
    );

    let model = TrainableModel::builder()
        .source(source)
        .extractor(extractor)
        .normalizer(Arc::new(normalizer))
        .classifier(classifier.clone())
        .backend(backend)
        .network_options(NetworkOptions {
            hidden_layers: vec![4],
            seed: Some(42),
            ..Default::default()
        })
        .training_options(TrainingOptions {
            iterations: 500,
            ..Default::default()
        })
        .build()
        .unwrap();
    (model, classifier)
}

#[tokio::test]
async fn scrape_extract_classify_train_save() {
    let backend = Arc::new(MemoryBackend::new());
    let source = QueueSource::new(
        "bsv",
        vec![Ok(vec![
            tweet("f1", "bitcoin scales onchain"),
            tweet("f2", "celebrity gossip today"),
            tweet("f3", "bitcoin fees stay low"),
        ])],
    );

    let report = drain(backend.as_ref(), &as_sources(&[source.clone()]), &fast_drain(1))
        .await
        .unwrap();
    assert_eq!(report.records, 3);
    extraction(backend.clone(), source.clone()).run().await.unwrap();

    let (mut model, classifier) = bow_model(backend.clone(), source);

    // Nothing classified yet.
    assert_eq!(model.run().await.unwrap(), RunOutcome::Skipped);
    assert_eq!(model.state(), ModelState::Untrained);
    assert!(model.is_dirty());

    classifier.classify("f1", "like", 1.0).await.unwrap();
    classifier.classify("f2", "like", 0.0).await.unwrap();

    let RunOutcome::Trained { fingerprint, .. } = model.run().await.unwrap() else {
        panic!("expected a trained model");
    };
    assert!(fingerprint.starts_with("bsv:twitter:bow:store:2:"));

    let saved = model.save().await.unwrap();
    assert_eq!(saved.training_data.len(), 2);
    let loaded = model.get_from_fingerprint(&fingerprint).await.unwrap();
    assert_eq!(loaded, saved);

    classifier.classify("f3", "like", 1.0).await.unwrap();
    assert!(model.check_staleness().await.unwrap());

    let RunOutcome::Trained { fingerprint: next, .. } = model.run().await.unwrap() else {
        panic!("expected a trained model");
    };
    assert_ne!(next, fingerprint);
    assert_eq!(model.state(), ModelState::Trained);
    model.save().await.unwrap();

    assert!(matches!(
        model.get_from_fingerprint("bsv:twitter:bow:store:0:0").await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(backend.open_connections(), 0);
}
