//! SQLite backend tests and a full filesystem → SQLite pipeline run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use neuralfm::classifier_store::StoreClassifier;
use neuralfm::config::{load_config, ClassifierConfig, Config, FilesystemSourceConfig};
use neuralfm::error::Error;
use neuralfm::extract::{run_extract, FeatureExtraction};
use neuralfm::extractor_twitter::TwitterFeatureExtractor;
use neuralfm::model::{RunOutcome, TrainableModel};
use neuralfm::models::{Record, ScrapeOptions};
use neuralfm::network::{NetworkOptions, TrainingOptions};
use neuralfm::normalizer_bow::BagOfWordsNormalizer;
use neuralfm::scrape::{run_scrape, scrape};
use neuralfm::snapshot;
use neuralfm::source_fs::FilesystemSource;
use neuralfm::store::sqlite::SqliteBackend;
use neuralfm::store::{find_one, Backend, Filter};
use neuralfm::traits::{FeatureExtractor, Source};
use neuralfm::train_cmd::{run_classify, run_train};
use serde_json::{json, Value};
use tempfile::TempDir;

#[tokio::test]
async fn features_are_stored_per_field() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());
    let store = backend.open("bsv").await.unwrap();

    store.insert("records", &Record::new("f1", json!({"n": 1}))).await.unwrap();
    store.insert("records", &Record::new("f2", json!({"n": 2}))).await.unwrap();

    let ack = store
        .set_feature("records", "f1", "twitter_features", &json!({"text": "hi"}))
        .await
        .unwrap();
    assert!(ack.is_ok());
    let ack = store
        .set_feature("records", "f2", "twitter_features", &Value::Null)
        .await
        .unwrap();
    assert!(ack.is_ok());
    let missing = store
        .set_feature("records", "nope", "twitter_features", &json!({}))
        .await
        .unwrap();
    assert!(!missing.is_ok());

    let pending = store
        .find("records", &Filter::MissingFeature("twitter_features".into()))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].fingerprint, "f2");

    let done = store
        .find("records", &Filter::HasFeature("twitter_features".into()))
        .await
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].features["twitter_features"]["text"], "hi");
    assert_eq!(done[0].data["n"], 1);

    store.close().await;
}

#[tokio::test]
async fn data_survives_reopening() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());

    let store = backend.open("neuralfm").await.unwrap();
    store.insert("networks", &Record::new("m1", json!({"a": 1}))).await.unwrap();
    store.close().await;

    let store = backend.open("neuralfm").await.unwrap();
    let found = find_one(store.as_ref(), "networks", "m1").await.unwrap();
    assert_eq!(found.unwrap().data["a"], 1);
    assert!(find_one(store.as_ref(), "networks", "m2").await.unwrap().is_none());
    store.close().await;

    assert!(tmp.path().join("neuralfm.sqlite").exists());
}

#[tokio::test]
async fn unique_index_is_per_collection() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());
    let store = backend.open("neuralfm").await.unwrap();

    snapshot::create_indexes(store.as_ref(), "networks").await.unwrap();
    snapshot::create_indexes(store.as_ref(), "networks").await.unwrap();

    store.insert("networks", &Record::new("m1", json!({}))).await.unwrap();
    let err = store
        .insert("networks", &Record::new("m1", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { .. }));

    // Other collections are not constrained.
    store.insert("scratch", &Record::new("m1", json!({}))).await.unwrap();
    store.insert("scratch", &Record::new("m1", json!({}))).await.unwrap();

    assert_eq!(store.delete_many("networks").await.unwrap(), 1);
    assert_eq!(store.find("scratch", &Filter::All).await.unwrap().len(), 2);
    store.close().await;
}

#[tokio::test]
async fn invalid_database_names_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());
    assert!(matches!(
        backend.open("../escape").await.err(),
        Some(Error::Config(_))
    ));
}

fn write_tweets(dir: &Path, name: &str, tweets: &[(&str, &str)]) {
    let lines: Vec<String> = tweets
        .iter()
        .map(|(id, text)| {
            json!({
                "id_str": id,
                "full_text": text,
                "favorite_count": 0,
                "retweet_count": 0,
                "created_at": "Wed Oct 10 20:19:24 +0000 2018",
                "user": { "screen_name": "synfonaut" },
            })
            .to_string()
        })
        .collect();
    fs::write(dir.join(name), lines.join("\n")).unwrap();
}

#[tokio::test]
async fn filesystem_to_snapshot() {
    let inbox = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_tweets(
        inbox.path(),
        "2019-01.jsonl",
        &[
            ("1", "bitcoin scales onchain"),
            ("2", "sports scores tonight"),
            ("3", "bitcoin fees are tiny"),
        ],
    );

    let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(data.path()));
    let source: Arc<dyn Source> = Arc::new(FilesystemSource::new(
        "bsv".to_string(),
        FilesystemSourceConfig {
            root: inbox.path().to_path_buf(),
            include_globs: vec!["**/*.jsonl".into()],
            exclude_globs: vec![],
            follow_symlinks: false,
            database: None,
            collection: None,
            fingerprint_field: Some("id_str".into()),
            compatible_extractors: vec!["twitter".into()],
        },
    ));
    let sources = vec![source.clone()];

    let scraped = scrape(backend.as_ref(), &sources, &ScrapeOptions::default())
        .await
        .unwrap();
    assert_eq!(scraped.len(), 3);
    assert!(scrape(backend.as_ref(), &sources, &ScrapeOptions::default())
        .await
        .unwrap()
        .is_empty());

    let extractor: Arc<dyn FeatureExtractor> = Arc::new(TwitterFeatureExtractor);
    let extraction =
        FeatureExtraction::new(backend.clone(), source.clone(), extractor.clone()).unwrap();
    assert_eq!(extraction.run().await.unwrap().len(), 3);
    assert!(extraction.run().await.unwrap().is_empty());

    let classifier = Arc::new(StoreClassifier::new(
        backend.clone(),
        source.clone(),
        ClassifierConfig {
            labels: BTreeMap::from([("like".to_string(), "Like".to_string())]),
            ..Default::default()
        },
    ));
    classifier.classify("1", "like", 1.0).await.unwrap();
    classifier.classify("2", "like", 0.0).await.unwrap();

    let normalizer = BagOfWordsNormalizer::new(
        backend.clone(),
        source.clone(),
        extractor.clone(),
        Default::default(),
    );
    let mut model = TrainableModel::builder()
        .source(source)
        .extractor(extractor)
        .normalizer(Arc::new(normalizer))
        .classifier(classifier)
        .backend(backend.clone())
        .network_options(NetworkOptions {
            hidden_layers: vec![3],
            seed: Some(3),
            ..Default::default()
        })
        .training_options(TrainingOptions {
            iterations: 200,
            ..Default::default()
        })
        .build()
        .unwrap();

    let RunOutcome::Trained { fingerprint, .. } = model.run().await.unwrap() else {
        panic!("expected a trained model");
    };
    let saved = model.save().await.unwrap();
    assert_eq!(saved.classifications["like"], "Like");

    let stored = snapshot::get_from_fingerprint(backend.as_ref(), "neuralfm", "networks", &fingerprint)
        .await
        .unwrap();
    assert_eq!(stored.fingerprint, fingerprint);
    assert_eq!(stored.training_data, saved.training_data);

    let listed = snapshot::list_snapshots(backend.as_ref(), "neuralfm", "networks")
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    assert_eq!(
        snapshot::reset_database(backend.as_ref(), "neuralfm", "networks")
            .await
            .unwrap(),
        1
    );
    assert!(matches!(
        snapshot::get_from_fingerprint(backend.as_ref(), "neuralfm", "networks", &fingerprint).await,
        Err(Error::NotFound(_))
    ));
}

fn write_config(dir: &Path, inbox: &Path, data: &Path) -> Config {
    let path = dir.join("neuralfm.toml");
    fs::write(
        &path,
        format!(
            r#"
[db]
dir = '{}'

[network]
hidden_layers = [3]
seed = 7

[training]
iterations = 50

[sources.filesystem.bsv]
root = '{}'
fingerprint_field = "id_str"
"#,
            data.display(),
            inbox.display()
        ),
    )
    .unwrap();
    load_config(&path).unwrap()
}

async fn snapshot_count(config: &Config) -> usize {
    let backend = SqliteBackend::new(&config.db.dir);
    snapshot::list_snapshots(&backend, &config.db.database, &config.db.network_collection)
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn train_skips_models_that_are_up_to_date() {
    let tmp = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_tweets(
        inbox.path(),
        "tweets.jsonl",
        &[
            ("1", "bitcoin scales onchain"),
            ("2", "sports scores tonight"),
            ("3", "bitcoin fees are tiny"),
        ],
    );
    let config = write_config(tmp.path(), inbox.path(), data.path());

    run_scrape(&config, None, None, true).await.unwrap();
    run_extract(&config, None).await.unwrap();
    run_classify(&config, "bsv", "1", "like", 1.0).await.unwrap();
    run_classify(&config, "bsv", "2", "like", 0.0).await.unwrap();

    run_train(&config, None, "twitter", false).await.unwrap();
    assert_eq!(snapshot_count(&config).await, 1);

    // Same labels, same data: nothing new to learn.
    run_train(&config, None, "twitter", false).await.unwrap();
    assert_eq!(snapshot_count(&config).await, 1);

    run_classify(&config, "bsv", "3", "like", 1.0).await.unwrap();
    run_train(&config, None, "twitter", false).await.unwrap();
    assert_eq!(snapshot_count(&config).await, 2);

    run_train(&config, Some("bsv"), "twitter", true).await.unwrap();
    assert_eq!(snapshot_count(&config).await, 3);
}
