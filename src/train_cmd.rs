//! Training, classification and snapshot commands.
//!
//! Each model is the composition of one configured source with one
//! extractor, the bag-of-words normalizer and the store-backed classifier.
//! Snapshots go to `[db].database` / `[db].network_collection`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::classifier_store::StoreClassifier;
use crate::config::Config;
use crate::model::{RunOutcome, TrainableModel};
use crate::network::NetworkFactory;
use crate::normalizer_bow::{vectorize, vocabulary, BagOfWordsNormalizer};
use crate::snapshot::{self, ModelSnapshot};
use crate::store::sqlite::SqliteBackend;
use crate::store::Backend;
use crate::traits::{ExtractorRegistry, FeatureExtractor, NetworkRegistry, Source, SourceRegistry};

/// Compose a model for `source` and `extractor` from the config.
pub fn build_model(
    config: &Config,
    backend: Arc<dyn Backend>,
    source: Arc<dyn Source>,
    extractor: Arc<dyn FeatureExtractor>,
    factory: Option<Arc<dyn NetworkFactory>>,
) -> crate::error::Result<TrainableModel> {
    let normalizer = BagOfWordsNormalizer::new(
        backend.clone(),
        source.clone(),
        extractor.clone(),
        config.normalizer.clone(),
    );
    let classifier = StoreClassifier::new(backend.clone(), source.clone(), config.classifier.clone());

    let mut builder = TrainableModel::builder()
        .source(source)
        .extractor(extractor)
        .normalizer(Arc::new(normalizer))
        .classifier(Arc::new(classifier))
        .backend(backend)
        .network_options(config.network.clone())
        .training_options(config.training.clone())
        .snapshots_in(&config.db.database, &config.db.network_collection);
    if let Some(factory) = factory {
        builder = builder.network_factory(factory);
    }
    builder.build()
}

fn find_source(registry: &SourceRegistry, id: &str) -> Result<Arc<dyn Source>> {
    registry
        .find(id)
        .ok_or_else(|| anyhow!("Unknown source '{}'", id))
}

/// `neuralfm train`: train and save one model per compatible source.
///
/// Training continues from the model's latest snapshot. A model whose latest
/// snapshot still matches the current classifications and data is left alone
/// unless `force` is set.
pub async fn run_train(
    config: &Config,
    source: Option<&str>,
    extractor: &str,
    force: bool,
) -> Result<()> {
    let registry = SourceRegistry::from_config(config);
    let extractor = ExtractorRegistry::with_builtins()
        .get(extractor)
        .ok_or_else(|| anyhow!("Unknown extractor '{}'", extractor))?;

    let sources = match source {
        Some(id) => vec![find_source(&registry, id)?],
        None => registry.compatible_with(extractor.id()),
    };
    if sources.is_empty() {
        bail!("No source is compatible with extractor '{}'", extractor.id());
    }

    let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(&config.db.dir));
    println!("train");
    for source in sources {
        if !source.is_compatible_with(extractor.id()) {
            bail!(
                "Source '{}' is not compatible with extractor '{}'",
                source.id(),
                extractor.id()
            );
        }
        let mut model = build_model(config, backend.clone(), source, extractor.clone(), None)?;
        if let Some(latest) = model.load_latest().await? {
            if !force && !model.check_staleness().await? {
                println!("  {}: up to date", model.name());
                println!("    snapshot: {}", latest);
                continue;
            }
        }
        match model.run().await? {
            RunOutcome::Skipped => {
                println!("  {}: skipped (nothing classified)", model.name());
            }
            RunOutcome::Trained { fingerprint, status } => {
                model.save().await?;
                println!(
                    "  {}: {} iterations, error {:.5}",
                    model.name(),
                    status.iterations,
                    status.error
                );
                println!("    snapshot: {}", fingerprint);
            }
        }
    }
    println!("ok");
    Ok(())
}

/// `neuralfm classify`: label one record of a source.
pub async fn run_classify(
    config: &Config,
    source: &str,
    fingerprint: &str,
    label: &str,
    value: f64,
) -> Result<()> {
    let registry = SourceRegistry::from_config(config);
    let source = find_source(&registry, source)?;
    let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(&config.db.dir));

    let classifier = StoreClassifier::new(backend, source.clone(), config.classifier.clone());
    classifier.classify(fingerprint, label, value).await?;
    println!("classified {}:{} as {} ({})", source.id(), fingerprint, label, value);
    Ok(())
}

/// `neuralfm show`: list snapshots, or describe one.
pub async fn run_show(config: &Config, fingerprint: Option<&str>) -> Result<()> {
    let backend = SqliteBackend::new(&config.db.dir);
    let (database, collection) = (&config.db.database, &config.db.network_collection);

    let Some(fingerprint) = fingerprint else {
        let snapshots = snapshot::list_snapshots(&backend, database, collection).await?;
        if snapshots.is_empty() {
            println!("No model snapshots.");
            return Ok(());
        }
        println!("{:<28} {:<6} FINGERPRINT", "TRAINED", "LABELS");
        for snap in snapshots {
            println!(
                "{:<28} {:<6} {}",
                snap.trained_date.to_rfc3339(),
                snap.classifications.len(),
                snap.fingerprint
            );
        }
        return Ok(());
    };

    let snap = snapshot::get_from_fingerprint(&backend, database, collection, fingerprint).await?;
    print_snapshot(&snap);
    Ok(())
}

fn print_snapshot(snap: &ModelSnapshot) {
    println!("fingerprint: {}", snap.fingerprint);
    println!("name:        {}", snap.name);
    println!("network:     {} {:?}", snap.network, snap.network_options.hidden_layers);
    println!("trained:     {}", snap.trained_date.to_rfc3339());
    println!("created:     {}", snap.created_date.to_rfc3339());
    println!("examples:    {}", snap.training_data.len());
    println!("labels:");
    for (label, name) in &snap.classifications {
        println!("  {} = {}", label, name);
    }
}

/// `neuralfm predict`: score free text with a stored snapshot.
pub async fn run_predict(config: &Config, fingerprint: &str, text: &str) -> Result<()> {
    let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::new(&config.db.dir));
    let snap = snapshot::get_from_fingerprint(
        backend.as_ref(),
        &config.db.database,
        &config.db.network_collection,
        fingerprint,
    )
    .await?;

    let registry = SourceRegistry::from_config(config);
    let source = find_source(&registry, &snap.source)?;
    let extractor = ExtractorRegistry::with_builtins()
        .get(&snap.extractor)
        .ok_or_else(|| anyhow!("Unknown extractor '{}'", snap.extractor))?;
    let factory = NetworkRegistry::with_builtins()
        .get(&snap.network)
        .ok_or_else(|| anyhow!("Unknown network '{}'", snap.network))?;

    let mut model = build_model(config, backend, source, extractor, Some(factory))?;
    model.load_snapshot(&snap)?;

    let input = vectorize(text, &vocabulary(&snap.normalization_metadata)?);
    let scores = model.predict(&input)?;
    let verdicts = model.predict_binary(&input)?;
    for (score, verdict) in scores.iter().zip(verdicts) {
        println!("{:.4} {}", score, if verdict { "yes" } else { "no" });
    }
    Ok(())
}

/// `neuralfm reset-models`: delete every stored snapshot.
pub async fn run_reset_models(config: &Config) -> Result<()> {
    let backend = SqliteBackend::new(&config.db.dir);
    let deleted = snapshot::reset_database(
        &backend,
        &config.db.database,
        &config.db.network_collection,
    )
    .await?;
    println!("reset-models");
    println!("  deleted: {}", deleted);
    println!("ok");
    Ok(())
}
