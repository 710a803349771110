use anyhow::Result;

use crate::config::Config;
use crate::traits::SourceRegistry;

pub fn list_sources(config: &Config) -> Result<()> {
    let registry = SourceRegistry::from_config(config);
    if registry.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<16} {:<16} {:<10} EXTRACTORS",
        "SOURCE", "DATABASE", "COLLECTION", "STATUS"
    );
    for (source, (_, fs)) in registry.sources().iter().zip(&config.sources.filesystem) {
        let status = if fs.root.exists() { "OK" } else { "NO ROOT" };
        println!(
            "{:<16} {:<16} {:<16} {:<10} {}",
            source.id(),
            source.database_name(),
            source.collection_name(),
            status,
            source.compatible_extractors().join(",")
        );
    }

    Ok(())
}
