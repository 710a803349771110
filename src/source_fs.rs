//! Filesystem source: a drop directory of JSON records.
//!
//! Walks `root` for files matching the include globs. `.jsonl` files hold one
//! record per line; other files hold either one JSON object or an array of
//! them. Each record is fingerprinted by a configured payload field or, when
//! none is set, by the SHA-256 of its JSON text. Records whose fingerprint is
//! already stored are skipped, so repeated scrapes only return new records.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::FilesystemSourceConfig;
use crate::models::{Record, ScrapeOptions};
use crate::store::{Filter, Store};
use crate::traits::Source;

pub struct FilesystemSource {
    name: String,
    config: FilesystemSourceConfig,
    database: String,
    collection: String,
}

impl FilesystemSource {
    pub fn new(name: String, config: FilesystemSourceConfig) -> Self {
        let database = config.database.clone().unwrap_or_else(|| name.clone());
        let collection = config
            .collection
            .clone()
            .unwrap_or_else(|| "records".to_string());
        Self {
            name,
            config,
            database,
            collection,
        }
    }

    /// Read every matching file under the root, in path order.
    fn scan(&self, filter: Option<&str>) -> Result<Vec<Value>> {
        let root = &self.config.root;
        if !root.exists() {
            bail!("Filesystem source root does not exist: {}", root.display());
        }

        let include_set = build_globset(&self.config.include_globs)?;
        let exclude_set = build_globset(&self.config.exclude_globs)?;
        let filter_set = match filter {
            Some(pattern) => Some(build_globset(&[pattern.to_string()])?),
            None => None,
        };

        let mut values = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            if let Some(set) = &filter_set {
                if !set.is_match(&rel_str) {
                    continue;
                }
            }

            values.extend(read_records(path)?);
        }
        Ok(values)
    }

    fn fingerprint(&self, value: &Value) -> Result<String> {
        match &self.config.fingerprint_field {
            Some(field) => match value.get(field) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Number(n)) => Ok(n.to_string()),
                _ => bail!("record is missing fingerprint field '{}'", field),
            },
            None => {
                let mut hasher = Sha256::new();
                hasher.update(serde_json::to_string(value)?.as_bytes());
                Ok(format!("{:x}", hasher.finalize()))
            }
        }
    }
}

fn read_records(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if path.extension().is_some_and(|e| e == "jsonl") {
        return content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("{}:{}: invalid JSON", path.display(), n + 1))
            })
            .collect();
    }

    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("{}: invalid JSON", path.display()))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl Source for FilesystemSource {
    fn id(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "JSON records dropped into a local directory"
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    fn compatible_extractors(&self) -> &[String] {
        &self.config.compatible_extractors
    }

    async fn run(&self, store: &dyn Store, options: &ScrapeOptions) -> Result<Vec<Record>> {
        store.create_unique_index(&self.collection).await?;

        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        for value in self.scan(options.filter.as_deref())? {
            let fingerprint = self.fingerprint(&value)?;
            if seen.insert(fingerprint.clone()) {
                candidates.push(Record::new(fingerprint, value));
            }
        }

        let stored: HashSet<String> = store
            .find(
                &self.collection,
                &Filter::Fingerprints(candidates.iter().map(|r| r.fingerprint.clone()).collect()),
            )
            .await?
            .into_iter()
            .map(|r| r.fingerprint)
            .collect();

        let limit = options.limit.unwrap_or(usize::MAX);
        let mut new_records = Vec::new();
        for record in candidates
            .into_iter()
            .filter(|r| !stored.contains(&r.fingerprint))
            .take(limit)
        {
            let ack = store.insert(&self.collection, &record).await?;
            if !ack.is_ok() {
                bail!("insert of {} was not acknowledged", record.fingerprint);
            }
            debug!(source = %self.name, fingerprint = %record.fingerprint, "stored new record");
            new_records.push(record);
        }

        Ok(new_records)
    }
}
