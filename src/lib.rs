//! # neuralfm
//!
//! A personal content-filtering pipeline: collect records from sources,
//! extract features, and train small neural networks on the records you
//! have classified.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Sources   │──▶│    Scrape    │──▶│  per-source  │
//! │ filesystem  │   │ first match  │   │   database   │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             ▼
//!                                   ┌──────────────────┐
//!                                   │ Feature extract  │
//!                                   └────────┬─────────┘
//!                                            ▼
//!                 ┌────────────┐    ┌──────────────────┐    ┌───────────┐
//!                 │ Classifier │──▶ │ Normalizer + NN  │──▶ │ Snapshots │
//!                 └────────────┘    └──────────────────┘    └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! neuralfm init
//! neuralfm scrape                     # drain every source
//! neuralfm extract                    # attach twitter_features
//! neuralfm classify bsv <fp> like
//! neuralfm train --source bsv         # skipped when nothing changed
//! neuralfm show
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`store`] | Document store abstraction, SQLite and in-memory backends |
//! | [`traits`] | Plugin traits and registries |
//! | [`scrape`] | Source scheduling |
//! | [`extract`] | Feature extraction |
//! | [`model`] | Trainable model lifecycle |
//! | [`snapshot`] | Persisted model snapshots |
//! | [`network`] | Numeric trainer abstraction |
//! | [`db`] | SQLite connections |
//! | [`migrate`] | Schema setup |

pub mod classifier_store;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod extractor_twitter;
pub mod migrate;
pub mod model;
pub mod models;
pub mod network;
pub mod normalizer_bow;
pub mod scrape;
pub mod snapshot;
pub mod source_fs;
pub mod sources;
pub mod store;
pub mod train_cmd;
pub mod traits;
