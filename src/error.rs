//! Error types for the neuralfm core.
//!
//! Plugin seams ([`Source`](crate::traits::Source),
//! [`Normalizer`](crate::traits::Normalizer), ...) return `anyhow::Result`;
//! the orchestration code wraps those failures into [`Error`] so callers can
//! tell a missing snapshot from a broken source or a duplicate fingerprint.

use thiserror::Error;

/// Result alias used by the core pipeline.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A required collaborator or piece of state is missing.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Lookup by fingerprint found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store answered with a non-positive acknowledgment.
    #[error("store operation failed: {0}")]
    StoreOperation(String),

    /// A unique fingerprint constraint rejected an insert.
    #[error("duplicate fingerprint in {collection}: {fingerprint}")]
    ConstraintViolation {
        collection: String,
        fingerprint: String,
    },

    /// A source plugin failed while fetching.
    #[error("source '{source_id}' failed to fetch")]
    SourceFetch {
        source_id: String,
        #[source]
        error: anyhow::Error,
    },

    /// Computing a feature document failed.
    #[error("feature extraction failed for record {fingerprint}")]
    Extraction {
        fingerprint: String,
        #[source]
        error: anyhow::Error,
    },

    /// A normalizer, classifier or network plugin failed.
    #[error("{component} failed")]
    Plugin {
        component: String,
        #[source]
        error: anyhow::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn plugin(component: impl Into<String>, error: anyhow::Error) -> Self {
        Error::Plugin {
            component: component.into(),
            error,
        }
    }
}
