//! Error taxonomy for the reconciliation daemon.
//!
//! Kinds map directly to the propagation policy: `ConfigError` is fatal at
//! startup, `DiscoveryError`/`DataplaneError` are cycle-local and trigger
//! backoff, `VersionConflict` is caught and retried inside the reconciler
//! and only escalates to `DataplaneError` after the retry budget is spent.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetSyncError>;

/// Errors a polling cycle can fail with.
#[derive(Error, Debug)]
pub enum FleetSyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("dataplane error: {0}")]
    Dataplane(#[from] DataplaneError),
}

/// Invalid or missing configuration. Fatal at startup; never raised once
/// the daemon loop is running.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }
}

/// Cloud API failure or credential failure. Cycle-local: triggers backoff,
/// does not update the change-detector snapshot.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("cloud API request failed: {0}")]
    Api(String),

    #[error("credential error: {0}")]
    Credentials(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Transport or 4xx/5xx response from the Dataplane API that is not a
/// version conflict, plus the version-conflict variant itself, which is
/// caught by the reconciler's retry loop rather than bubbling up.
#[derive(Error, Debug)]
pub enum DataplaneError {
    #[error("dataplane transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("dataplane API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("dataplane configuration version conflict")]
    VersionConflict,
}

impl DataplaneError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict)
    }
}

/// Per-instance tag parsing failure. Never escalates: the instance carrying
/// it is silently dropped by the `TagFilter` and logged at DEBUG.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagParseError {
    #[error("missing required tag: {0}")]
    MissingTag(String),

    #[error("tag {tag} has unparseable port value {value:?}")]
    InvalidPort { tag: String, value: String },
}
