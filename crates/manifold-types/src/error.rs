use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManifoldError>;

#[derive(Debug, Error)]
pub enum ManifoldError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("multiple '{0}' manifest files found on backend; resolve manually")]
    MultipleManifests(String),

    #[error("multiple files named '{0}'; pass the id or content hash instead")]
    AmbiguousName(String),

    #[error("catalog version {found} exceeds supported version {supported}; update this software")]
    OutdatedSoftware { found: u32, supported: u32 },

    #[error("catalog version {found} is below supported version {supported}; run refresh to migrate")]
    OutdatedMetadata { found: u32, supported: u32 },

    #[error("catalog metadata carries no version field; run refresh to migrate")]
    UnversionedMetadata,

    #[error("no migration implemented from catalog version {0}")]
    MigrationMissing(u32),

    #[error("not found: '{0}'")]
    NotFound(String),

    #[error("invalid content hash: '{0}'")]
    InvalidHash(String),

    #[error("unsafe storage key: {0}")]
    InvalidStorageKey(String),

    #[error("unsupported backend type: '{0}'")]
    UnsupportedBackend(String),

    #[error("no reachable backend reported '{0}' absent; nowhere to upload")]
    NoWritableBackend(String),

    #[error("range read past end of '{id}' (offset {offset}, length {length})")]
    RangeOutOfBounds { id: String, offset: u64, length: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
