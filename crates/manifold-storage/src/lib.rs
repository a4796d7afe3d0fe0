pub mod local_backend;
pub mod transform;

use std::path::PathBuf;
use std::sync::Arc;

use manifold_types::{ManifoldError, Result};

pub use local_backend::LocalBackend;
pub use transform::TransformDescriptor;

/// A file as the backend itself reports it: the opaque storage id, the name
/// it was stored under, and its stored size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
}

/// Request to store the bytes at `local_path` under the logical id `id`.
/// The backend may address the stored bytes by a different opaque id; the
/// receipt carries the authoritative one.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub id: String,
    pub local_path: PathBuf,
}

/// Request to fetch the bytes addressed by `id` into `local_path`.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: String,
    pub local_path: PathBuf,
}

/// Acknowledgement of a completed backend operation. `id` is the opaque
/// storage id the backend will address these bytes by from now on.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub id: String,
}

/// A finite, lazy, non-restartable sequence of byte chunks.
pub type ByteStream = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// A backend's self-reported space accounting, in bytes. `quota` is the
/// administratively configured ceiling, if any; `total` is the physical
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub used: u64,
    pub quota: Option<u64>,
    pub total: u64,
}

impl Capacity {
    /// The effective ceiling: the smaller of quota and physical capacity.
    pub fn allowed(&self) -> u64 {
        match self.quota {
            Some(q) => q.min(self.total),
            None => self.total,
        }
    }

    /// Space still usable under the effective ceiling.
    pub fn available(&self) -> u64 {
        self.allowed().saturating_sub(self.used)
    }
}

/// Capability contract every storage destination must satisfy. Everything
/// above this trait treats the backend as opaque: ids are backend-chosen
/// strings, and a transform descriptor (if any) travels alongside each
/// upload/download for the transform layer to apply out of band.
pub trait StorageBackend: Send + Sync {
    /// Exact-name search. May legitimately return zero, one, or several
    /// entries; callers decide what multiplicity means.
    fn search_by_name(&self, name: &str) -> Result<Vec<RemoteEntry>>;

    fn upload(&self, req: &UploadRequest, transform: Option<&TransformDescriptor>)
        -> Result<Receipt>;

    fn download(
        &self,
        req: &DownloadRequest,
        transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt>;

    /// Stream `length` bytes starting at `offset` as a lazy chunk sequence.
    fn stream_range(&self, id: &str, offset: u64, length: u64) -> Result<ByteStream>;

    fn remove(&self, id: &str) -> Result<Receipt>;

    fn capacity(&self) -> Result<Capacity>;
}

/// Configuration needed to construct a backend.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Backend kind selector, e.g. "local".
    pub kind: String,
    /// Backend-specific destination (directory path for "local").
    pub destination: String,
    /// Administrative byte ceiling for this backend, if any.
    pub quota: Option<u64>,
}

/// Build a storage backend from its configuration.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match cfg.kind.as_str() {
        "local" => Ok(Arc::new(LocalBackend::new(&cfg.destination, cfg.quota)?)),
        other => Err(ManifoldError::UnsupportedBackend(other.to_string())),
    }
}
