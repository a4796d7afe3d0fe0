//! In-memory storage backends for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use manifold_storage::{
    ByteStream, Capacity, DownloadRequest, Receipt, RemoteEntry, StorageBackend,
    TransformDescriptor, UploadRequest,
};
use manifold_types::{ManifoldError, Result};

/// Blob store backed by a map. Transforms are accepted and ignored, same
/// as the local backend.
pub struct MemoryBackend {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    quota: Option<u64>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryBackend {
            blobs: Mutex::new(HashMap::new()),
            quota: None,
        })
    }

    pub fn with_quota(quota: u64) -> Arc<Self> {
        Arc::new(MemoryBackend {
            blobs: Mutex::new(HashMap::new()),
            quota: Some(quota),
        })
    }

    /// Seed a raw blob directly, bypassing the upload path.
    pub fn seed(&self, id: &str, bytes: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes.to_vec());
    }

    pub fn raw(&self, id: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(id).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

impl StorageBackend for MemoryBackend {
    fn search_by_name(&self, name: &str) -> Result<Vec<RemoteEntry>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .get(name)
            .map(|bytes| {
                vec![RemoteEntry {
                    id: name.to_string(),
                    name: name.to_string(),
                    size: bytes.len() as u64,
                }]
            })
            .unwrap_or_default())
    }

    fn upload(
        &self,
        req: &UploadRequest,
        _transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt> {
        let bytes = std::fs::read(&req.local_path)?;
        self.blobs.lock().unwrap().insert(req.id.clone(), bytes);
        Ok(Receipt { id: req.id.clone() })
    }

    fn download(
        &self,
        req: &DownloadRequest,
        _transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt> {
        let bytes = self
            .blobs
            .lock()
            .unwrap()
            .get(&req.id)
            .cloned()
            .ok_or_else(|| ManifoldError::NotFound(req.id.clone()))?;
        if let Some(parent) = req.local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&req.local_path, bytes)?;
        Ok(Receipt { id: req.id.clone() })
    }

    fn stream_range(&self, id: &str, offset: u64, length: u64) -> Result<ByteStream> {
        let bytes = self
            .blobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ManifoldError::NotFound(id.to_string()))?;
        let start = (offset as usize).min(bytes.len());
        let end = (offset.saturating_add(length) as usize).min(bytes.len());
        let slice = bytes[start..end].to_vec();
        let mut chunks: Vec<Result<Vec<u8>>> =
            slice.chunks(64 * 1024).map(|c| Ok(c.to_vec())).collect();
        chunks.reverse();
        Ok(Box::new(std::iter::from_fn(move || chunks.pop())))
    }

    fn remove(&self, id: &str) -> Result<Receipt> {
        self.blobs
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| ManifoldError::NotFound(id.to_string()))?;
        Ok(Receipt { id: id.to_string() })
    }

    fn capacity(&self) -> Result<Capacity> {
        let used = self
            .blobs
            .lock()
            .unwrap()
            .values()
            .map(|b| b.len() as u64)
            .sum();
        Ok(Capacity {
            used,
            quota: self.quota,
            total: self.quota.unwrap_or(u64::MAX),
        })
    }
}

/// Every upload id seen by a [`RecordingBackend`], in call order.
pub type PutLog = Arc<Mutex<Vec<String>>>;

/// Wraps another backend and records upload ids, so tests can count
/// physical uploads.
pub struct RecordingBackend {
    inner: Arc<dyn StorageBackend>,
    puts: PutLog,
}

impl RecordingBackend {
    pub fn wrap(inner: Arc<dyn StorageBackend>) -> (Arc<Self>, PutLog) {
        let puts: PutLog = Arc::default();
        let backend = Arc::new(RecordingBackend {
            inner,
            puts: Arc::clone(&puts),
        });
        (backend, puts)
    }
}

impl StorageBackend for RecordingBackend {
    fn search_by_name(&self, name: &str) -> Result<Vec<RemoteEntry>> {
        self.inner.search_by_name(name)
    }

    fn upload(
        &self,
        req: &UploadRequest,
        transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt> {
        self.puts.lock().unwrap().push(req.id.clone());
        self.inner.upload(req, transform)
    }

    fn download(
        &self,
        req: &DownloadRequest,
        transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt> {
        self.inner.download(req, transform)
    }

    fn stream_range(&self, id: &str, offset: u64, length: u64) -> Result<ByteStream> {
        self.inner.stream_range(id, offset, length)
    }

    fn remove(&self, id: &str) -> Result<Receipt> {
        self.inner.remove(id)
    }

    fn capacity(&self) -> Result<Capacity> {
        self.inner.capacity()
    }
}

/// A backend that is always unreachable.
pub struct FailingBackend {
    pub name: String,
}

impl FailingBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(FailingBackend {
            name: name.to_string(),
        })
    }

    fn unavailable<T>(&self) -> Result<T> {
        Err(ManifoldError::BackendUnavailable {
            backend: self.name.clone(),
            reason: "simulated outage".to_string(),
        })
    }
}

impl StorageBackend for FailingBackend {
    fn search_by_name(&self, _name: &str) -> Result<Vec<RemoteEntry>> {
        self.unavailable()
    }

    fn upload(
        &self,
        _req: &UploadRequest,
        _transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt> {
        self.unavailable()
    }

    fn download(
        &self,
        _req: &DownloadRequest,
        _transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt> {
        self.unavailable()
    }

    fn stream_range(&self, _id: &str, _offset: u64, _length: u64) -> Result<ByteStream> {
        self.unavailable()
    }

    fn remove(&self, _id: &str) -> Result<Receipt> {
        self.unavailable()
    }

    fn capacity(&self) -> Result<Capacity> {
        self.unavailable()
    }
}
