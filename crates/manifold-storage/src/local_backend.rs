use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use manifold_types::{ManifoldError, Result};

use crate::{
    ByteStream, Capacity, DownloadRequest, Receipt, RemoteEntry, StorageBackend,
    TransformDescriptor, UploadRequest,
};

/// Chunk size for range streaming.
const STREAM_CHUNK: u64 = 64 * 1024;

/// Storage backend for a local directory (or anything mounted to look like
/// one: network share, external drive). Storage ids are flat file names
/// under the root.
pub struct LocalBackend {
    root: PathBuf,
    quota: Option<u64>,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory, creating it if
    /// missing. `quota` is the administrative byte ceiling, if any.
    pub fn new(root: &str, quota: Option<u64>) -> Result<Self> {
        let root_path = PathBuf::from(root);
        if !root_path.exists() {
            fs::create_dir_all(&root_path)?;
        }
        let root = fs::canonicalize(&root_path)?;
        Ok(Self { root, quota })
    }

    /// Reject storage ids that could escape the backend root.
    fn validate_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(ManifoldError::InvalidStorageKey("empty".into()));
        }
        if id.starts_with('/') || id.starts_with('\\') {
            return Err(ManifoldError::InvalidStorageKey(format!(
                "absolute path '{id}'"
            )));
        }
        if id.contains('\\') {
            return Err(ManifoldError::InvalidStorageKey(format!(
                "contains backslash '{id}'"
            )));
        }
        for component in Path::new(id).components() {
            if component == Component::ParentDir {
                return Err(ManifoldError::InvalidStorageKey(format!(
                    "parent traversal '{id}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, id: &str) -> Result<PathBuf> {
        Self::validate_id(id)?;
        Ok(self.root.join(id))
    }

    /// Copy `src` to `dest` through a temp file in the same directory, then
    /// atomically rename into place so readers never see a partial file.
    fn atomic_copy_in(&self, src: &Path, dest: &Path) -> Result<()> {
        let dir = dest.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut input = fs::File::open(src)?;
        std::io::copy(&mut input, tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }

    fn used_bytes(&self) -> Result<u64> {
        let mut used = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                used += meta.len();
            }
        }
        Ok(used)
    }
}

impl StorageBackend for LocalBackend {
    fn search_by_name(&self, name: &str) -> Result<Vec<RemoteEntry>> {
        Self::validate_id(name)?;
        let path = self.root.join(name);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(vec![RemoteEntry {
                id: name.to_string(),
                name: name.to_string(),
                size: meta.len(),
            }]),
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn upload(
        &self,
        req: &UploadRequest,
        _transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt> {
        let dest = self.resolve(&req.id)?;
        debug!(id = %req.id, "local upload");
        self.atomic_copy_in(&req.local_path, &dest)?;
        Ok(Receipt { id: req.id.clone() })
    }

    fn download(
        &self,
        req: &DownloadRequest,
        _transform: Option<&TransformDescriptor>,
    ) -> Result<Receipt> {
        let src = self.resolve(&req.id)?;
        if !src.is_file() {
            return Err(ManifoldError::NotFound(req.id.clone()));
        }
        if let Some(parent) = req.local_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::copy(&src, &req.local_path)?;
        Ok(Receipt { id: req.id.clone() })
    }

    fn stream_range(&self, id: &str, offset: u64, length: u64) -> Result<ByteStream> {
        let path = self.resolve(id)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifoldError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut remaining = length;
        let iter = std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let want = remaining.min(STREAM_CHUNK) as usize;
            let mut buf = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        remaining = 0;
                        return Some(Err(ManifoldError::Io(e)));
                    }
                }
            }
            if filled == 0 {
                // EOF before the requested length; the stream is simply
                // shorter than asked.
                remaining = 0;
                return None;
            }
            buf.truncate(filled);
            remaining -= filled as u64;
            Some(Ok(buf))
        });
        Ok(Box::new(iter))
    }

    fn remove(&self, id: &str) -> Result<Receipt> {
        let path = self.resolve(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(Receipt { id: id.to_string() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ManifoldError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn capacity(&self) -> Result<Capacity> {
        let used = self.used_bytes()?;
        // Physical capacity is not probed; the administrative quota is the
        // effective ceiling either way.
        Ok(Capacity {
            used,
            quota: self.quota,
            total: self.quota.unwrap_or(u64::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(quota: Option<u64>) -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap(), quota).unwrap();
        (dir, backend)
    }

    fn put(backend: &LocalBackend, id: &str, content: &[u8]) {
        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(content).unwrap();
        src.flush().unwrap();
        backend
            .upload(
                &UploadRequest {
                    id: id.to_string(),
                    local_path: src.path().to_path_buf(),
                },
                None,
            )
            .unwrap();
    }

    use std::io::Write;

    #[test]
    fn validate_id_rejects_unsafe_ids() {
        assert!(LocalBackend::validate_id("/etc/passwd").is_err());
        assert!(LocalBackend::validate_id("../../outside").is_err());
        assert!(LocalBackend::validate_id("foo/../../etc/passwd").is_err());
        assert!(LocalBackend::validate_id("foo\\bar").is_err());
        assert!(LocalBackend::validate_id("").is_err());
    }

    #[test]
    fn validate_id_accepts_safe_ids() {
        assert!(LocalBackend::validate_id("mlist").is_ok());
        assert!(LocalBackend::validate_id("5e2cd606-f9b1-4b38-9347-e79a4f23d32e").is_ok());
    }

    #[test]
    fn upload_download_roundtrip() {
        let (dir, backend) = backend(None);
        put(&backend, "abc", b"payload bytes");

        let dest = dir.path().join("out").join("restored");
        backend
            .download(
                &DownloadRequest {
                    id: "abc".to_string(),
                    local_path: dest.clone(),
                },
                None,
            )
            .unwrap();
        assert_eq!(fs::read(dest).unwrap(), b"payload bytes");
    }

    #[test]
    fn download_missing_id_is_not_found() {
        let (dir, backend) = backend(None);
        let err = backend
            .download(
                &DownloadRequest {
                    id: "nope".to_string(),
                    local_path: dir.path().join("x"),
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ManifoldError::NotFound(_)));
    }

    #[test]
    fn search_by_name_finds_exact_match_only() {
        let (_dir, backend) = backend(None);
        put(&backend, "mlist", b"{}");
        let hits = backend.search_by_name("mlist").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "mlist");
        assert_eq!(hits[0].size, 2);
        assert!(backend.search_by_name("mlis").unwrap().is_empty());
    }

    #[test]
    fn upload_overwrites_atomically() {
        let (dir, backend) = backend(None);
        put(&backend, "obj", b"version1");
        put(&backend, "obj", b"version2");
        assert_eq!(fs::read(dir.path().join("obj")).unwrap(), b"version2");
    }

    #[test]
    fn stream_range_reads_window() {
        let (_dir, backend) = backend(None);
        put(&backend, "obj", b"0123456789");
        let chunks: Vec<u8> = backend
            .stream_range("obj", 2, 5)
            .unwrap()
            .map(|c| c.unwrap())
            .flatten()
            .collect();
        assert_eq!(chunks, b"23456");
    }

    #[test]
    fn stream_range_truncates_at_eof() {
        let (_dir, backend) = backend(None);
        put(&backend, "obj", b"0123456789");
        let chunks: Vec<u8> = backend
            .stream_range("obj", 8, 100)
            .unwrap()
            .map(|c| c.unwrap())
            .flatten()
            .collect();
        assert_eq!(chunks, b"89");
    }

    #[test]
    fn remove_deletes_bytes() {
        let (dir, backend) = backend(None);
        put(&backend, "obj", b"x");
        backend.remove("obj").unwrap();
        assert!(!dir.path().join("obj").exists());
        assert!(matches!(
            backend.remove("obj").unwrap_err(),
            ManifoldError::NotFound(_)
        ));
    }

    #[test]
    fn capacity_reports_used_and_quota() {
        let (_dir, backend) = backend(Some(1000));
        put(&backend, "a", b"12345");
        put(&backend, "b", b"12345");
        let cap = backend.capacity().unwrap();
        assert_eq!(cap.used, 10);
        assert_eq!(cap.allowed(), 1000);
        assert_eq!(cap.available(), 990);
    }

    #[test]
    fn capacity_without_quota_is_unbounded() {
        let (_dir, backend) = backend(None);
        let cap = backend.capacity().unwrap();
        assert_eq!(cap.quota, None);
        assert_eq!(cap.allowed(), u64::MAX);
    }
}
