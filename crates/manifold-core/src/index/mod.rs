//! The per-backend Index Engine.
//!
//! One `IndexEngine` owns one backend's catalog: a set of shard blobs listed
//! by the `mlist` manifest, mirrored in memory with lookup maps. All catalog
//! operations lazily initialize the engine on first use (memoized — re-entry
//! is a no-op) and translate into storage calls plus metadata bookkeeping.
//!
//! Consistency ordering on mutation keeps a crash from leaving dangling
//! references: a new shard is persisted before the manifest references it, a
//! removed shard is de-listed from the manifest before its blob is deleted,
//! and stored file bytes are deleted only after all metadata writes.

pub mod format;
pub mod migration;

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use manifold_storage::{
    ByteStream, Capacity, DownloadRequest, Receipt, StorageBackend, TransformDescriptor,
    UploadRequest,
};
use manifold_types::{hash_file, ContentHash, HashAlgorithm, ManifoldError, Result};

use format::{
    decode_manifest, decode_shard, encode_manifest, encode_shard, FileRecord, ManifestEntry,
    ManifestFile, ShardFile, MANIFEST_NAME, SHARD_ID_PREFIX,
};

/// Default per-shard file-count threshold before a new shard is opened.
pub const DEFAULT_SHARD_LIMIT: usize = 250;

/// Construction options for an [`IndexEngine`].
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Transform descriptor applied to newly stored content and shards.
    /// The manifest itself is never transformed.
    pub transform: Option<TransformDescriptor>,
    /// File-count threshold after which new records open a new shard.
    pub shard_limit: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            transform: None,
            shard_limit: DEFAULT_SHARD_LIMIT,
        }
    }
}

/// A shard held in memory alongside its storage location.
struct Shard {
    /// Stable logical id (`index-<uuid>`), kept across re-uploads.
    id: String,
    /// Storage id of the current blob; empty until first persisted.
    sid: String,
    transform: Option<TransformDescriptor>,
    files: Vec<FileRecord>,
}

impl Shard {
    fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            id: self.id.clone(),
            sid: self.sid.clone(),
            encryption: self.transform.clone(),
        }
    }
}

/// In-memory catalog: loaded shards plus derived lookup maps. The maps are
/// strict projections of `shards` and are rebuilt whenever shard positions
/// shift; they are never persisted.
struct CatalogState {
    manifest_sid: String,
    shards: Vec<Shard>,
    id_to_shard: HashMap<String, usize>,
    hash_to_shard: HashMap<ContentHash, usize>,
    sid_to_shard: HashMap<String, usize>,
}

impl CatalogState {
    fn rebuild_maps(&mut self) {
        self.id_to_shard.clear();
        self.hash_to_shard.clear();
        self.sid_to_shard.clear();
        for (si, shard) in self.shards.iter().enumerate() {
            for record in &shard.files {
                self.id_to_shard.insert(record.id.clone(), si);
                self.sid_to_shard.insert(record.sid.clone(), si);
                for hash in &record.hashes {
                    self.hash_to_shard.insert(hash.clone(), si);
                }
            }
        }
    }

    fn index_record(&mut self, si: usize, record: &FileRecord) {
        self.id_to_shard.insert(record.id.clone(), si);
        self.sid_to_shard.insert(record.sid.clone(), si);
        for hash in &record.hashes {
            self.hash_to_shard.insert(hash.clone(), si);
        }
    }

    fn record_by_id(&self, id: &str) -> Option<&FileRecord> {
        let si = *self.id_to_shard.get(id)?;
        self.shards[si].files.iter().find(|f| f.id == id)
    }

    fn record_by_hash(&self, hash: &ContentHash) -> Option<&FileRecord> {
        let si = *self.hash_to_shard.get(hash)?;
        self.shards[si].files.iter().find(|f| f.has_hash(hash))
    }

    fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.shards.iter().flat_map(|s| s.files.iter())
    }
}

/// A downloaded file: the catalog record it resolved to and the local path
/// the bytes were written to.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub record: FileRecord,
    pub path: PathBuf,
}

/// Tag operations to apply to resolved records, composed in the order
/// add, remove, set.
#[derive(Debug, Clone, Default)]
pub struct TagEdit {
    pub add: Vec<String>,
    pub remove: Vec<String>,
    pub set: Option<Vec<String>>,
}

impl TagEdit {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.set.is_none()
    }
}

/// One backend's catalog engine. State machine over initialization:
/// `Uninitialized -> Ready`, entered lazily on first catalog operation and
/// memoized.
pub struct IndexEngine {
    backend: Arc<dyn StorageBackend>,
    transform: Option<TransformDescriptor>,
    shard_limit: usize,
    /// `None` = Uninitialized, `Some` = Ready.
    state: Option<CatalogState>,
}

impl IndexEngine {
    pub fn new(backend: Arc<dyn StorageBackend>, options: IndexOptions) -> Self {
        IndexEngine {
            backend,
            transform: options.transform,
            shard_limit: options.shard_limit.max(1),
            state: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Force initialization now instead of on first use.
    pub fn force_init(&mut self) -> Result<()> {
        self.ensure_init()
    }

    fn ensure_init(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }
        self.state = Some(self.load_or_create()?);
        Ok(())
    }

    fn state(&self) -> &CatalogState {
        self.state.as_ref().expect("engine initialized")
    }

    fn state_mut(&mut self) -> &mut CatalogState {
        self.state.as_mut().expect("engine initialized")
    }

    fn load_or_create(&self) -> Result<CatalogState> {
        let matches = self.backend.search_by_name(MANIFEST_NAME)?;
        match matches.len() {
            0 => {
                debug!("no manifest found, creating an empty catalog");
                let manifest = ManifestFile::empty();
                let receipt = upload_blob(
                    self.backend.as_ref(),
                    MANIFEST_NAME,
                    &encode_manifest(&manifest)?,
                    None,
                )?;
                Ok(CatalogState {
                    manifest_sid: receipt.id,
                    shards: Vec::new(),
                    id_to_shard: HashMap::new(),
                    hash_to_shard: HashMap::new(),
                    sid_to_shard: HashMap::new(),
                })
            }
            1 => {
                let manifest_sid = matches[0].id.clone();
                debug!(sid = %manifest_sid, "loading manifest");
                // The manifest is never transformed.
                let bytes = download_blob(self.backend.as_ref(), &manifest_sid, None)?;
                let manifest = decode_manifest(&bytes)?;

                let mut shards = Vec::with_capacity(manifest.data.indices.len());
                for entry in &manifest.data.indices {
                    let shard_bytes = download_blob(
                        self.backend.as_ref(),
                        &entry.sid,
                        entry.encryption.as_ref(),
                    )?;
                    let shard_file = decode_shard(&shard_bytes)?;
                    shards.push(Shard {
                        id: entry.id.clone(),
                        sid: entry.sid.clone(),
                        transform: entry.encryption.clone(),
                        files: shard_file.files,
                    });
                }

                let mut state = CatalogState {
                    manifest_sid,
                    shards,
                    id_to_shard: HashMap::new(),
                    hash_to_shard: HashMap::new(),
                    sid_to_shard: HashMap::new(),
                };
                state.rebuild_maps();
                debug!(
                    shards = state.shards.len(),
                    files = state.id_to_shard.len(),
                    "catalog loaded"
                );
                Ok(state)
            }
            _ => Err(ManifoldError::MultipleManifests(MANIFEST_NAME.to_string())),
        }
    }

    /// Store a file's contents on this backend and track it in the catalog.
    ///
    /// If any existing record already carries the file's content hash, that
    /// record is returned unchanged and nothing is uploaded (the dedup
    /// gate). A `precomputed` hash skips re-hashing when the caller already
    /// knows it.
    pub fn upload(&mut self, path: &Path, precomputed: Option<ContentHash>) -> Result<FileRecord> {
        let hash = match precomputed {
            Some(h) => h,
            None => hash_file(path, HashAlgorithm::PREFERRED)?,
        };
        self.ensure_init()?;

        if let Some(existing) = self.state().record_by_hash(&hash) {
            info!(hash = %hash, name = %existing.name, "content already indexed, skipping upload");
            return Ok(existing.clone());
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ManifoldError::NotFound(path.display().to_string()))?;
        let size = std::fs::metadata(path)?.len();
        let id = self.fresh_id();

        debug!(name = %name, id = %id, "uploading new content");
        let receipt = self.backend.upload(
            &UploadRequest {
                id: id.clone(),
                local_path: path.to_path_buf(),
            },
            self.transform.as_ref(),
        )?;

        let record = FileRecord {
            id,
            name,
            sid: receipt.id,
            size,
            hashes: vec![hash],
            tags: Vec::new(),
            encryption: self.transform.clone(),
        };
        self.append_record(record.clone())?;
        Ok(record)
    }

    /// Generate a UUID not yet present in the catalog.
    fn fresh_id(&self) -> String {
        loop {
            let candidate = Uuid::new_v4().to_string();
            if !self.state().id_to_shard.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Append a record to the current shard, opening a new shard (and
    /// updating the manifest) when the current one is full. A new shard is
    /// persisted before the manifest gains its entry.
    fn append_record(&mut self, record: FileRecord) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let shard_limit = self.shard_limit;
        let transform = self.transform.clone();
        let state = self.state_mut();

        let has_room = state
            .shards
            .last()
            .is_some_and(|s| s.files.len() < shard_limit);

        if has_room {
            let si = state.shards.len() - 1;
            state.shards[si].files.push(record.clone());
            let sid_changed = persist_shard(backend.as_ref(), &mut state.shards[si])?;
            if sid_changed {
                persist_manifest(backend.as_ref(), state)?;
            }
            state.index_record(si, &record);
        } else {
            let mut shard = Shard {
                id: format!("{SHARD_ID_PREFIX}-{}", Uuid::new_v4()),
                sid: String::new(),
                transform,
                files: vec![record.clone()],
            };
            // Shard first, then the manifest that references it.
            persist_shard(backend.as_ref(), &mut shard)?;
            state.shards.push(shard);
            persist_manifest(backend.as_ref(), state)?;
            state.index_record(state.shards.len() - 1, &record);
        }
        Ok(())
    }

    /// Resolve an identifier to a record: exact UUID, then exact content
    /// hash, then exact name. An ambiguous name (more than one match) is an
    /// error directing the caller to the id or hash.
    pub fn resolve(&mut self, identifier: &str) -> Result<FileRecord> {
        self.ensure_init()?;
        let state = self.state();

        if Uuid::parse_str(identifier).is_ok() {
            if let Some(record) = state.record_by_id(identifier) {
                return Ok(record.clone());
            }
        }
        if let Ok(hash) = ContentHash::parse(identifier) {
            if let Some(record) = state.record_by_hash(&hash) {
                return Ok(record.clone());
            }
        }

        let mut matches = state.records().filter(|f| f.name == identifier);
        match (matches.next(), matches.next()) {
            (None, _) => Err(ManifoldError::NotFound(identifier.to_string())),
            (Some(record), None) => Ok(record.clone()),
            (Some(_), Some(_)) => Err(ManifoldError::AmbiguousName(identifier.to_string())),
        }
    }

    /// Download a file into `root`, named by its display name.
    pub fn download(&mut self, root: &Path, identifier: &str) -> Result<Fetched> {
        let record = self.resolve(identifier)?;
        let path = root.join(&record.name);
        self.backend.download(
            &DownloadRequest {
                id: record.sid.clone(),
                local_path: path.clone(),
            },
            record.encryption.as_ref(),
        )?;
        Ok(Fetched { record, path })
    }

    /// Stream a file's full contents without materializing it locally.
    pub fn stream(&mut self, identifier: &str) -> Result<(FileRecord, ByteStream)> {
        let record = self.resolve(identifier)?;
        let stream = self.backend.stream_range(&record.sid, 0, record.size)?;
        Ok((record, stream))
    }

    /// Stream a byte range of a file without materializing it locally.
    pub fn stream_range(
        &mut self,
        identifier: &str,
        offset: u64,
        length: u64,
    ) -> Result<(FileRecord, ByteStream)> {
        let record = self.resolve(identifier)?;
        let stream = self.backend.stream_range(&record.sid, offset, length)?;
        Ok((record, stream))
    }

    /// Remove the record carrying `hash` and its stored bytes.
    ///
    /// Metadata is updated first and the bytes deleted last, so a failure
    /// partway leaves an orphaned blob rather than a record pointing at
    /// nothing.
    pub fn remove(&mut self, hash: &ContentHash) -> Result<FileRecord> {
        self.ensure_init()?;
        let backend = Arc::clone(&self.backend);
        let state = self.state_mut();

        let si = *state
            .hash_to_shard
            .get(hash)
            .ok_or_else(|| ManifoldError::NotFound(hash.to_string()))?;
        let fi = state.shards[si]
            .files
            .iter()
            .position(|f| f.has_hash(hash))
            .ok_or_else(|| ManifoldError::NotFound(hash.to_string()))?;
        let record = state.shards[si].files.remove(fi);

        if state.shards[si].files.is_empty() {
            let shard = state.shards.remove(si);
            debug!(shard = %shard.id, "shard emptied, de-listing from manifest");
            // De-list from the manifest before deleting the blob.
            persist_manifest(backend.as_ref(), state)?;
            backend.remove(&shard.sid)?;
        } else {
            let sid_changed = persist_shard(backend.as_ref(), &mut state.shards[si])?;
            if sid_changed {
                persist_manifest(backend.as_ref(), state)?;
            }
        }
        state.rebuild_maps();

        // Stored bytes go last.
        backend.remove(&record.sid)?;
        Ok(record)
    }

    /// Apply a tag edit to each resolved identifier. Shards are re-uploaded
    /// once per touched shard, not once per file.
    pub fn tag(&mut self, identifiers: &[String], edit: &TagEdit) -> Result<Vec<FileRecord>> {
        self.ensure_init()?;

        let mut targets = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            let record = self.resolve(identifier)?;
            targets.push(record.id);
        }

        let backend = Arc::clone(&self.backend);
        let state = self.state_mut();
        let mut touched: BTreeSet<usize> = BTreeSet::new();
        let mut updated = Vec::with_capacity(targets.len());

        for id in &targets {
            let si = *state
                .id_to_shard
                .get(id)
                .ok_or_else(|| ManifoldError::NotFound(id.clone()))?;
            let record = state.shards[si]
                .files
                .iter_mut()
                .find(|f| &f.id == id)
                .ok_or_else(|| ManifoldError::NotFound(id.clone()))?;

            let mut tags: BTreeSet<String> = record.tags.iter().cloned().collect();
            tags.extend(edit.add.iter().cloned());
            for t in &edit.remove {
                tags.remove(t);
            }
            if let Some(set) = &edit.set {
                tags = set.iter().cloned().collect();
            }
            record.tags = tags.into_iter().collect();
            updated.push(record.clone());
            touched.insert(si);
        }

        let mut any_sid_changed = false;
        for si in touched {
            any_sid_changed |= persist_shard(backend.as_ref(), &mut state.shards[si])?;
        }
        if any_sid_changed {
            persist_manifest(backend.as_ref(), state)?;
        }
        Ok(updated)
    }

    pub fn list_files(&mut self) -> Result<Vec<FileRecord>> {
        self.ensure_init()?;
        Ok(self.state().records().cloned().collect())
    }

    /// Exact-name search over the catalog.
    pub fn search_by_name(&mut self, name: &str) -> Result<Vec<FileRecord>> {
        self.ensure_init()?;
        Ok(self
            .state()
            .records()
            .filter(|f| f.name == name)
            .cloned()
            .collect())
    }

    /// Case-insensitive substring search over display names.
    pub fn fuzzy_search_by_name(&mut self, needle: &str) -> Result<Vec<FileRecord>> {
        self.ensure_init()?;
        let needle = needle.to_lowercase();
        Ok(self
            .state()
            .records()
            .filter(|f| f.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    pub fn search_by_hash(&mut self, hash: &ContentHash) -> Result<Vec<FileRecord>> {
        self.ensure_init()?;
        Ok(self
            .state()
            .records()
            .filter(|f| f.has_hash(hash))
            .cloned()
            .collect())
    }

    pub fn has_hash(&mut self, hash: &ContentHash) -> Result<bool> {
        self.ensure_init()?;
        Ok(self.state().hash_to_shard.contains_key(hash))
    }

    pub fn has_uuid(&mut self, id: &str) -> Result<bool> {
        self.ensure_init()?;
        Ok(self.state().id_to_shard.contains_key(id))
    }

    pub fn capacity(&self) -> Result<Capacity> {
        self.backend.capacity()
    }

    pub fn shard_count(&mut self) -> Result<usize> {
        self.ensure_init()?;
        Ok(self.state().shards.len())
    }

    /// Explicitly migrate this backend's persisted catalog to the current
    /// schema version, then reload. `init` never does this on its own.
    pub fn refresh(&mut self) -> Result<()> {
        let matches = self.backend.search_by_name(MANIFEST_NAME)?;
        match matches.len() {
            0 => {
                // Nothing persisted yet; plain init creates a fresh catalog.
                self.state = None;
                self.ensure_init()
            }
            1 => {
                let manifest_sid = matches[0].id.clone();
                let raw = download_blob(self.backend.as_ref(), &manifest_sid, None)?;
                let value: serde_json::Value = serde_json::from_slice(&raw)?;
                let migrated = migration::migrate_to_current(value)?;
                let manifest: ManifestFile = serde_json::from_value(migrated)?;

                for entry in &manifest.data.indices {
                    let shard_raw = download_blob(
                        self.backend.as_ref(),
                        &entry.sid,
                        entry.encryption.as_ref(),
                    )?;
                    let shard_value: serde_json::Value = serde_json::from_slice(&shard_raw)?;
                    let shard_migrated = migration::migrate_to_current(shard_value)?;
                    let shard_bytes = serde_json::to_vec(&shard_migrated)?;
                    if shard_bytes != shard_raw {
                        upload_blob(
                            self.backend.as_ref(),
                            &entry.sid,
                            &shard_bytes,
                            entry.encryption.as_ref(),
                        )?;
                    }
                }

                let manifest_bytes = encode_manifest(&manifest)?;
                if manifest_bytes != raw {
                    upload_blob(self.backend.as_ref(), &manifest_sid, &manifest_bytes, None)?;
                }

                info!("catalog refreshed, reloading");
                self.state = None;
                self.ensure_init()
            }
            _ => Err(ManifoldError::MultipleManifests(MANIFEST_NAME.to_string())),
        }
    }
}

/// Upload a metadata blob through a temp file (the backend contract is
/// path-based).
fn upload_blob(
    backend: &dyn StorageBackend,
    id: &str,
    bytes: &[u8],
    transform: Option<&TransformDescriptor>,
) -> Result<Receipt> {
    let mut tmp = tempfile::NamedTempFile::new()?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    backend.upload(
        &UploadRequest {
            id: id.to_string(),
            local_path: tmp.path().to_path_buf(),
        },
        transform,
    )
}

/// Download a metadata blob into scoped temp storage and return its bytes.
fn download_blob(
    backend: &dyn StorageBackend,
    sid: &str,
    transform: Option<&TransformDescriptor>,
) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("blob");
    backend.download(
        &DownloadRequest {
            id: sid.to_string(),
            local_path: path.clone(),
        },
        transform,
    )?;
    Ok(std::fs::read(&path)?)
}

/// Re-upload a shard blob. Returns true if the shard's storage id changed
/// (which requires a manifest update).
fn persist_shard(backend: &dyn StorageBackend, shard: &mut Shard) -> Result<bool> {
    let bytes = encode_shard(&ShardFile::new(shard.files.clone()))?;
    let upload_id = if shard.sid.is_empty() {
        shard.id.clone()
    } else {
        shard.sid.clone()
    };
    let receipt = upload_blob(backend, &upload_id, &bytes, shard.transform.as_ref())?;
    let changed = receipt.id != shard.sid;
    shard.sid = receipt.id;
    Ok(changed)
}

/// Re-upload the manifest reflecting the current shard list.
fn persist_manifest(backend: &dyn StorageBackend, state: &mut CatalogState) -> Result<()> {
    let manifest = ManifestFile {
        version: format::SCHEMA_VERSION,
        data: format::ManifestData {
            indices: state.shards.iter().map(Shard::manifest_entry).collect(),
        },
    };
    let receipt = upload_blob(
        backend,
        &state.manifest_sid,
        &encode_manifest(&manifest)?,
        None,
    )?;
    state.manifest_sid = receipt.id;
    Ok(())
}
