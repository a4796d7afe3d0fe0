//! Persisted catalog formats: the `mlist` manifest and index shards.
//!
//! Both are JSON with a top-level `version` tag. The version is triaged on
//! the raw value before any typed decode, so a newer or older catalog fails
//! with a precise error instead of a deserialization message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use manifold_storage::TransformDescriptor;
use manifold_types::{ContentHash, ManifoldError, Result};

/// Catalog schema version this software reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Well-known, never-transformed storage name of the manifest.
pub const MANIFEST_NAME: &str = "mlist";

/// Storage-id prefix for shard blobs.
pub const SHARD_ID_PREFIX: &str = "index";

/// One catalog entry: a logical file stored on this backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// UUIDv4, unique within this backend's catalog.
    pub id: String,
    /// Display name (the original file name).
    pub name: String,
    /// Opaque storage id the backend addresses the bytes by.
    pub sid: String,
    pub size: u64,
    /// Non-empty; the last-appended hash is the most authoritative.
    pub hashes: Vec<ContentHash>,
    pub tags: Vec<String>,
    /// Transform applied to the stored bytes, if any. Round-tripped on
    /// every access.
    pub encryption: Option<TransformDescriptor>,
}

impl FileRecord {
    /// The most authoritative hash (last appended).
    pub fn primary_hash(&self) -> &ContentHash {
        self.hashes.last().expect("FileRecord.hashes is non-empty")
    }

    /// The record's hash under the preferred algorithm, if it carries one.
    pub fn preferred_hash(&self) -> Option<&ContentHash> {
        self.hashes.iter().rev().find(|h| h.is_preferred())
    }

    pub fn has_hash(&self, hash: &ContentHash) -> bool {
        self.hashes.contains(hash)
    }
}

/// The root metadata object of a backend catalog: lists every shard.
/// Exactly one may exist per backend; stored as plain JSON under
/// [`MANIFEST_NAME`], never encrypted or compressed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub version: u32,
    pub data: ManifestData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestData {
    pub indices: Vec<ManifestEntry>,
}

/// Pointer to one shard blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Stable logical id of the shard (`index-<uuid>`).
    pub id: String,
    /// Opaque storage id of the shard blob.
    pub sid: String,
    /// Transform the shard blob was stored with.
    pub encryption: Option<TransformDescriptor>,
}

impl ManifestFile {
    pub fn empty() -> Self {
        ManifestFile {
            version: SCHEMA_VERSION,
            data: ManifestData::default(),
        }
    }
}

/// One shard: a bounded list of file records, stored as one blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFile {
    pub version: u32,
    pub files: Vec<FileRecord>,
}

impl ShardFile {
    pub fn new(files: Vec<FileRecord>) -> Self {
        ShardFile {
            version: SCHEMA_VERSION,
            files,
        }
    }
}

/// Check the `version` tag of a raw catalog object against
/// [`SCHEMA_VERSION`]. A mismatch is never silently repaired.
pub fn check_version(value: &Value) -> Result<u32> {
    let version = match value.get("version") {
        None => return Err(ManifoldError::UnversionedMetadata),
        Some(v) => v
            .as_u64()
            .ok_or(ManifoldError::UnversionedMetadata)?
            .try_into()
            .map_err(|_| ManifoldError::UnversionedMetadata)?,
    };
    if version > SCHEMA_VERSION {
        return Err(ManifoldError::OutdatedSoftware {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version < SCHEMA_VERSION {
        return Err(ManifoldError::OutdatedMetadata {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(version)
}

pub fn decode_manifest(bytes: &[u8]) -> Result<ManifestFile> {
    let value: Value = serde_json::from_slice(bytes)?;
    check_version(&value)?;
    Ok(serde_json::from_value(value)?)
}

pub fn decode_shard(bytes: &[u8]) -> Result<ShardFile> {
    let value: Value = serde_json::from_slice(bytes)?;
    check_version(&value)?;
    Ok(serde_json::from_value(value)?)
}

pub fn encode_manifest(manifest: &ManifestFile) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(manifest)?)
}

pub fn encode_shard(shard: &ShardFile) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(shard)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_manifest_roundtrips() {
        let m = ManifestFile::empty();
        let bytes = encode_manifest(&m).unwrap();
        let back = decode_manifest(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn manifest_json_shape() {
        let m = ManifestFile::empty();
        let value: Value = serde_json::from_slice(&encode_manifest(&m).unwrap()).unwrap();
        assert_eq!(value["version"], SCHEMA_VERSION);
        assert!(value["data"]["indices"].as_array().unwrap().is_empty());
    }

    #[test]
    fn newer_version_is_outdated_software() {
        let raw = format!("{{\"version\": {}, \"data\": {{\"indices\": []}}}}", SCHEMA_VERSION + 1);
        let err = decode_manifest(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ManifoldError::OutdatedSoftware { .. }));
    }

    #[test]
    fn older_version_is_outdated_metadata() {
        let raw = "{\"version\": 0, \"data\": {\"indices\": []}}";
        let err = decode_manifest(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ManifoldError::OutdatedMetadata { .. }));
    }

    #[test]
    fn missing_version_is_unversioned() {
        let raw = "{\"data\": {\"indices\": []}}";
        let err = decode_manifest(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ManifoldError::UnversionedMetadata));
    }

    #[test]
    fn shard_record_roundtrips_with_transform() {
        let record = FileRecord {
            id: "75c9a08d-6c76-4123-9a7f-7c5cd1232ceb".into(),
            name: "song.mp3".into(),
            sid: "backend-opaque-id".into(),
            size: 691493,
            hashes: vec![ContentHash::parse("xxh64:ed496289a15cd4cf").unwrap()],
            tags: vec!["music".into()],
            encryption: Some(TransformDescriptor::aes256_sha256()),
        };
        let shard = ShardFile::new(vec![record.clone()]);
        let back = decode_shard(&encode_shard(&shard).unwrap()).unwrap();
        assert_eq!(back.files, vec![record]);
    }

    #[test]
    fn primary_hash_is_last_appended() {
        let mut record = FileRecord {
            id: "x".into(),
            name: "f".into(),
            sid: "s".into(),
            size: 1,
            hashes: vec![ContentHash::parse(
                "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            )
            .unwrap()],
            tags: vec![],
            encryption: None,
        };
        let newer = ContentHash::parse("xxh64:ed496289a15cd4cf").unwrap();
        record.hashes.push(newer.clone());
        assert_eq!(record.primary_hash(), &newer);
        assert_eq!(record.preferred_hash(), Some(&newer));
    }
}
