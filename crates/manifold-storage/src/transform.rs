use serde::{Deserialize, Serialize};

/// Describes the byte transform (encryption and integrity digest) applied to
/// a stored object before upload. Stored on each catalog record and
/// round-tripped on every later access so the transform layer can undo it.
///
/// `None` at the call sites means the bytes were stored untransformed. The
/// transform implementation itself lives outside this crate; the catalog
/// only guarantees the descriptor survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformDescriptor {
    pub cipher: String,
    pub digest: String,
}

impl TransformDescriptor {
    /// The descriptor the original catalogs were written with.
    pub fn aes256_sha256() -> Self {
        TransformDescriptor {
            cipher: "aes-256-cbc".to_string(),
            digest: "sha256".to_string(),
        }
    }
}
