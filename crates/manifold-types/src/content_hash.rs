use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::Xxh64;

use crate::error::{ManifoldError, Result};

/// Read buffer for streaming file hashing. Memory use is bounded by this
/// regardless of file size.
const HASH_BUFFER: usize = 64 * 1024;

/// Content hash algorithms the catalog understands.
///
/// Records may carry digests from several algorithms at once (older records
/// keep the hashes they were created with); new hashes always use
/// [`HashAlgorithm::PREFERRED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Xxh64,
    Sha256,
}

impl HashAlgorithm {
    pub const PREFERRED: HashAlgorithm = HashAlgorithm::Xxh64;

    pub fn label(&self) -> &'static str {
        match self {
            HashAlgorithm::Xxh64 => "xxh64",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// Hex digest width for this algorithm.
    fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Xxh64 => 16,
            HashAlgorithm::Sha256 => 64,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "xxh64" => Some(HashAlgorithm::Xxh64),
            "sha256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A labeled content digest of the form `algorithm:hexdigest`, e.g.
/// `xxh64:ed496289a15cd4cf`. Two files sharing any content hash are
/// considered identical content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse and validate a labeled hash string.
    pub fn parse(s: &str) -> Result<Self> {
        let (label, digest) = s
            .split_once(':')
            .ok_or_else(|| ManifoldError::InvalidHash(s.to_string()))?;
        let algorithm = HashAlgorithm::from_label(label)
            .ok_or_else(|| ManifoldError::InvalidHash(s.to_string()))?;
        let valid = digest.len() == algorithm.digest_len()
            && digest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if !valid {
            return Err(ManifoldError::InvalidHash(s.to_string()));
        }
        Ok(ContentHash(s.to_string()))
    }

    /// True if `s` parses as a labeled hash of a known algorithm.
    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        // Validated on construction.
        let label = self.0.split(':').next().unwrap_or_default();
        HashAlgorithm::from_label(label).unwrap_or(HashAlgorithm::PREFERRED)
    }

    pub fn digest(&self) -> &str {
        self.0.split_once(':').map(|(_, d)| d).unwrap_or_default()
    }

    /// True if this hash was computed with the process-wide preferred
    /// algorithm.
    pub fn is_preferred(&self) -> bool {
        self.algorithm() == HashAlgorithm::PREFERRED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_digest(algorithm: HashAlgorithm, hex_digest: String) -> Self {
        ContentHash(format!("{}:{}", algorithm.label(), hex_digest))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.0)
    }
}

/// Hash a file's contents with the given algorithm, reading in chunks.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; HASH_BUFFER];
    match algorithm {
        HashAlgorithm::Xxh64 => {
            let mut hasher = Xxh64::new(0);
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(ContentHash::from_digest(
                algorithm,
                format!("{:016x}", hasher.digest()),
            ))
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(ContentHash::from_digest(
                algorithm,
                hex::encode(hasher.finalize()),
            ))
        }
    }
}
