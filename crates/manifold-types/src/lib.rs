pub mod content_hash;
pub mod error;

pub use content_hash::{hash_file, ContentHash, HashAlgorithm};
pub use error::{ManifoldError, Result};
