//! Schema migrations for persisted catalog objects.
//!
//! Each migration is a pure `vN -> vN+1` transform on the raw JSON value.
//! The chain is closed: migrating from a version with no registered step
//! fails with [`ManifoldError::MigrationMissing`] instead of guessing.
//! Migrations run only through the explicit `refresh` operation — `init`
//! never repairs metadata on its own.

use serde_json::Value;

use manifold_types::{ManifoldError, Result};

use super::format::SCHEMA_VERSION;

type Migration = fn(Value) -> Result<Value>;

/// Registered migration steps; index `i` migrates version `i` to `i + 1`.
/// Version 0 predates the versioned format and cannot be migrated
/// mechanically, so the chain starts empty at the current version.
const MIGRATIONS: &[Migration] = &[];

fn version_of(value: &Value) -> Result<u32> {
    value
        .get("version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(ManifoldError::UnversionedMetadata)
}

/// Migrate a raw catalog object up to [`SCHEMA_VERSION`], applying each
/// registered step in sequence. A version beyond the current one cannot be
/// downgraded.
pub fn migrate_to_current(mut value: Value) -> Result<Value> {
    let mut version = version_of(&value)?;
    if version > SCHEMA_VERSION {
        return Err(ManifoldError::OutdatedSoftware {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    while version < SCHEMA_VERSION {
        let step = MIGRATIONS
            .get(version as usize)
            .ok_or(ManifoldError::MigrationMissing(version))?;
        value = step(value)?;
        let next = version_of(&value)?;
        debug_assert_eq!(next, version + 1);
        version = next;
    }
    Ok(value)
}
