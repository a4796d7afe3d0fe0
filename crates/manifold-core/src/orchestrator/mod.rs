//! The Multi-Backend Orchestrator: one consistent view over an ordered
//! list of per-backend index engines.
//!
//! The backend list order is the resolution order: whenever multiple
//! backends could answer, the first one listed wins. Fan-out operations run
//! concurrently and correlate answers by backend nickname; per-backend
//! engines sit behind a mutex because shard and manifest updates are
//! read-modify-write and must be serialized per backend.

pub mod fanout;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use std::sync::Mutex;

use tracing::{debug, info, warn};

use manifold_storage::Capacity;
use manifold_types::{hash_file, ContentHash, HashAlgorithm, ManifoldError, Result};

use crate::distribute::{distribute, Bins, Items, Placement};
use crate::index::format::FileRecord;
use crate::index::{Fetched, IndexEngine, TagEdit};
use fanout::{fan_out, Tagged};

/// One backend slot: nickname plus its serialized engine.
pub struct BackendHandle {
    nickname: String,
    engine: Mutex<IndexEngine>,
}

impl BackendHandle {
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut IndexEngine) -> Result<T>) -> Result<T> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| ManifoldError::Other(format!("engine lock poisoned: {}", self.nickname)))?;
        f(&mut engine)
    }
}

/// A record annotated with the backend it came from.
#[derive(Debug, Clone)]
pub struct Located {
    pub backend: String,
    pub record: FileRecord,
}

/// What `upload` did.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// Some backend already held the content; nothing was transferred.
    AlreadyPresent { backend: String, record: FileRecord },
    /// The content was stored on exactly one backend.
    Stored { backend: String, record: FileRecord },
}

/// Aggregate capacity across backends. `partial` means at least one backend
/// failed to answer, so the totals are lower bounds.
#[derive(Debug)]
pub struct CapacityReport {
    pub used: u64,
    pub allowed: u64,
    pub total: u64,
    pub partial: bool,
    pub per_backend: Vec<(String, Result<Capacity>)>,
}

/// The diff `sync` wants to act on. Additions are what `apply_sync`
/// transfers; removals are reported only, never executed automatically.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub additions: BTreeMap<String, BTreeSet<ContentHash>>,
    pub removals: BTreeMap<String, BTreeSet<ContentHash>>,
    /// First backend (in resolution order) currently holding each hash.
    pub sources: HashMap<ContentHash, String>,
    pub sizes: HashMap<ContentHash, u64>,
    /// Backends that failed to report and were left out of this pass.
    pub excluded: Vec<String>,
}

impl SyncPlan {
    pub fn addition_count(&self) -> usize {
        self.additions.values().map(BTreeSet::len).sum()
    }

    pub fn removal_count(&self) -> usize {
        self.removals.values().map(BTreeSet::len).sum()
    }

    pub fn is_noop(&self) -> bool {
        self.addition_count() == 0 && self.removal_count() == 0
    }
}

#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub backend: String,
    pub hash: ContentHash,
    pub error: String,
}

/// What `apply_sync` actually did; failures are per item, never aborting
/// the pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub transferred: Vec<(String, ContentHash)>,
    pub failures: Vec<SyncFailure>,
}

pub struct Orchestrator {
    backends: Vec<BackendHandle>,
}

impl Orchestrator {
    /// Build from engines already sorted into resolution order.
    pub fn new(ordered: Vec<(String, IndexEngine)>) -> Self {
        let backends = ordered
            .into_iter()
            .map(|(nickname, engine)| BackendHandle {
                nickname,
                engine: Mutex::new(engine),
            })
            .collect();
        Orchestrator { backends }
    }

    pub fn nicknames(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.nickname()).collect()
    }

    /// Run an operation against one named backend's engine.
    pub fn on_backend<T>(
        &self,
        nickname: &str,
        f: impl FnOnce(&mut IndexEngine) -> Result<T>,
    ) -> Result<T> {
        let backend = self
            .backends
            .iter()
            .find(|b| b.nickname == nickname)
            .ok_or_else(|| ManifoldError::Config(format!("unknown service '{nickname}'")))?;
        backend.with_engine(f)
    }

    /// Union of every backend's catalog, deduped by content hash. The first
    /// backend in resolution order to report a hash wins the merged
    /// record's identity; later duplicates are dropped.
    pub fn list_files(&self) -> Vec<Located> {
        let answers = fan_out(&self.backends, |b| b.with_engine(|e| e.list_files()));
        let mut seen: HashSet<ContentHash> = HashSet::new();
        let mut merged = Vec::new();
        for Tagged { nickname, outcome } in answers {
            match outcome {
                Ok(records) => {
                    for record in records {
                        if record.hashes.iter().any(|h| seen.contains(h)) {
                            continue;
                        }
                        seen.extend(record.hashes.iter().cloned());
                        merged.push(Located {
                            backend: nickname.clone(),
                            record,
                        });
                    }
                }
                Err(err) => warn!(backend = %nickname, error = %err, "list failed, skipping backend"),
            }
        }
        merged
    }

    /// First backend in resolution order holding `hash`, queried
    /// sequentially with short-circuit on the first present answer. A
    /// backend error counts as absent, not as a stop.
    pub fn has(&self, hash: &ContentHash) -> Option<String> {
        for backend in &self.backends {
            match backend.with_engine(|e| e.has_hash(hash)) {
                Ok(true) => return Some(backend.nickname.clone()),
                Ok(false) => {}
                Err(err) => {
                    warn!(backend = %backend.nickname, error = %err, "has query failed, treating as absent")
                }
            }
        }
        None
    }

    /// Name search across all backends, deduped by `(name, primary hash)`
    /// while preserving each match's origin.
    pub fn search_by_name(&self, needle: &str, fuzzy: bool) -> Vec<Located> {
        let answers = fan_out(&self.backends, |b| {
            b.with_engine(|e| {
                if fuzzy {
                    e.fuzzy_search_by_name(needle)
                } else {
                    e.search_by_name(needle)
                }
            })
        });
        let mut seen: HashSet<(String, ContentHash)> = HashSet::new();
        let mut merged = Vec::new();
        for Tagged { nickname, outcome } in answers {
            match outcome {
                Ok(records) => {
                    for record in records {
                        let key = (record.name.clone(), record.primary_hash().clone());
                        if seen.insert(key) {
                            merged.push(Located {
                                backend: nickname.clone(),
                                record,
                            });
                        }
                    }
                }
                Err(err) => warn!(backend = %nickname, error = %err, "search failed, skipping backend"),
            }
        }
        merged
    }

    /// Store a file on exactly one backend unless some backend already has
    /// its content.
    ///
    /// Every backend is asked first (no short-circuit; placement needs full
    /// knowledge). The upload target is the first backend in resolution
    /// order that affirmatively reported absence; a backend that failed to
    /// answer is never chosen. Wider replication is `sync`'s job.
    pub fn upload(&self, path: &Path) -> Result<UploadOutcome> {
        let hash = hash_file(path, HashAlgorithm::PREFERRED)?;
        let answers = fan_out(&self.backends, |b| b.with_engine(|e| e.has_hash(&hash)));

        for Tagged { nickname, outcome } in &answers {
            if matches!(outcome, Ok(true)) {
                let record = self.on_backend(nickname, |e| {
                    e.search_by_hash(&hash)?
                        .into_iter()
                        .next()
                        .ok_or_else(|| ManifoldError::NotFound(hash.to_string()))
                })?;
                info!(backend = %nickname, hash = %hash, "content already present");
                return Ok(UploadOutcome::AlreadyPresent {
                    backend: nickname.clone(),
                    record,
                });
            }
        }

        let target = answers
            .iter()
            .find(|t| matches!(t.outcome, Ok(false)))
            .map(|t| t.nickname.clone())
            .ok_or_else(|| {
                ManifoldError::NoWritableBackend(path.display().to_string())
            })?;

        let record = self.on_backend(&target, |e| e.upload(path, Some(hash.clone())))?;
        info!(backend = %target, name = %record.name, "stored");
        Ok(UploadOutcome::Stored {
            backend: target,
            record,
        })
    }

    /// Download from the first backend in resolution order that can resolve
    /// the identifier.
    pub fn download(&self, root: &Path, identifier: &str) -> Result<(String, Fetched)> {
        for backend in &self.backends {
            match backend.with_engine(|e| e.resolve(identifier)) {
                Ok(_) => {
                    let fetched = backend.with_engine(|e| e.download(root, identifier))?;
                    return Ok((backend.nickname.clone(), fetched));
                }
                Err(ManifoldError::NotFound(_)) => {}
                Err(err) => {
                    warn!(backend = %backend.nickname, error = %err, "resolve failed, trying next backend")
                }
            }
        }
        Err(ManifoldError::NotFound(identifier.to_string()))
    }

    /// Remove the identified content from every backend holding it.
    /// Resolution happens per backend, so replicas under different records
    /// are all removed.
    pub fn remove(&self, identifier: &str) -> Result<Vec<Located>> {
        let mut removed = Vec::new();
        for backend in &self.backends {
            let outcome = backend.with_engine(|e| {
                let hash = e.resolve(identifier)?.primary_hash().clone();
                e.remove(&hash)
            });
            match outcome {
                Ok(record) => removed.push(Located {
                    backend: backend.nickname.clone(),
                    record,
                }),
                Err(ManifoldError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if removed.is_empty() {
            return Err(ManifoldError::NotFound(identifier.to_string()));
        }
        Ok(removed)
    }

    /// Apply a tag edit on every backend, each touching only the
    /// identifiers it can resolve. An unreachable backend is skipped with a
    /// warning; edits already persisted elsewhere are still reported.
    pub fn tag(&self, identifiers: &[String], edit: &TagEdit) -> Result<Vec<Located>> {
        let answers = fan_out(&self.backends, |b| {
            b.with_engine(|e| {
                let mut present = Vec::new();
                for identifier in identifiers {
                    match e.resolve(identifier) {
                        Ok(_) => present.push(identifier.clone()),
                        Err(ManifoldError::NotFound(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
                e.tag(&present, edit)
            })
        });

        let mut updated = Vec::new();
        for Tagged { nickname, outcome } in answers {
            match outcome {
                Ok(records) => {
                    for record in records {
                        updated.push(Located {
                            backend: nickname.clone(),
                            record,
                        });
                    }
                }
                Err(err) => {
                    warn!(backend = %nickname, error = %err, "tag failed, skipping backend")
                }
            }
        }
        Ok(updated)
    }

    /// Aggregate capacity across all backends; a failed backend marks the
    /// report partial instead of failing it.
    pub fn capacity(&self) -> CapacityReport {
        let answers = fan_out(&self.backends, |b| b.with_engine(|e| e.capacity()));
        let mut report = CapacityReport {
            used: 0,
            allowed: 0,
            total: 0,
            partial: false,
            per_backend: Vec::with_capacity(answers.len()),
        };
        for Tagged { nickname, outcome } in answers {
            match &outcome {
                Ok(cap) => {
                    report.used = report.used.saturating_add(cap.used);
                    report.allowed = report.allowed.saturating_add(cap.allowed());
                    report.total = report.total.saturating_add(cap.total);
                }
                Err(err) => {
                    warn!(backend = %nickname, error = %err, "capacity query failed");
                    report.partial = true;
                }
            }
            report.per_backend.push((nickname, outcome));
        }
        report
    }

    /// Explicitly migrate and reload every backend's catalog.
    pub fn refresh(&self) -> Vec<(String, Result<()>)> {
        fan_out(&self.backends, |b| b.with_engine(|e| e.refresh()))
            .into_iter()
            .map(|t| (t.nickname, t.outcome))
            .collect()
    }

    /// Compute the convergence diff without acting on it.
    ///
    /// A backend that fails to report is excluded from this pass: it
    /// contributes no placement and gains no transfers, and its replicas
    /// are never treated as removable. Placement identity uses only each
    /// record's preferred-algorithm hash so the item space stays
    /// single-valued.
    pub fn plan_sync(&self) -> SyncPlan {
        let snapshots = fan_out(&self.backends, |b| {
            b.with_engine(|e| Ok((e.list_files()?, e.capacity()?)))
        });

        let mut bins = Bins::new();
        let mut allowed: HashMap<String, u64> = HashMap::new();
        let mut items = Items::new();
        let mut current = Placement::new();
        let mut plan = SyncPlan::default();

        for Tagged { nickname, outcome } in snapshots {
            match outcome {
                Ok((records, cap)) => {
                    bins.insert(nickname.clone(), cap.available());
                    allowed.insert(nickname.clone(), cap.allowed());
                    let mut held = BTreeSet::new();
                    for record in records {
                        let Some(hash) = record.preferred_hash() else {
                            debug!(backend = %nickname, name = %record.name, "no preferred hash, skipping for sync");
                            continue;
                        };
                        held.insert(hash.clone());
                        plan.sizes.insert(hash.clone(), record.size);
                        items.insert(hash.clone(), record.size);
                        plan.sources
                            .entry(hash.clone())
                            .or_insert_with(|| nickname.clone());
                    }
                    current.insert(nickname, held);
                }
                Err(err) => {
                    warn!(backend = %nickname, error = %err, "backend excluded from sync pass");
                    plan.excluded.push(nickname);
                }
            }
        }

        let target = distribute(&bins, &items, &current);
        for (backend, want) in &target {
            let have = current.get(backend).cloned().unwrap_or_default();
            let gain: BTreeSet<ContentHash> = want.difference(&have).cloned().collect();
            if !gain.is_empty() {
                plan.additions.insert(backend.clone(), gain);
            }
        }

        // Over-quota replicas are flagged, largest first, but never removed
        // automatically.
        for (backend, held) in &current {
            let cap = allowed.get(backend).copied().unwrap_or(u64::MAX);
            let mut used: u64 = held.iter().filter_map(|h| items.get(h)).sum();
            if used <= cap {
                continue;
            }
            let mut by_size: Vec<&ContentHash> = held.iter().collect();
            by_size.sort_by_key(|h| std::cmp::Reverse(items.get(*h).copied().unwrap_or(0)));
            let mut excess = BTreeSet::new();
            for hash in by_size {
                if used <= cap {
                    break;
                }
                used = used.saturating_sub(items.get(hash).copied().unwrap_or(0));
                excess.insert(hash.clone());
            }
            plan.removals.insert(backend.clone(), excess);
        }

        plan
    }

    /// Execute a plan's additions: download each gained hash from its
    /// source to scoped scratch storage, then upload it to the gaining
    /// backend. Failures are tracked per item; the pass never aborts, and
    /// re-running after a partial pass is safe because transfers are
    /// additive.
    pub fn apply_sync(&self, plan: &SyncPlan) -> SyncReport {
        let mut report = SyncReport::default();
        for (backend, hashes) in &plan.additions {
            for hash in hashes {
                match self.transfer(plan, hash, backend) {
                    Ok(()) => report.transferred.push((backend.clone(), hash.clone())),
                    Err(err) => {
                        warn!(backend = %backend, hash = %hash, error = %err, "transfer failed");
                        report.failures.push(SyncFailure {
                            backend: backend.clone(),
                            hash: hash.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }
        report
    }

    fn transfer(&self, plan: &SyncPlan, hash: &ContentHash, target: &str) -> Result<()> {
        let source = plan
            .sources
            .get(hash)
            .ok_or_else(|| ManifoldError::NotFound(hash.to_string()))?;
        // Scratch space is scoped: cleaned up on every exit path.
        let scratch = tempfile::tempdir()?;
        let fetched = self.on_backend(source, |e| e.download(scratch.path(), hash.as_str()))?;
        self.on_backend(target, |e| e.upload(&fetched.path, Some(hash.clone())))?;
        debug!(from = %source, to = %target, hash = %hash, "replica transferred");
        Ok(())
    }
}
