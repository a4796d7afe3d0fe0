use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use manifold_storage::{backend_from_config, StorageConfig, TransformDescriptor};
use manifold_types::{ManifoldError, Result};

use crate::index::{IndexEngine, IndexOptions, DEFAULT_SHARD_LIMIT};
use crate::orchestrator::Orchestrator;

/// Nickname reserved for "every configured service" on the command line;
/// no service may claim it.
pub const ALL_SERVICES: &str = "all";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifoldConfig {
    /// Backend nicknames in answer priority; unlisted services are
    /// appended after these in name order.
    #[serde(default, rename = "resolution-order")]
    pub resolution_order: Vec<String>,
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub destination: String,
    /// Human-readable byte quota, e.g. "50GB". Decimal units.
    pub quota: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default = "default_shard_limit")]
    pub shard_limit: usize,
}

fn default_shard_limit() -> usize {
    DEFAULT_SHARD_LIMIT
}

impl ManifoldConfig {
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(ManifoldError::Config(
                "no services configured".to_string(),
            ));
        }
        if self.services.contains_key(ALL_SERVICES) {
            return Err(ManifoldError::Config(format!(
                "'{ALL_SERVICES}' is a reserved service nickname"
            )));
        }
        for nickname in &self.resolution_order {
            if !self.services.contains_key(nickname) {
                return Err(ManifoldError::Config(format!(
                    "resolution-order names unknown service '{nickname}'"
                )));
            }
        }
        for (nickname, service) in &self.services {
            if let Some(quota) = &service.quota {
                parse_human_bytes(quota).map_err(|e| {
                    ManifoldError::Config(format!("service '{nickname}': {e}"))
                })?;
            }
        }
        Ok(())
    }

    /// Service nicknames in resolution order: the explicit list first, then
    /// every unlisted service in name order.
    pub fn ordered_nicknames(&self) -> Vec<String> {
        let mut ordered: Vec<String> = self.resolution_order.clone();
        for nickname in self.services.keys() {
            if !ordered.iter().any(|n| n == nickname) {
                ordered.push(nickname.clone());
            }
        }
        ordered
    }
}

/// Parse a human byte count: a plain integer, or an integer with a decimal
/// unit suffix (`KB`, `MB`, `GB`, `TB`, case-insensitive, `B` optional).
pub fn parse_human_bytes(input: &str) -> std::result::Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid byte count '{input}'"))?;
    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1_000,
        "M" | "MB" => 1_000_000,
        "G" | "GB" => 1_000_000_000,
        "T" | "TB" => 1_000_000_000_000,
        other => return Err(format!("unknown unit '{other}' in '{input}'")),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte count '{input}' overflows"))
}

/// Build the orchestrator from a validated config.
///
/// A service whose backend cannot be constructed (bad destination,
/// unsupported type) is skipped with a warning rather than failing the
/// whole command, so one broken service never takes down the rest. Zero
/// usable services is still an error.
pub fn build_orchestrator(config: &ManifoldConfig) -> Result<Orchestrator> {
    config.validate()?;

    let mut ordered = Vec::new();
    for nickname in config.ordered_nicknames() {
        let service = &config.services[&nickname];
        let quota = match &service.quota {
            Some(q) => Some(parse_human_bytes(q).map_err(ManifoldError::Config)?),
            None => None,
        };
        let storage = StorageConfig {
            kind: service.kind.clone(),
            destination: service.destination.clone(),
            quota,
        };
        let backend = match backend_from_config(&storage) {
            Ok(backend) => backend,
            Err(err) => {
                warn!(service = %nickname, error = %err, "service unavailable, skipping");
                continue;
            }
        };
        let options = IndexOptions {
            transform: service.encrypted.then(TransformDescriptor::aes256_sha256),
            shard_limit: service.shard_limit,
        };
        ordered.push((nickname, IndexEngine::new(backend, options)));
    }

    if ordered.is_empty() {
        return Err(ManifoldError::Config(
            "no usable services; check destinations and types".to_string(),
        ));
    }
    Ok(Orchestrator::new(ordered))
}

// --- Config resolution ---

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `MANIFOLD_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} (MANIFOLD_CONFIG)", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({})", path.display(), level)
            }
        }
    }
}

/// Returns search locations in priority order: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("manifold.yaml"), "project")];

    let user_config = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|base| base.join("manifold").join("config.yaml"));

    if let Some(p) = user_config {
        paths.push((p, "user"));
    }

    paths.push((PathBuf::from("/etc/manifold/config.yaml"), "system"));

    paths
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `MANIFOLD_CONFIG` env var > first existing file from
/// search paths. Returns `None` if nothing is found.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var("MANIFOLD_CONFIG") {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    for (path, level) in default_config_search_paths() {
        if path.exists() {
            return Some(ConfigSource::SearchOrder { path, level });
        }
    }

    None
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ManifoldConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ManifoldError::Config(format!("cannot read '{}': {e}", path.display()))
    })?;
    let config: ManifoldConfig = serde_yaml::from_str(&contents).map_err(|e| {
        ManifoldError::Config(format!("invalid config '{}': {e}", path.display()))
    })?;
    Ok(config)
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# manifold configuration file

# Backends listed first here answer first when several hold the same file.
resolution-order:
  - fast-disk

services:
  fast-disk:
    type: local
    destination: /srv/manifold/fast
    quota: 50GB

  archive:
    type: local
    destination: /mnt/archive/manifold
    # quota: 2TB
    # encrypted: true
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    // Tests that mutate process-global state (env vars, CWD) must be serialized.
    static GLOBAL_STATE: Mutex<()> = Mutex::new(());

    fn sample_config() -> ManifoldConfig {
        serde_yaml::from_str(minimal_config_template()).unwrap()
    }

    #[test]
    fn minimal_template_is_valid() {
        let config = sample_config();
        config.validate().unwrap();
        assert_eq!(config.resolution_order, vec!["fast-disk"]);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services["fast-disk"].quota.as_deref(), Some("50GB"));
    }

    #[test]
    fn ordered_nicknames_appends_unlisted_services() {
        let config = sample_config();
        assert_eq!(config.ordered_nicknames(), vec!["fast-disk", "archive"]);
    }

    #[test]
    fn reserved_nickname_is_rejected() {
        let mut config = sample_config();
        let service = config.services["archive"].clone();
        config.services.insert(ALL_SERVICES.to_string(), service);
        assert!(matches!(
            config.validate().unwrap_err(),
            ManifoldError::Config(_)
        ));
    }

    #[test]
    fn unknown_resolution_order_entry_is_rejected() {
        let mut config = sample_config();
        config.resolution_order.push("nonexistent".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn human_bytes_parsing() {
        assert_eq!(parse_human_bytes("123").unwrap(), 123);
        assert_eq!(parse_human_bytes("2KB").unwrap(), 2_000);
        assert_eq!(parse_human_bytes("10gb").unwrap(), 10_000_000_000);
        assert_eq!(parse_human_bytes("1 TB").unwrap(), 1_000_000_000_000);
        assert_eq!(parse_human_bytes("5M").unwrap(), 5_000_000);
        assert!(parse_human_bytes("ten").is_err());
        assert!(parse_human_bytes("5XB").is_err());
    }

    #[test]
    fn search_paths_order() {
        let paths = default_config_search_paths();
        assert!(paths.len() >= 2);
        assert_eq!(paths[0].1, "project");
        assert_eq!(paths.last().unwrap().1, "system");
    }

    #[test]
    fn resolve_cli_arg_wins() {
        let result = resolve_config_path(Some("/tmp/override.yaml"));
        let source = result.unwrap();
        assert!(matches!(source, ConfigSource::CliArg(_)));
        assert_eq!(source.path(), Path::new("/tmp/override.yaml"));
    }

    #[test]
    fn resolve_env_var() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _guard = EnvGuard::set("MANIFOLD_CONFIG", "/tmp/env-config.yaml");
        let source = resolve_config_path(None).unwrap();
        assert!(matches!(source, ConfigSource::EnvVar(_)));
        assert_eq!(source.path(), Path::new("/tmp/env-config.yaml"));
    }

    #[test]
    fn resolve_search_finds_project() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("manifold.yaml");
        fs::write(&config_path, "services: {}\n").unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let _env_guard = EnvGuard::set("MANIFOLD_CONFIG", "");

        let result = resolve_config_path(None);
        std::env::set_current_dir(original).unwrap();

        let source = result.unwrap();
        assert!(matches!(
            source,
            ConfigSource::SearchOrder { level: "project", .. }
        ));
    }

    #[test]
    fn build_orchestrator_orders_backends() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "resolution-order: [beta]\nservices:\n  alpha:\n    type: local\n    destination: {0}/alpha\n  beta:\n    type: local\n    destination: {0}/beta\n",
            dir.path().display()
        );
        let config: ManifoldConfig = serde_yaml::from_str(&yaml).unwrap();
        let orchestrator = build_orchestrator(&config).unwrap();
        assert_eq!(orchestrator.nicknames(), vec!["beta", "alpha"]);
    }

    #[test]
    fn build_orchestrator_skips_broken_service() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "services:\n  good:\n    type: local\n    destination: {0}/good\n  bad:\n    type: carrier-pigeon\n    destination: /nowhere\n",
            dir.path().display()
        );
        let config: ManifoldConfig = serde_yaml::from_str(&yaml).unwrap();
        let orchestrator = build_orchestrator(&config).unwrap();
        assert_eq!(orchestrator.nicknames(), vec!["good"]);
    }

    #[test]
    fn build_orchestrator_with_nothing_usable_fails() {
        let config: ManifoldConfig = serde_yaml::from_str(
            "services:\n  bad:\n    type: carrier-pigeon\n    destination: /nowhere\n",
        )
        .unwrap();
        assert!(build_orchestrator(&config).is_err());
    }

    /// RAII guard to set an env var and restore its previous value on drop.
    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, val: &str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::set_var(key, val);
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }
}
