//! # Configuration Schema and Parsing
//!
//! This module defines the data structures that represent the modsync YAML
//! configuration file and the logic for loading and validating it.
//!
//! ```yaml
//! cachedir: /var/cache/modsync
//! forge:
//!   baseurl: https://forgeapi.puppet.com
//!   cache_ttl: 2h45m
//! maxworker: 50
//! use_cache_fallback: true
//! purge_levels: [deployment, puppetfile]
//! sources:
//!   main:
//!     remote: https://git.example.com/control.git
//!     basedir: /etc/puppetlabs/code/environments
//!     filter_regex: ^(production|staging)$
//! ```
//!
//! ## Key Components
//!
//! - **`Config`**: the whole file. Every key is optional apart from
//!   `sources`, which `sync` requires to be non-empty.
//! - **`SourceConfig`**: one control repository whose branches become
//!   environments below `basedir`.
//! - **`ForgeSettings`**: registry base URL and revalidation TTL, the
//!   defaults a manifest can override with `forge.baseUrl` and
//!   `forge.cacheTtl`.
//!
//! Durations are written `2h45m`-style and are checked while deserializing;
//! everything else is checked by [`Config::validate`], which both
//! [`parse`] and [`from_file`] run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::defaults::{
    default_cache_root, DEFAULT_FORGE_BASE_URL, DEFAULT_MAX_EXTRACT_WORKER, DEFAULT_MAX_WORKER,
    DEFAULT_TIMEOUT,
};
use crate::duration::parse_duration;
use crate::error::{Error, Result};

/// How resolved module trees are placed into environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeMode {
    /// Hardlink files out of the cache; cache and environments must share a
    /// device.
    #[default]
    Hardlink,
    Copy,
}

/// Which stale-content sweeps run after a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeLevel {
    /// Environment directories below a source's basedir.
    Deployment,
    /// Module directories below a moduledir.
    Puppetfile,
    /// Anything else inside an environment.
    Environment,
}

/// Handling of branch names that are not valid environment names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidBranches {
    /// Skip the branch and log an error.
    #[default]
    Error,
    /// Replace invalid characters with `_`.
    Correct,
    /// Like `Correct`, but warn about it.
    CorrectAndWarn,
}

/// `prefix:` may be a boolean or a literal string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PrefixSetting {
    Flag(bool),
    Literal(String),
}

impl Default for PrefixSetting {
    fn default() -> Self {
        PrefixSetting::Flag(false)
    }
}

impl PrefixSetting {
    /// Prefix prepended (with `_`) to environment names of `source`.
    pub fn resolve(&self, source: &str) -> Option<String> {
        match self {
            PrefixSetting::Flag(true) => Some(source.to_string()),
            PrefixSetting::Flag(false) => None,
            PrefixSetting::Literal(s) if s == "true" => Some(source.to_string()),
            PrefixSetting::Literal(s) if s.is_empty() || s == "false" => None,
            PrefixSetting::Literal(s) => Some(s.clone()),
        }
    }
}

/// One control repository.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Git remote of the control repository.
    pub remote: String,
    /// Directory the environments of this source are deployed into.
    pub basedir: PathBuf,
    #[serde(default)]
    pub prefix: PrefixSetting,
    /// Key used for the control repository and inherited by every Git
    /// module of its manifests that has none.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub force_forge_versions: bool,
    #[serde(default)]
    pub warn_if_branch_is_missing: bool,
    #[serde(default)]
    pub exit_if_unreachable: bool,
    /// Only branches matching this regex become environments.
    #[serde(default)]
    pub filter_regex: Option<String>,
    #[serde(default)]
    pub invalid_branches: InvalidBranches,
}

/// Registry defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForgeSettings {
    #[serde(default = "default_forge_base_url")]
    pub baseurl: String,
    /// How long a `latest` lookup is trusted before revalidating. Zero
    /// revalidates on every run.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub cache_ttl: Option<Duration>,
}

impl Default for ForgeSettings {
    fn default() -> Self {
        Self {
            baseurl: default_forge_base_url(),
            cache_ttl: None,
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_cache_root")]
    pub cachedir: PathBuf,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub forge: ForgeSettings,
    #[serde(default = "default_max_worker")]
    pub maxworker: usize,
    #[serde(default = "default_max_extract_worker")]
    pub maxextractworker: usize,
    /// Serve Forge lookups from the cache when the registry is unreachable.
    #[serde(default)]
    pub use_cache_fallback: bool,
    /// Re-clone a mirror once when updating it fails.
    #[serde(default)]
    pub retry_git_commands: bool,
    /// Treat every Git module as `:ignore_unreachable => true`.
    #[serde(default)]
    pub ignore_unreachable_modules: bool,
    #[serde(default)]
    pub check_forge_checksums: bool,
    #[serde(default)]
    pub materialize: MaterializeMode,
    /// Paths (prefixes or globs, relative to a module root) never
    /// materialized.
    #[serde(default)]
    pub module_blacklist: Vec<String>,
    #[serde(default = "default_purge_levels")]
    pub purge_levels: Vec<PurgeLevel>,
    /// Globs (relative to an environment) protected from environment-level
    /// purging.
    #[serde(default)]
    pub purge_allowlist: Vec<String>,
    /// Globs (environment names) protected from deployment-level purging.
    #[serde(default)]
    pub deployment_purge_allowlist: Vec<String>,
    /// Registry request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cachedir: default_cache_root(),
            sources: BTreeMap::new(),
            forge: ForgeSettings::default(),
            maxworker: DEFAULT_MAX_WORKER,
            maxextractworker: DEFAULT_MAX_EXTRACT_WORKER,
            use_cache_fallback: false,
            retry_git_commands: false,
            ignore_unreachable_modules: false,
            check_forge_checksums: false,
            materialize: MaterializeMode::default(),
            module_blacklist: Vec::new(),
            purge_levels: default_purge_levels(),
            purge_allowlist: Vec::new(),
            deployment_purge_allowlist: Vec::new(),
            timeout: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.maxworker == 0 || self.maxextractworker == 0 {
            return Err(Error::Config {
                message: "maxworker and maxextractworker must be at least 1".to_string(),
                hint: None,
            });
        }

        url::Url::parse(&self.forge.baseurl).map_err(|e| Error::Config {
            message: format!("forge.baseurl '{}' is not a URL: {}", self.forge.baseurl, e),
            hint: Some("Use a full URL such as https://forgeapi.puppet.com".to_string()),
        })?;

        for pattern in self
            .purge_allowlist
            .iter()
            .chain(&self.deployment_purge_allowlist)
        {
            glob::Pattern::new(pattern)?;
        }

        for (name, source) in &self.sources {
            if source.remote.trim().is_empty() {
                return Err(Error::Config {
                    message: format!("source '{}' has no remote", name),
                    hint: Some(format!("Add 'remote:' to sources.{}", name)),
                });
            }
            if source.basedir.as_os_str().is_empty() {
                return Err(Error::Config {
                    message: format!("source '{}' has no basedir", name),
                    hint: Some(format!("Add 'basedir:' to sources.{}", name)),
                });
            }
            if let Some(filter) = &source.filter_regex {
                regex::Regex::new(filter)?;
            }
        }

        // Two sources deploying into one basedir would purge each other's
        // environments unless both are prefixed.
        let mut seen: BTreeMap<&Path, &str> = BTreeMap::new();
        for (name, source) in &self.sources {
            if let Some(other) = seen.insert(source.basedir.as_path(), name) {
                if source.prefix.resolve(name).is_none()
                    || self.sources[other].prefix.resolve(other).is_none()
                {
                    return Err(Error::Config {
                        message: format!(
                            "sources '{}' and '{}' share basedir {} without a prefix",
                            other,
                            name,
                            source.basedir.display()
                        ),
                        hint: Some("Set 'prefix: true' on both sources".to_string()),
                    });
                }
            }
        }

        Ok(())
    }

    /// Configuration for the `sync` command: at least one source.
    pub fn require_sources(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config {
                message: "no sources configured".to_string(),
                hint: Some("Add a 'sources:' mapping with at least one control repository".to_string()),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn forge_cache_ttl(&self) -> Duration {
        self.forge.cache_ttl.unwrap_or(Duration::ZERO)
    }

    pub fn purges(&self, level: PurgeLevel) -> bool {
        self.purge_levels.contains(&level)
    }
}

fn default_forge_base_url() -> String {
    DEFAULT_FORGE_BASE_URL.to_string()
}

fn default_max_worker() -> usize {
    DEFAULT_MAX_WORKER
}

fn default_max_extract_worker() -> usize {
    DEFAULT_MAX_EXTRACT_WORKER
}

fn default_purge_levels() -> Vec<PurgeLevel> {
    vec![PurgeLevel::Deployment, PurgeLevel::Puppetfile]
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Parses a YAML string into a validated `Config`.
pub fn parse(yaml_content: &str) -> Result<Config> {
    let config: Config = if yaml_content.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(yaml_content)?
    };
    config.validate()?;
    Ok(config)
}

/// Parse a `Config` from a YAML file path
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| Error::filesystem(path, e))?;
    parse(&content)
}
