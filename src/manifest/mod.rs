//! # Puppetfile Manifests
//!
//! A manifest declares the modules one environment needs. Each environment
//! branch of a source repository carries its own manifest, conventionally
//! named `Puppetfile`, written in a small line-oriented DSL:
//!
//! ```text
//! forge.baseUrl 'https://forgeapi.puppet.com'
//! forge.cacheTtl 2h45m
//! moduledir 'modules'
//!
//! mod 'puppetlabs/apt', '2.3.0'
//! mod 'puppetlabs-ntp'
//! mod 'puppetlabs/stdlib', :latest
//! mod 'site', :git => 'https://example.com/site.git',
//!   :branch => :control_branch,
//!   :default_branch => 'main'
//! ```
//!
//! Parsing produces a [`ModuleManifest`]: the Forge modules keyed by module
//! name, the Git modules keyed by module name, and the manifest-scoped
//! defaults (module directory, registry base URL, registry cache TTL).
//!
//! Parsing never touches the network or any shared state; see
//! [`parser`] for the grammar and the validation rules.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod parser;

pub use parser::{parse_file, parse_str, preprocess, LogicalLine};

/// Module directory used when a manifest has no `moduledir` directive.
pub const DEFAULT_MODULE_DIR: &str = "modules";

/// The version a Forge module declaration asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ForgeVersion {
    /// Whatever the registry currently reports as newest.
    Latest,
    /// Any version is acceptable if one is already materialized.
    Present,
    /// A concrete version string such as `2.3.0`.
    Pinned(String),
}

impl ForgeVersion {
    /// Interpret a version argument from a manifest. `latest` and `present`
    /// (with or without a leading colon) select the sentinels.
    pub fn parse(value: &str) -> Self {
        match value.trim_start_matches(':') {
            "latest" => ForgeVersion::Latest,
            "present" => ForgeVersion::Present,
            other => ForgeVersion::Pinned(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ForgeVersion::Latest => "latest",
            ForgeVersion::Present => "present",
            ForgeVersion::Pinned(v) => v,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, ForgeVersion::Pinned(_))
    }
}

impl fmt::Display for ForgeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A module fetched from the Forge registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeModuleSpec {
    pub author: String,
    pub name: String,
    pub version: ForgeVersion,
    /// Per-module registry base URL; filled from the manifest during
    /// aggregation when unset.
    pub base_url: Option<String>,
    /// Registry cache TTL propagated from the manifest during aggregation.
    pub cache_ttl: Option<Duration>,
    /// Pinned SHA-256 checksum of the release archive.
    pub sha256sum: Option<String>,
    /// Module directory this module is installed into, relative to the
    /// environment root.
    pub module_dir: String,
    /// `source/branch` of the manifest that declared the module.
    pub origin: String,
}

impl ForgeModuleSpec {
    /// `author-name`, the registry slug and the key of the latest-version
    /// table.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.author, self.name)
    }

    /// `author-name-version`, the deduplication key of the Forge work set.
    pub fn work_key(&self) -> String {
        format!("{}-{}", self.slug(), self.version)
    }
}

/// Which tree of a Git remote a module tracks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GitReference {
    /// The remote's default branch.
    #[default]
    Default,
    Branch(String),
    Tag(String),
    Commit(String),
    Ref(String),
    /// Track the branch named like the environment being synced.
    Link,
}

impl GitReference {
    /// The tree-ish to resolve for an environment named `environment_branch`.
    pub fn tree(&self, environment_branch: &str) -> String {
        match self {
            GitReference::Default => "HEAD".to_string(),
            GitReference::Branch(b) => b.clone(),
            GitReference::Tag(t) => t.clone(),
            GitReference::Commit(c) => c.clone(),
            GitReference::Ref(r) => r.clone(),
            GitReference::Link => environment_branch.to_string(),
        }
    }
}

/// A module fetched straight from a Git remote.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitModuleSpec {
    /// Remote URL; `None` for `:local => true` modules.
    pub git: Option<String>,
    pub reference: GitReference,
    /// The module lives in the control repository itself and is only
    /// protected from purging.
    pub local: bool,
    pub ignore_unreachable: bool,
    /// Trees to try, in order, when the primary tree is unreachable.
    pub fallback: Vec<String>,
    /// Install path relative to the environment root, replacing
    /// `{moduledir}/{name}`.
    pub install_path: Option<String>,
    pub private_key: Option<PathBuf>,
    pub use_ssh_agent: bool,
    pub module_dir: String,
}

impl GitModuleSpec {
    /// Directory the module is installed into, relative to the environment
    /// root.
    pub fn target_dir(&self, name: &str) -> PathBuf {
        match &self.install_path {
            Some(path) => PathBuf::from(path).join(name),
            None => PathBuf::from(&self.module_dir).join(name),
        }
    }
}

/// Parsed representation of one manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleManifest {
    /// Path the manifest was read from (for diagnostics).
    pub path: PathBuf,
    /// Every module directory that received at least one declaration, plus
    /// the active one at the end of the file.
    pub module_dirs: Vec<String>,
    pub forge_base_url: Option<String>,
    pub forge_cache_ttl: Option<Duration>,
    pub forge_modules: BTreeMap<String, ForgeModuleSpec>,
    pub git_modules: BTreeMap<String, GitModuleSpec>,
    pub source: String,
    pub branch: String,
    pub private_key: Option<PathBuf>,
}

impl ModuleManifest {
    pub fn module_count(&self) -> usize {
        self.forge_modules.len() + self.git_modules.len()
    }
}

/// Options that influence how a manifest is parsed.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Owning source id.
    pub source: String,
    /// Owning branch/environment name.
    pub branch: String,
    /// Reject `present` / `latest` versions.
    pub force_forge_versions: bool,
    /// Operator-level override that makes `moduledir` directives inert.
    pub module_dir_override: Option<String>,
    /// Validation mode: unrecognized lines are fatal.
    pub strict: bool,
    /// Private key propagated to every Git module without its own key.
    pub private_key: Option<PathBuf>,
}
