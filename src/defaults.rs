//! Default values for modsync configuration.
//!
//! Centralized so the YAML loader, the `install` command and the tests agree
//! on the same values.

use std::path::PathBuf;
use std::time::Duration;

/// Forge API used when neither the configuration nor a manifest names one.
pub const DEFAULT_FORGE_BASE_URL: &str = "https://forgeapi.puppet.com";

/// Worker count of each resolution pool (Git and Forge).
pub const DEFAULT_MAX_WORKER: usize = 50;

/// Worker count of the materialization pool.
pub const DEFAULT_MAX_EXTRACT_WORKER: usize = 20;

/// HTTP timeout for registry requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the manifest file inside an environment branch.
pub const MANIFEST_FILE_NAME: &str = "Puppetfile";

/// User agent sent with every registry request.
pub fn user_agent() -> String {
    format!("modsync/{}", env!("CARGO_PKG_VERSION"))
}

/// Returns the default cache root directory.
///
/// Uses the platform-appropriate cache directory:
/// - Linux: `~/.cache/modsync` (XDG Base Directory)
/// - macOS: `~/Library/Caches/modsync`
///
/// Falls back to `.modsync-cache` in the current directory if the
/// platform cache directory cannot be determined.
///
/// This can be overridden by `cachedir` in the configuration, the
/// `--cache-dir` flag of `install`, or the `MODSYNC_CACHE` environment
/// variable.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".modsync-cache"))
        .join("modsync")
}
