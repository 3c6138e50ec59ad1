//! Shared state of one sync run.
//!
//! A [`SyncContext`] is created per run and passed by reference into every
//! worker. It owns the latest-version table, the set of paths the run
//! manages, the run counters, the batched deprecation warnings and one
//! fetch claim per Forge release.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::warn;

use crate::error::{Error, Result};

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub mirrors_synced: usize,
    pub forge_queries: usize,
    pub forge_cache_hits: usize,
    pub forge_downloads: usize,
    pub modules_updated: usize,
    pub modules_unchanged: usize,
    pub environments_synced: usize,
    pub paths_purged: usize,
    pub unreachable: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SyncContext {
    latest_versions: RwLock<HashMap<String, String>>,
    managed: Mutex<BTreeSet<PathBuf>>,
    stats: Mutex<SyncStats>,
    deprecations: Mutex<Vec<String>>,
    needs_sync: Mutex<bool>,
    fetches: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    verbose: bool,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| Error::LockPoisoned {
        context: what.to_string(),
    })
}

impl SyncContext {
    /// With `verbose`, deprecations are logged as soon as they are seen
    /// instead of at the end of the run.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Default::default()
        }
    }

    /// Forget all resolved latest versions.
    pub fn reset_latest(&self) -> Result<()> {
        self.latest_versions
            .write()
            .map_err(|_| Error::LockPoisoned {
                context: "latest version table".to_string(),
            })?
            .clear();
        Ok(())
    }

    pub fn set_latest(&self, slug: &str, version: &str) -> Result<()> {
        self.latest_versions
            .write()
            .map_err(|_| Error::LockPoisoned {
                context: "latest version table".to_string(),
            })?
            .insert(slug.to_string(), version.to_string());
        Ok(())
    }

    /// Record `version` unless `slug` already has an entry.
    pub fn set_latest_if_absent(&self, slug: &str, version: &str) -> Result<()> {
        self.latest_versions
            .write()
            .map_err(|_| Error::LockPoisoned {
                context: "latest version table".to_string(),
            })?
            .entry(slug.to_string())
            .or_insert_with(|| version.to_string());
        Ok(())
    }

    /// Latest version resolved for `slug` (`author-name`) in this run.
    pub fn latest(&self, slug: &str) -> Result<Option<String>> {
        Ok(self
            .latest_versions
            .read()
            .map_err(|_| Error::LockPoisoned {
                context: "latest version table".to_string(),
            })?
            .get(slug)
            .cloned())
    }

    /// Record that `path` was produced by this run and must survive purging.
    pub fn manage(&self, path: impl Into<PathBuf>) -> Result<()> {
        lock(&self.managed, "managed paths")?.insert(path.into());
        Ok(())
    }

    pub fn is_managed(&self, path: &Path) -> Result<bool> {
        Ok(lock(&self.managed, "managed paths")?.contains(path))
    }

    pub fn managed_paths(&self) -> Result<BTreeSet<PathBuf>> {
        Ok(lock(&self.managed, "managed paths")?.clone())
    }

    /// Apply `update` to the run counters.
    pub fn record(&self, update: impl FnOnce(&mut SyncStats)) -> Result<()> {
        update(&mut *lock(&self.stats, "sync stats")?);
        Ok(())
    }

    /// Whether mirroring `url` failed earlier in this run.
    pub fn is_unreachable(&self, url: &str) -> Result<bool> {
        Ok(lock(&self.stats, "sync stats")?
            .unreachable
            .iter()
            .any(|u| u == url))
    }

    pub fn stats(&self) -> Result<SyncStats> {
        Ok(lock(&self.stats, "sync stats")?.clone())
    }

    pub fn deprecation(&self, message: String) -> Result<()> {
        if self.verbose {
            warn!("{}", message);
            return Ok(());
        }
        let mut deprecations = lock(&self.deprecations, "deprecations")?;
        if !deprecations.contains(&message) {
            deprecations.push(message);
        }
        Ok(())
    }

    /// Deprecations batched so far, emptying the batch.
    pub fn take_deprecations(&self) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut *lock(
            &self.deprecations,
            "deprecations",
        )?))
    }

    /// The claim on fetching release `key` (`author-name-version`).
    ///
    /// Every requester of the same key gets the same lock; whoever holds it
    /// is the only one downloading that release.
    pub fn fetch_claim(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        Ok(Arc::clone(
            lock(&self.fetches, "fetch claims")?
                .entry(key.to_string())
                .or_default(),
        ))
    }

    /// Dry-run: something would have changed.
    pub fn mark_needs_sync(&self) -> Result<()> {
        *lock(&self.needs_sync, "needs sync flag")? = true;
        Ok(())
    }

    pub fn needs_sync(&self) -> Result<bool> {
        Ok(*lock(&self.needs_sync, "needs sync flag")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_latest_version_table() {
        let context = SyncContext::new(false);
        assert_eq!(context.latest("puppetlabs-apt").unwrap(), None);
        context.set_latest("puppetlabs-apt", "9.1.0").unwrap();
        assert_eq!(
            context.latest("puppetlabs-apt").unwrap().as_deref(),
            Some("9.1.0")
        );
        context.set_latest_if_absent("puppetlabs-apt", "1.0.0").unwrap();
        assert_eq!(
            context.latest("puppetlabs-apt").unwrap().as_deref(),
            Some("9.1.0")
        );
        context.reset_latest().unwrap();
        assert_eq!(context.latest("puppetlabs-apt").unwrap(), None);
    }

    #[test]
    fn test_fetch_claim_is_shared_per_release() {
        let context = SyncContext::new(false);
        let first = context.fetch_claim("puppetlabs-apt-2.3.0").unwrap();
        let second = context.fetch_claim("puppetlabs-apt-2.3.0").unwrap();
        let other = context.fetch_claim("puppetlabs-apt-9.1.0").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));

        let _held = first.lock().unwrap();
        assert!(second.try_lock().is_err());
        assert!(other.try_lock().is_ok());
    }

    #[test]
    fn test_concurrent_updates() {
        let context = SyncContext::new(false);
        (0..200).into_par_iter().for_each(|i| {
            context.manage(format!("/envs/e{}", i % 50)).unwrap();
            context.record(|s| s.forge_queries += 1).unwrap();
        });
        assert_eq!(context.managed_paths().unwrap().len(), 50);
        assert_eq!(context.stats().unwrap().forge_queries, 200);
        assert!(context.is_managed(Path::new("/envs/e7")).unwrap());
    }

    #[test]
    fn test_deprecations_batched_and_deduplicated() {
        let context = SyncContext::new(false);
        context.deprecation("a is deprecated".to_string()).unwrap();
        context.deprecation("a is deprecated".to_string()).unwrap();
        context.deprecation("b is deprecated".to_string()).unwrap();
        assert_eq!(context.take_deprecations().unwrap().len(), 2);
        assert!(context.take_deprecations().unwrap().is_empty());

        let verbose = SyncContext::new(true);
        verbose.deprecation("c is deprecated".to_string()).unwrap();
        assert!(verbose.take_deprecations().unwrap().is_empty());
    }

    #[test]
    fn test_unreachable_lookup() {
        let context = SyncContext::new(false);
        context
            .record(|s| s.unreachable.push("https://a.example/x.git".to_string()))
            .unwrap();
        assert!(context.is_unreachable("https://a.example/x.git").unwrap());
        assert!(!context.is_unreachable("https://a.example/y.git").unwrap());
    }

    #[test]
    fn test_needs_sync_flag() {
        let context = SyncContext::new(false);
        assert!(!context.needs_sync().unwrap());
        context.mark_needs_sync().unwrap();
        assert!(context.needs_sync().unwrap());
    }
}
