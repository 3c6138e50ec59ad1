//! # Forge Registry Cache
//!
//! On-disk cache of Forge releases below `{cache}/forge`:
//!
//! - `{author}-{name}-{version}/`: an extracted release
//! - `{author}-{name}-{version}.tar.gz`: the archive it was extracted from
//! - `{author}-{name}-latest`: symlink to the newest known version directory
//! - `{author}-{name}-latest-last-checked`: the raw body of the last module
//!   query; its mtime drives TTL revalidation
//! - `.partial/`: downloads in progress, renamed into place once verified
//!
//! A version directory only counts as cached when it holds a
//! `metadata.json`.
//! [`ForgeCache::resolve`] turns a [`ForgeModuleSpec`] into a concrete cached
//! version, with one resolution routine per [`ForgeVersion`] variant.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::archive::{digest_file, tee_download};
use crate::context::SyncContext;
use crate::error::{Error, Result};
use crate::filesystem::remove_path;
use crate::forge::{ForgeApi, ModuleInfo, ModuleQuery, ReleaseInfo};
use crate::manifest::{ForgeModuleSpec, ForgeVersion};

const STAGING_DIR: &str = ".partial";

/// Registry defaults applied to specs that carry no manifest override.
#[derive(Debug, Clone)]
pub struct ForgeCacheOptions {
    pub base_url: String,
    pub cache_ttl: Duration,
    /// Serve from the newest cached version when the registry is
    /// unreachable.
    pub use_cache_fallback: bool,
    /// Verify MD5 and size of every download against the registry.
    pub check_checksums: bool,
}

/// A release resolved to a directory in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRelease {
    pub version: String,
    pub dir: PathBuf,
}

pub struct ForgeCache {
    root: PathBuf,
    api: Box<dyn ForgeApi>,
    options: ForgeCacheOptions,
}

impl ForgeCache {
    pub fn new(cache_root: &Path, api: Box<dyn ForgeApi>, options: ForgeCacheOptions) -> Self {
        Self {
            root: cache_root.join("forge"),
            api,
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, slug: &str, version: &str) -> PathBuf {
        self.root.join(format!("{}-{}", slug, version))
    }

    /// Whether `{slug}-{version}` was completely extracted.
    pub fn is_cached(&self, slug: &str, version: &str) -> bool {
        self.version_dir(slug, version).join("metadata.json").is_file()
    }

    pub fn archive_path(&self, slug: &str, version: &str) -> PathBuf {
        self.root.join(format!("{}-{}.tar.gz", slug, version))
    }

    pub fn latest_link(&self, slug: &str) -> PathBuf {
        self.root.join(format!("{}-latest", slug))
    }

    pub fn marker_path(&self, slug: &str) -> PathBuf {
        self.root.join(format!("{}-latest-last-checked", slug))
    }

    /// Resolve `spec` to a cached release, querying and downloading as
    /// needed.
    ///
    /// `work_keys` holds the `author-name-version` keys of the whole Forge
    /// work set; a `latest` lookup that lands on one of them leaves the
    /// download to that item's worker.
    pub fn resolve(
        &self,
        spec: &ForgeModuleSpec,
        work_keys: &HashSet<String>,
        context: &SyncContext,
    ) -> Result<CachedRelease> {
        let version = match &spec.version {
            ForgeVersion::Latest => self.resolve_latest(spec, work_keys, context)?,
            ForgeVersion::Present => self.resolve_present(spec, work_keys, context)?,
            ForgeVersion::Pinned(version) => self.resolve_pinned(spec, version, context)?,
        };
        Ok(CachedRelease {
            dir: self.version_dir(&spec.slug(), &version),
            version,
        })
    }

    fn base_url<'a>(&'a self, spec: &'a ForgeModuleSpec) -> &'a str {
        spec.base_url.as_deref().unwrap_or(&self.options.base_url)
    }

    fn resolve_latest(
        &self,
        spec: &ForgeModuleSpec,
        work_keys: &HashSet<String>,
        context: &SyncContext,
    ) -> Result<String> {
        let slug = spec.slug();
        let marker = self.marker_path(&slug);
        let ttl = spec.cache_ttl.unwrap_or(self.options.cache_ttl);
        let has_versions = !self.cached_versions(&slug)?.is_empty();
        let checked_at = fs::metadata(&marker).and_then(|m| m.modified()).ok();

        if has_versions && !ttl.is_zero() {
            let fresh = checked_at
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .is_some_and(|age| age < ttl);
            if fresh {
                if let Some(info) = read_marker(&marker) {
                    let version = info.current_release.version.clone();
                    if self.is_cached(&slug, &version) {
                        debug!("{}: latest {} from cache marker", slug, version);
                        context.record(|s| s.forge_cache_hits += 1)?;
                        self.report_deprecation(&info, context)?;
                        context.set_latest(&slug, &version)?;
                        self.repoint_latest(&slug, &version)?;
                        return Ok(version);
                    }
                }
            }
        }

        let since = if has_versions { checked_at } else { None };
        let info = match self.query_module(spec, since, context) {
            Ok(info) => info,
            Err(e) if e.is_transient() && self.options.use_cache_fallback => {
                let version = self.newest_cached(&slug)?.ok_or(e)?;
                warn!(
                    "Forge unreachable for {}, falling back to cached version {}",
                    slug, version
                );
                context.set_latest(&slug, &version)?;
                return Ok(version);
            }
            Err(e) => return Err(e),
        };

        self.report_deprecation(&info, context)?;
        let version = info.current_release.version.clone();
        context.set_latest(&slug, &version)?;

        let key = format!("{}-{}", slug, version);
        if work_keys.contains(&key) {
            debug!("{} is part of the work set, only re-pointing latest", key);
        } else if !self.is_cached(&slug, &version) {
            self.ensure_release(spec, &version, Some(&info.current_release), context)?;
        }
        self.repoint_latest(&slug, &version)?;
        Ok(version)
    }

    /// Module query honouring `If-Modified-Since`; a `304` re-reads the
    /// marker and touches it.
    fn query_module(
        &self,
        spec: &ForgeModuleSpec,
        since: Option<SystemTime>,
        context: &SyncContext,
    ) -> Result<ModuleInfo> {
        let slug = spec.slug();
        let marker = self.marker_path(&slug);
        context.record(|s| s.forge_queries += 1)?;

        match self.api.module_info(self.base_url(spec), &slug, since)? {
            ModuleQuery::Fetched { body, info } => {
                fs::create_dir_all(&self.root).map_err(|e| Error::filesystem(&self.root, e))?;
                fs::write(&marker, body).map_err(|e| Error::filesystem(&marker, e))?;
                Ok(info)
            }
            ModuleQuery::NotModified => match read_marker(&marker) {
                Some(info) => {
                    debug!("{}: not modified since last check", slug);
                    touch(&marker)?;
                    Ok(info)
                }
                None => {
                    warn!("Unreadable marker {}, querying again", marker.display());
                    self.query_module(spec, None, context)
                }
            },
        }
    }

    fn resolve_present(
        &self,
        spec: &ForgeModuleSpec,
        work_keys: &HashSet<String>,
        context: &SyncContext,
    ) -> Result<String> {
        let slug = spec.slug();
        let link = self.latest_link(&slug);

        if link.symlink_metadata().is_err() {
            return self.resolve_latest(spec, work_keys, context);
        }

        let version = fs::read_link(&link)
            .ok()
            .and_then(|target| {
                target
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix(&format!("{}-", slug)))
                    .map(str::to_string)
            })
            .filter(|v| self.is_cached(&slug, v));

        match version {
            Some(version) => {
                context.set_latest_if_absent(&slug, &version)?;
                Ok(version)
            }
            None => {
                warn!("{} does not resolve to a cached version, rebuilding", link.display());
                remove_path(&link)?;
                self.resolve_latest(spec, work_keys, context)
            }
        }
    }

    fn resolve_pinned(
        &self,
        spec: &ForgeModuleSpec,
        version: &str,
        context: &SyncContext,
    ) -> Result<String> {
        let slug = spec.slug();
        if self.is_cached(&slug, version) {
            context.record(|s| s.forge_cache_hits += 1)?;
            if let Some(info) = read_marker(&self.marker_path(&slug)) {
                self.report_deprecation(&info, context)?;
            }
            return Ok(version.to_string());
        }

        context.record(|s| s.forge_queries += 1)?;
        let release = self.api.release_info(self.base_url(spec), &slug, version)?;
        if let Some(message) = release.module.as_ref().and_then(|m| m.deprecation(&slug)) {
            context.deprecation(message)?;
        }
        self.ensure_release(spec, version, Some(&release), context)?;
        Ok(version.to_string())
    }

    fn report_deprecation(&self, info: &ModuleInfo, context: &SyncContext) -> Result<()> {
        match info.status.deprecation(&info.slug) {
            Some(message) => context.deprecation(message),
            None => Ok(()),
        }
    }

    /// Download and extract `version` unless it is already cached.
    ///
    /// Concurrent requests for one release share a fetch claim, so the
    /// release is downloaded once and later requesters find it cached. The
    /// download lands in the staging area and is renamed into place only
    /// once complete and verified. When verification applies (checksum
    /// checking enabled or a SHA-256 pinned), a mismatch purges the staged
    /// files and downloads exactly once more before failing.
    pub fn ensure_release(
        &self,
        spec: &ForgeModuleSpec,
        version: &str,
        release: Option<&ReleaseInfo>,
        context: &SyncContext,
    ) -> Result<()> {
        let slug = spec.slug();
        let key = format!("{}-{}", slug, version);
        let claim = context.fetch_claim(&key)?;
        let _claimed = claim.lock().map_err(|_| Error::LockPoisoned {
            context: format!("fetch of {}", key),
        })?;
        if self.is_cached(&slug, version) {
            debug!("{} was fetched meanwhile", key);
            return Ok(());
        }

        let staging = self.root.join(STAGING_DIR);
        let partial_dir = staging.join(&key);
        let partial_archive = staging.join(format!("{}.tar.gz", key));
        let verify = self.options.check_checksums || spec.sha256sum.is_some();

        for attempt in 1..=2 {
            self.purge_release(&partial_archive, &partial_dir)?;
            info!("Downloading {}", key);
            context.record(|s| s.forge_downloads += 1)?;
            let downloaded = self
                .api
                .download(self.base_url(spec), &slug, version, &mut |reader| {
                    tee_download(reader, &partial_archive, &partial_dir, &[]).map(|_| ())
                });
            if let Err(e) = downloaded {
                self.purge_release(&partial_archive, &partial_dir)?;
                return Err(e);
            }

            if verify {
                if let Err(e) = self.verify(spec, version, &partial_archive, release) {
                    self.purge_release(&partial_archive, &partial_dir)?;
                    if attempt == 2 {
                        return Err(e);
                    }
                    warn!("{}; downloading {} again", e, key);
                    continue;
                }
            }
            return self.publish(&slug, version, &partial_archive, &partial_dir);
        }
        Ok(())
    }

    /// Move a verified download from the staging area into the cache,
    /// replacing any incomplete leftovers.
    fn publish(
        &self,
        slug: &str,
        version: &str,
        partial_archive: &Path,
        partial_dir: &Path,
    ) -> Result<()> {
        let archive = self.archive_path(slug, version);
        let dir = self.version_dir(slug, version);
        self.purge_release(&archive, &dir)?;
        fs::rename(partial_archive, &archive).map_err(|e| Error::filesystem(&archive, e))?;
        fs::rename(partial_dir, &dir).map_err(|e| Error::filesystem(&dir, e))?;
        Ok(())
    }

    fn verify(
        &self,
        spec: &ForgeModuleSpec,
        version: &str,
        archive: &Path,
        release: Option<&ReleaseInfo>,
    ) -> Result<()> {
        let artifact = format!("{}-{}", spec.slug(), version);
        let digests = digest_file(archive)?;
        let mismatch = |check: &str, expected: &str, actual: &str| Error::Integrity {
            artifact: artifact.clone(),
            check: check.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        };

        if let Some(pinned) = &spec.sha256sum {
            if !pinned.eq_ignore_ascii_case(&digests.sha256) {
                return Err(mismatch("sha256", pinned, &digests.sha256));
            }
        }

        if !self.options.check_checksums {
            return Ok(());
        }
        let Some(release) = release else {
            debug!("{}: no registry checksums to compare", artifact);
            return Ok(());
        };
        if let Some(md5) = &release.file_md5 {
            if !md5.eq_ignore_ascii_case(&digests.md5) {
                return Err(mismatch("md5", md5, &digests.md5));
            }
        }
        if let Some(size) = release.file_size {
            if size != digests.size {
                return Err(mismatch("size", &size.to_string(), &digests.size.to_string()));
            }
        }
        if spec.sha256sum.is_none() {
            if let Some(sha256) = &release.file_sha256 {
                if !sha256.eq_ignore_ascii_case(&digests.sha256) {
                    return Err(mismatch("sha256", sha256, &digests.sha256));
                }
            }
        }
        Ok(())
    }

    fn purge_release(&self, archive: &Path, dir: &Path) -> Result<()> {
        for path in [archive, dir] {
            if path.symlink_metadata().is_ok() {
                remove_path(path)?;
            }
        }
        Ok(())
    }

    /// Point `{slug}-latest` at `{slug}-{version}`, replacing the link.
    pub fn repoint_latest(&self, slug: &str, version: &str) -> Result<()> {
        let link = self.latest_link(slug);
        let target = PathBuf::from(format!("{}-{}", slug, version));
        if fs::read_link(&link).is_ok_and(|current| current == target) {
            return Ok(());
        }
        fs::create_dir_all(&self.root).map_err(|e| Error::filesystem(&self.root, e))?;

        for _ in 0..2 {
            if link.symlink_metadata().is_ok() {
                remove_path(&link)?;
            }
            match std::os::unix::fs::symlink(&target, &link) {
                Ok(()) => return Ok(()),
                // Another worker re-pointed it in between
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::filesystem(&link, e)),
            }
        }
        Err(Error::filesystem(&link, "could not replace symlink"))
    }

    /// Concrete versions of `slug` completely extracted in the cache.
    pub fn cached_versions(&self, slug: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::filesystem(&self.root, e)),
        };
        let prefix = format!("{}-", slug);
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !entry.path().join("metadata.json").is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(version) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
                continue;
            };
            if !version.is_empty() && !version.starts_with("latest") {
                versions.push(version.to_string());
            }
        }
        Ok(versions)
    }

    /// Newest cached version: semver order where both versions parse,
    /// lexicographic otherwise.
    pub fn newest_cached(&self, slug: &str) -> Result<Option<String>> {
        Ok(self
            .cached_versions(slug)?
            .into_iter()
            .max_by(|a, b| compare_versions(a, b)))
    }
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn read_marker(marker: &Path) -> Option<ModuleInfo> {
    let body = fs::read_to_string(marker).ok()?;
    ModuleInfo::parse(&body).ok()
}

fn touch(path: &Path) -> Result<()> {
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()))
        .map_err(|e| Error::filesystem(path, e))
}


#[cfg(test)]
mod tests {
    use super::mock::MockForgeApi;
    use super::*;
    use tempfile::TempDir;

    fn spec(slug: &str, version: ForgeVersion) -> ForgeModuleSpec {
        let (author, name) = slug.split_once('-').unwrap();
        ForgeModuleSpec {
            author: author.to_string(),
            name: name.to_string(),
            version,
            base_url: None,
            cache_ttl: None,
            sha256sum: None,
            module_dir: "modules".to_string(),
            origin: "main/production".to_string(),
        }
    }

    fn cache(temp: &TempDir, api: &MockForgeApi, options: Option<ForgeCacheOptions>) -> ForgeCache {
        ForgeCache::new(
            temp.path(),
            Box::new(api.clone()),
            options.unwrap_or(ForgeCacheOptions {
                base_url: "https://forge.test".to_string(),
                cache_ttl: Duration::ZERO,
                use_cache_fallback: false,
                check_checksums: true,
            }),
        )
    }

    /// A completely extracted release, as a previous run leaves it.
    fn seed_release(cache: &ForgeCache, slug: &str, version: &str) {
        let dir = cache.version_dir(slug, version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("metadata.json"),
            format!(r#"{{"name":"{}","version":"{}"}}"#, slug, version),
        )
        .unwrap();
    }

    fn offline_with_fallback(temp: &TempDir, api: &MockForgeApi) -> ForgeCache {
        *api.offline.lock().unwrap() = true;
        cache(
            temp,
            api,
            Some(ForgeCacheOptions {
                base_url: "https://forge.test".to_string(),
                cache_ttl: Duration::ZERO,
                use_cache_fallback: true,
                check_checksums: false,
            }),
        )
    }

    #[test]
    fn test_pinned_downloads_once() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-apt", &["2.3.0", "9.1.0"]);
        let cache = cache(&temp, &api, None);
        let context = SyncContext::new(false);
        let spec = spec("puppetlabs-apt", ForgeVersion::Pinned("2.3.0".to_string()));

        let release = cache.resolve(&spec, &HashSet::new(), &context).unwrap();
        assert_eq!(release.version, "2.3.0");
        assert!(release.dir.join("metadata.json").exists());
        assert!(cache.archive_path("puppetlabs-apt", "2.3.0").exists());

        cache.resolve(&spec, &HashSet::new(), &context).unwrap();
        assert_eq!(api.downloads.lock().unwrap().len(), 1);
        assert_eq!(context.stats().unwrap().forge_cache_hits, 1);
    }

    #[test]
    fn test_pinned_unknown_version_is_fatal() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-apt", &["2.3.0"]);
        let cache = cache(&temp, &api, None);
        let spec = spec("puppetlabs-apt", ForgeVersion::Pinned("0.0.1".to_string()));
        let err = cache
            .resolve(&spec, &HashSet::new(), &SyncContext::new(false))
            .unwrap_err();
        assert!(matches!(err, Error::ForgeNotFound { .. }));
    }

    #[test]
    fn test_latest_creates_symlink_and_marker() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-stdlib", &["8.0.0", "9.4.1"]);
        let cache = cache(&temp, &api, None);
        let context = SyncContext::new(false);

        let release = cache
            .resolve(
                &spec("puppetlabs-stdlib", ForgeVersion::Latest),
                &HashSet::new(),
                &context,
            )
            .unwrap();
        assert_eq!(release.version, "9.4.1");
        assert_eq!(
            fs::read_link(cache.latest_link("puppetlabs-stdlib")).unwrap(),
            PathBuf::from("puppetlabs-stdlib-9.4.1")
        );
        assert!(cache.marker_path("puppetlabs-stdlib").exists());
        assert_eq!(
            context.latest("puppetlabs-stdlib").unwrap().as_deref(),
            Some("9.4.1")
        );
        // First query is unconditional
        assert_eq!(
            api.module_queries.lock().unwrap()[0],
            ("puppetlabs-stdlib".to_string(), false)
        );
    }

    #[test]
    fn test_latest_within_ttl_is_served_from_marker() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-stdlib", &["9.4.1"]);
        let options = ForgeCacheOptions {
            base_url: "https://forge.test".to_string(),
            cache_ttl: Duration::from_secs(3600),
            use_cache_fallback: false,
            check_checksums: false,
        };
        let cache = cache(&temp, &api, Some(options));
        let spec = spec("puppetlabs-stdlib", ForgeVersion::Latest);

        cache
            .resolve(&spec, &HashSet::new(), &SyncContext::new(false))
            .unwrap();
        let context = SyncContext::new(false);
        cache.resolve(&spec, &HashSet::new(), &context).unwrap();

        assert_eq!(api.module_queries.lock().unwrap().len(), 1);
        assert_eq!(context.stats().unwrap().forge_cache_hits, 1);
    }

    #[test]
    fn test_latest_revalidates_with_if_modified_since() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-stdlib", &["9.4.1"]);
        let cache = cache(&temp, &api, None);
        let spec = spec("puppetlabs-stdlib", ForgeVersion::Latest);
        cache
            .resolve(&spec, &HashSet::new(), &SyncContext::new(false))
            .unwrap();

        *api.not_modified.lock().unwrap() = true;
        let release = cache
            .resolve(&spec, &HashSet::new(), &SyncContext::new(false))
            .unwrap();
        assert_eq!(release.version, "9.4.1");
        assert_eq!(
            api.module_queries.lock().unwrap()[1],
            ("puppetlabs-stdlib".to_string(), true)
        );
        assert_eq!(api.downloads.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_latest_in_work_set_only_repoints() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-stdlib", &["9.4.1"]);
        let cache = cache(&temp, &api, None);
        let work_keys: HashSet<String> = ["puppetlabs-stdlib-9.4.1".to_string()].into();

        cache
            .resolve(
                &spec("puppetlabs-stdlib", ForgeVersion::Latest),
                &work_keys,
                &SyncContext::new(false),
            )
            .unwrap();
        assert!(api.downloads.lock().unwrap().is_empty());
        assert!(cache.latest_link("puppetlabs-stdlib").symlink_metadata().is_ok());
    }

    #[test]
    fn test_present_uses_existing_link() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-ntp", &["1.0.0"]);
        let cache = cache(&temp, &api, None);

        // No link yet: escalates to latest
        let release = cache
            .resolve(
                &spec("puppetlabs-ntp", ForgeVersion::Present),
                &HashSet::new(),
                &SyncContext::new(false),
            )
            .unwrap();
        assert_eq!(release.version, "1.0.0");

        api.add_module("puppetlabs-ntp", &["1.0.0", "2.0.0"]);
        let context = SyncContext::new(false);
        let release = cache
            .resolve(
                &spec("puppetlabs-ntp", ForgeVersion::Present),
                &HashSet::new(),
                &context,
            )
            .unwrap();
        assert_eq!(release.version, "1.0.0");
        assert_eq!(api.module_queries.lock().unwrap().len(), 1);
        assert_eq!(context.latest("puppetlabs-ntp").unwrap().as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_present_with_dangling_link_rebuilds() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-ntp", &["2.0.0"]);
        let cache = cache(&temp, &api, None);
        fs::create_dir_all(cache.root()).unwrap();
        std::os::unix::fs::symlink("puppetlabs-ntp-1.0.0", cache.latest_link("puppetlabs-ntp"))
            .unwrap();

        let release = cache
            .resolve(
                &spec("puppetlabs-ntp", ForgeVersion::Present),
                &HashSet::new(),
                &SyncContext::new(false),
            )
            .unwrap();
        assert_eq!(release.version, "2.0.0");
        assert!(release.dir.is_dir());
    }

    #[test]
    fn test_offline_falls_back_to_newest_cached() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        let cache = offline_with_fallback(&temp, &api);
        for v in ["1.9.0", "1.10.0"] {
            seed_release(&cache, "puppetlabs-apt", v);
        }
        // Interrupted extraction, not a candidate
        fs::create_dir_all(cache.version_dir("puppetlabs-apt", "2.0.0")).unwrap();

        let release = cache
            .resolve(
                &spec("puppetlabs-apt", ForgeVersion::Latest),
                &HashSet::new(),
                &SyncContext::new(false),
            )
            .unwrap();
        assert_eq!(release.version, "1.10.0");
    }

    #[test]
    fn test_offline_present_falls_back_to_cached_version() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        let cache = offline_with_fallback(&temp, &api);
        seed_release(&cache, "puppetlabs-ntp", "1.0.0");
        let context = SyncContext::new(false);

        let release = cache
            .resolve(
                &spec("puppetlabs-ntp", ForgeVersion::Present),
                &HashSet::new(),
                &context,
            )
            .unwrap();

        assert_eq!(release.version, "1.0.0");
        assert!(api.downloads.lock().unwrap().is_empty());
        assert_eq!(context.latest("puppetlabs-ntp").unwrap().as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_incomplete_version_dir_is_downloaded_again() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-apt", &["2.3.0"]);
        let cache = cache(&temp, &api, None);
        fs::create_dir_all(cache.version_dir("puppetlabs-apt", "2.3.0").join("manifests")).unwrap();
        let spec = spec("puppetlabs-apt", ForgeVersion::Pinned("2.3.0".to_string()));

        let release = cache.resolve(&spec, &HashSet::new(), &SyncContext::new(false)).unwrap();

        assert_eq!(api.downloads.lock().unwrap().len(), 1);
        assert!(release.dir.join("metadata.json").is_file());
        assert!(release.dir.join("manifests/init.pp").is_file());
        assert!(!cache.root().join(STAGING_DIR).join("puppetlabs-apt-2.3.0").exists());
    }

    #[test]
    fn test_concurrent_requests_fetch_once() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-apt", &["2.3.0"]);
        let cache = cache(&temp, &api, None);
        let context = SyncContext::new(false);
        *api.download_delay.lock().unwrap() = Duration::from_millis(100);
        let spec = spec("puppetlabs-apt", ForgeVersion::Pinned("2.3.0".to_string()));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| cache.ensure_release(&spec, "2.3.0", None, &context).unwrap());
            }
        });

        assert_eq!(api.downloads.lock().unwrap().len(), 1);
        assert!(cache.is_cached("puppetlabs-apt", "2.3.0"));
    }

    #[test]
    fn test_offline_without_fallback_fails() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        let cache = cache(&temp, &api, None);
        *api.offline.lock().unwrap() = true;
        let err = cache
            .resolve(
                &spec("puppetlabs-apt", ForgeVersion::Latest),
                &HashSet::new(),
                &SyncContext::new(false),
            )
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_sha256_pin_mismatch_retries_once_then_fails() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-apt", &["2.3.0"]);
        let cache = cache(&temp, &api, None);
        let mut spec = spec("puppetlabs-apt", ForgeVersion::Pinned("2.3.0".to_string()));
        spec.sha256sum = Some("0".repeat(64));

        let err = cache
            .resolve(&spec, &HashSet::new(), &SyncContext::new(false))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { ref check, .. } if check == "sha256"));
        assert_eq!(api.downloads.lock().unwrap().len(), 2);
        assert!(!cache.version_dir("puppetlabs-apt", "2.3.0").exists());
        assert!(!cache.archive_path("puppetlabs-apt", "2.3.0").exists());
    }

    #[test]
    fn test_md5_mismatch_detected() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-apt", &["2.3.0"]);
        *api.corrupt_downloads.lock().unwrap() = true;
        let cache = cache(&temp, &api, None);
        let spec = spec("puppetlabs-apt", ForgeVersion::Pinned("2.3.0".to_string()));

        let err = cache
            .resolve(&spec, &HashSet::new(), &SyncContext::new(false))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { ref check, .. } if check == "md5"));
        assert_eq!(api.downloads.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_deprecation_is_batched() {
        let temp = TempDir::new().unwrap();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-old", &["1.0.0"]);
        api.deprecated
            .lock()
            .unwrap()
            .insert("puppetlabs-old".to_string(), "2020-01-01".to_string());
        let cache = cache(&temp, &api, None);
        let context = SyncContext::new(false);
        cache
            .resolve(&spec("puppetlabs-old", ForgeVersion::Latest), &HashSet::new(), &context)
            .unwrap();
        let deprecations = context.take_deprecations().unwrap();
        assert_eq!(deprecations.len(), 1);
        assert!(deprecations[0].contains("puppetlabs-old"));
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(
            compare_versions("1.10.0", "1.9.0"),
            std::cmp::Ordering::Greater
        );
        assert_eq!(compare_versions("b", "a"), std::cmp::Ordering::Greater);
    }
}
