//! Phase 4: Materialization
//!
//! Populates every environment directory on a pool of `maxextractworker`
//! threads. Per environment:
//!
//! 1.  **Control tree**: when the control branch moved, everything outside
//!     the module directories is cleared and the branch is extracted over
//!     the environment, then `.latest_commit` records the commit.
//! 2.  **Git modules**: the declared tree (or the first existing fallback)
//!     is exported from the module mirror unless the target's marker already
//!     names its commit.
//! 3.  **Forge modules**: a module whose `metadata.json` already carries the
//!     wanted version is left alone; otherwise its directory is replaced by
//!     hardlinks (or copies) of the cached release.
//! 4.  **Deploy record**: `.modsync-deploy.json` notes the outcome.
//!
//! Every path produced or expected along the way is added to the managed
//! set of the [`SyncContext`], which is what the purge phase keeps. In
//! dry-run mode nothing is written; a pending change only marks the run as
//! needing a sync.

use std::fs;
use std::path::{Component, Path};
use std::sync::Mutex;

use chrono::Utc;
use log::{debug, error, info, warn};
use rayon::prelude::*;

use super::resolve::{build_pool, Resolution};
use super::{ControlTree, Environment, RunOptions};
use crate::cache::ForgeCache;
use crate::config::Config;
use crate::context::SyncContext;
use crate::deploy::{DeployRecord, DEPLOY_RECORD};
use crate::error::{Error, Result};
use crate::filesystem::{remove_path, replace_tree};
use crate::manifest::{ForgeModuleSpec, ForgeVersion, GitModuleSpec, GitReference};
use crate::repository::{RepositoryManager, TreeOutcome, COMMIT_MARKER};

/// Shared inputs of the phase.
pub struct Materializer<'a> {
    pub repos: &'a RepositoryManager,
    pub forge: &'a ForgeCache,
    pub resolution: &'a Resolution,
    pub config: &'a Config,
    pub options: &'a RunOptions,
    pub context: &'a SyncContext,
}

/// Executes Phase 4 of the pipeline.
pub fn execute(environments: &[Environment], materializer: &Materializer<'_>) -> Result<()> {
    let pool = build_pool(materializer.config.maxextractworker, "extract")?;
    let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());

    pool.install(|| {
        environments.par_iter().for_each(|env| {
            if let Err(e) = materializer.environment(env) {
                error!("Environment {} failed: {}", env.name, e);
                if let Ok(mut errors) = errors.lock() {
                    errors.push(e);
                }
            }
        });
    });

    let collected_errors = errors.into_inner().map_err(|_| Error::LockPoisoned {
        context: "materialization errors".to_string(),
    })?;
    match collected_errors.into_iter().next() {
        Some(first_error) => Err(first_error),
        None => Ok(()),
    }
}

impl Materializer<'_> {
    /// Materialize one environment and write its deploy record.
    pub fn environment(&self, env: &Environment) -> Result<()> {
        let started_at = Utc::now();
        self.context.manage(&env.dir)?;
        self.context.manage(env.dir.join(DEPLOY_RECORD))?;
        for dir in env.module_dirs() {
            self.context.manage(env.dir.join(dir))?;
        }

        let result = self.populate(env);

        let record_deploy =
            !self.options.dry_run && self.options.module.is_none() && env.dir.is_dir();
        if let (true, Some(control)) = (record_deploy, &env.control) {
            DeployRecord::new(&env.name, &control.commit, started_at, result.is_ok())
                .write(&env.dir)?;
        }
        if result.is_ok() {
            self.context.record(|s| s.environments_synced += 1)?;
        }
        result
    }

    fn populate(&self, env: &Environment) -> Result<()> {
        if let Some(control) = &env.control {
            self.sync_control(env, control)?;
        }
        for (name, spec) in &env.manifest.git_modules {
            if self.options.includes_module(name) {
                self.sync_git_module(env, name, spec)?;
            }
        }
        for (name, spec) in &env.manifest.forge_modules {
            if self.options.includes_module(name) {
                self.sync_forge_module(env, name, spec)?;
            }
        }
        Ok(())
    }

    fn sync_control(&self, env: &Environment, control: &ControlTree) -> Result<()> {
        for path in self.repos.list_tree(&control.mirror, &control.commit)? {
            self.context.manage(env.dir.join(path))?;
        }
        self.context.manage(env.dir.join(COMMIT_MARKER))?;

        if self.options.module.is_some()
            || (!self.options.force && !self.repos.needs_export(&env.dir, &control.commit))
        {
            return Ok(());
        }
        if self.options.dry_run {
            info!("{} would move to {}", env.name, control.commit);
            return self.context.mark_needs_sync();
        }

        clear_outside_module_dirs(&env.dir, &env.module_dirs())?;
        self.repos
            .extract_tree(&control.mirror, &control.commit, &env.dir, &[])?;
        info!("{} now at {}", env.name, control.commit);
        Ok(())
    }

    fn sync_git_module(&self, env: &Environment, name: &str, spec: &GitModuleSpec) -> Result<()> {
        let target = env.dir.join(spec.target_dir(name));
        self.context.manage(&target)?;
        let Some(url) = &spec.git else {
            // :local modules live in the control tree
            return Ok(());
        };
        let tolerant = spec.ignore_unreachable || self.config.ignore_unreachable_modules;

        if self.context.is_unreachable(url)? {
            if tolerant {
                warn!("{}: {} is unreachable, keeping {}", env.name, url, target.display());
                return Ok(());
            }
            return Err(Error::GitUnreachable {
                url: url.clone(),
                tree: "*".to_string(),
                message: "mirror could not be synced".to_string(),
            });
        }

        let mirror = self.repos.module_mirror(url);
        let tree = spec.reference.tree(&env.branch);
        let Some(resolved) = self.repos.resolve_tree(&mirror, &tree, &spec.fallback)? else {
            let missing_link =
                spec.reference == GitReference::Link && env.warn_if_branch_is_missing;
            if tolerant || missing_link || !spec.fallback.is_empty() {
                warn!(
                    "{}: module {} has no tree '{}' in {}, skipping",
                    env.name, name, tree, url
                );
                return Ok(());
            }
            return Err(Error::GitUnreachable {
                url: url.clone(),
                tree,
                message: "no such branch, tag or commit".to_string(),
            });
        };

        if self.options.dry_run {
            if self.options.force || self.repos.needs_export(&target, &resolved.commit) {
                info!("{}: {} would move to {}", env.name, name, resolved.commit);
                self.context.mark_needs_sync()?;
            }
            return Ok(());
        }

        let outcome = self.repos.export_tree(
            &mirror,
            &resolved.commit,
            &target,
            &self.config.module_blacklist,
            self.options.force,
        )?;
        match outcome {
            TreeOutcome::Updated => {
                info!("{}: {} now at {} ({})", env.name, name, resolved.tree, resolved.commit);
                self.context.record(|s| s.modules_updated += 1)
            }
            TreeOutcome::Unchanged => self.context.record(|s| s.modules_unchanged += 1),
        }
    }

    fn sync_forge_module(
        &self,
        env: &Environment,
        name: &str,
        spec: &ForgeModuleSpec,
    ) -> Result<()> {
        let target = env.dir.join(&spec.module_dir).join(name);
        self.context.manage(&target)?;
        let installed = installed_version(&target);

        if spec.version == ForgeVersion::Present && installed.is_some() {
            return self.context.record(|s| s.modules_unchanged += 1);
        }

        let slug = spec.slug();
        let version = self.wanted_version(spec)?;
        if installed.as_deref() == Some(version.as_str()) {
            debug!("{}: {} already at {}", env.name, name, version);
            return self.context.record(|s| s.modules_unchanged += 1);
        }

        let cached = self.forge.version_dir(&slug, &version);
        if !self.forge.is_cached(&slug, &version) {
            return Err(Error::Cache {
                message: format!("{}-{} is missing from {}", slug, version, self.forge.root().display()),
            });
        }
        if self.options.dry_run {
            info!(
                "{}: {} would move from {} to {}",
                env.name,
                name,
                installed.as_deref().unwrap_or("nothing"),
                version
            );
            return self.context.mark_needs_sync();
        }

        replace_tree(
            &cached,
            &target,
            self.config.materialize,
            &self.config.module_blacklist,
        )?;
        info!("{}: {} now at {}", env.name, name, version);
        self.context.record(|s| s.modules_updated += 1)
    }

    fn wanted_version(&self, spec: &ForgeModuleSpec) -> Result<String> {
        if let ForgeVersion::Pinned(version) = &spec.version {
            return Ok(version.clone());
        }
        if let Some(version) = self.context.latest(&spec.slug())? {
            return Ok(version);
        }
        self.resolution
            .forge
            .get(&spec.work_key())
            .map(|release| release.version.clone())
            .ok_or_else(|| Error::Cache {
                message: format!("{} was not resolved in this run", spec.work_key()),
            })
    }
}

/// Version recorded in `{dir}/metadata.json`.
pub fn installed_version(dir: &Path) -> Option<String> {
    let body = fs::read_to_string(dir.join("metadata.json")).ok()?;
    let metadata: serde_json::Value = serde_json::from_str(&body).ok()?;
    metadata
        .get("version")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Remove every top-level entry of `env_dir` except those holding a module
/// directory and the deploy record.
fn clear_outside_module_dirs(env_dir: &Path, module_dirs: &[String]) -> Result<()> {
    let entries = match fs::read_dir(env_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::filesystem(env_dir, e)),
    };
    let kept: Vec<&std::ffi::OsStr> = module_dirs
        .iter()
        .filter_map(|dir| match Path::new(dir).components().next() {
            Some(Component::Normal(first)) => Some(first),
            _ => None,
        })
        .collect();

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name == DEPLOY_RECORD || kept.contains(&name.as_os_str()) {
            continue;
        }
        remove_path(&entry.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::mock::MockForgeApi;
    use crate::cache::ForgeCacheOptions;
    use crate::config::MaterializeMode;
    use crate::manifest::{parse_str, ParseOptions};
    use crate::phases::{aggregate, resolve};
    use crate::repository::mock::MockGitOperations;
    use crate::repository::read_commit_marker;
    use std::time::Duration;
    use tempfile::TempDir;

    const CONTROL: &str = "https://git.example.com/control.git";
    const SITE: &str = "https://git.example.com/site.git";

    struct Harness {
        temp: TempDir,
        git: MockGitOperations,
        api: MockForgeApi,
        repos: RepositoryManager,
        forge: ForgeCache,
        config: Config,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let git = MockGitOperations::default();
            let api = MockForgeApi::default();
            let cache_root = temp.path().join("cache");
            let repos =
                RepositoryManager::with_operations(Box::new(git.clone()), cache_root.clone(), false);
            let forge = ForgeCache::new(
                &cache_root,
                Box::new(api.clone()),
                ForgeCacheOptions {
                    base_url: "https://forge.test".to_string(),
                    cache_ttl: Duration::ZERO,
                    use_cache_fallback: false,
                    check_checksums: false,
                },
            );
            let config = Config {
                cachedir: cache_root,
                materialize: MaterializeMode::Hardlink,
                maxextractworker: 2,
                ..Default::default()
            };
            Self {
                temp,
                git,
                api,
                repos,
                forge,
                config,
            }
        }

        fn environment(&self, branch: &str, commit: &str, puppetfile: &str) -> Environment {
            self.git
                .add_tree(CONTROL, branch, commit, &[("Puppetfile", puppetfile), ("site.pp", "node default {}")]);
            let mirror = self.repos.environment_mirror(CONTROL);
            self.repos
                .sync_mirror(CONTROL, &mirror, &Default::default())
                .unwrap();
            let options = ParseOptions {
                source: "main".to_string(),
                branch: branch.to_string(),
                ..Default::default()
            };
            Environment {
                source: "main".to_string(),
                branch: branch.to_string(),
                name: branch.to_string(),
                dir: self.temp.path().join("envs").join(branch),
                control: Some(ControlTree {
                    mirror,
                    commit: commit.to_string(),
                }),
                manifest: parse_str(puppetfile, Path::new("Puppetfile"), &options).unwrap(),
                warn_if_branch_is_missing: false,
            }
        }

        fn run(&self, envs: &mut [Environment], options: &RunOptions) -> Result<SyncContext> {
            let context = SyncContext::new(false);
            let work = aggregate::execute(envs, &self.config, options, &context)?;
            let resolution =
                resolve::execute(&work, &self.repos, &self.forge, 4, options, &context)?;
            let materializer = Materializer {
                repos: &self.repos,
                forge: &self.forge,
                resolution: &resolution,
                config: &self.config,
                options,
                context: &context,
            };
            execute(envs, &materializer)?;
            Ok(context)
        }
    }

    fn quiet() -> RunOptions {
        RunOptions {
            quiet: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_materializes_control_git_and_forge() {
        let h = Harness::new();
        h.api.add_module("puppetlabs-apt", &["2.3.0"]);
        h.git.add_tree(SITE, "prod", "s1", &[("manifests/init.pp", "class site {}")]);
        let puppetfile = format!(
            "mod 'puppetlabs/apt', '2.3.0'\nmod 'site', :git => '{}', :branch => 'prod'\n",
            SITE
        );
        let mut envs = vec![h.environment("production", "p1", &puppetfile)];

        let context = h.run(&mut envs, &quiet()).unwrap();

        let env = h.temp.path().join("envs/production");
        assert!(env.join("site.pp").exists());
        assert_eq!(read_commit_marker(&env).as_deref(), Some("p1"));
        assert_eq!(
            installed_version(&env.join("modules/apt")).as_deref(),
            Some("2.3.0")
        );
        assert!(env.join("modules/site/manifests/init.pp").exists());
        assert_eq!(read_commit_marker(&env.join("modules/site")).as_deref(), Some("s1"));

        let record = DeployRecord::read(&env).unwrap();
        assert!(record.deploy_success);
        assert_eq!(record.signature, "p1");
        assert!(context.is_managed(&env.join("modules/apt")).unwrap());
        assert_eq!(context.stats().unwrap().modules_updated, 2);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let h = Harness::new();
        h.api.add_module("puppetlabs-apt", &["2.3.0"]);
        h.git.add_tree(SITE, "main", "s1", &[("manifests/init.pp", "")]);
        let puppetfile = format!("mod 'puppetlabs/apt', '2.3.0'\nmod 'site', :git => '{}'\n", SITE);
        let mut envs = vec![h.environment("production", "p1", &puppetfile)];

        h.run(&mut envs, &quiet()).unwrap();
        let context = h.run(&mut envs, &quiet()).unwrap();

        let stats = context.stats().unwrap();
        assert_eq!(stats.modules_updated, 0);
        assert_eq!(stats.modules_unchanged, 2);
        assert_eq!(h.git.archive_calls.lock().unwrap().len(), 2);
        assert_eq!(h.api.downloads.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_two_environments_one_remote_two_branches() {
        let h = Harness::new();
        h.git.add_tree(SITE, "production", "a1", &[("a.pp", "")]);
        h.git.add_tree(SITE, "staging", "b1", &[("b.pp", "")]);
        let puppetfile = format!("mod 'site', :git => '{}', :branch => :control_branch\n", SITE);
        let mut envs = vec![
            h.environment("production", "p1", &puppetfile),
            h.environment("staging", "t1", &puppetfile),
        ];

        h.run(&mut envs, &quiet()).unwrap();

        let sync_calls = h.git.sync_calls.lock().unwrap();
        assert_eq!(sync_calls.iter().filter(|u| *u == SITE).count(), 1);
        let envs_dir = h.temp.path().join("envs");
        assert!(envs_dir.join("production/modules/site/a.pp").exists());
        assert!(!envs_dir.join("production/modules/site/b.pp").exists());
        assert!(envs_dir.join("staging/modules/site/b.pp").exists());
    }

    #[test]
    fn test_forge_version_change_repopulates_module_only() {
        let h = Harness::new();
        h.api.add_module("puppetlabs-apt", &["2.3.0", "2.4.0"]);
        let mut envs = vec![h.environment("production", "p1", "mod 'puppetlabs/apt', '2.3.0'\n")];
        h.run(&mut envs, &quiet()).unwrap();
        let env = h.temp.path().join("envs/production");
        fs::write(env.join("modules/apt/local-change"), "x").unwrap();
        fs::write(env.join("site.pp"), "untouched").unwrap();

        let mut envs = vec![h.environment("production", "p1", "mod 'puppetlabs/apt', '2.4.0'\n")];
        h.run(&mut envs, &quiet()).unwrap();

        assert_eq!(installed_version(&env.join("modules/apt")).as_deref(), Some("2.4.0"));
        assert!(!env.join("modules/apt/local-change").exists());
        assert_eq!(fs::read_to_string(env.join("site.pp")).unwrap(), "untouched");
    }

    #[test]
    fn test_present_keeps_installed_version() {
        let h = Harness::new();
        h.api.add_module("puppetlabs-ntp", &["1.0.0"]);
        let mut envs = vec![h.environment("production", "p1", "mod 'puppetlabs/ntp'\n")];
        h.run(&mut envs, &quiet()).unwrap();

        h.api.add_module("puppetlabs-ntp", &["1.0.0", "2.0.0"]);
        h.run(&mut envs, &quiet()).unwrap();
        let env = h.temp.path().join("envs/production");
        assert_eq!(installed_version(&env.join("modules/ntp")).as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_fallback_and_missing_trees() {
        let h = Harness::new();
        h.git.add_tree(SITE, "main", "m1", &[("m.pp", "")]);
        let puppetfile = format!(
            "mod 'site', :git => '{}', :branch => :control_branch, :default_branch => 'main'\n",
            SITE
        );
        let mut envs = vec![h.environment("feature", "f1", &puppetfile)];
        h.run(&mut envs, &quiet()).unwrap();
        let env = h.temp.path().join("envs/feature");
        assert!(env.join("modules/site/m.pp").exists());

        let strict = format!("mod 'site', :git => '{}', :branch => 'nope'\n", SITE);
        let mut envs = vec![h.environment("other", "o1", &strict)];
        let err = h.run(&mut envs, &quiet()).unwrap_err();
        assert!(matches!(err, Error::GitUnreachable { ref tree, .. } if tree == "nope"));
        let record = DeployRecord::read(&h.temp.path().join("envs/other")).unwrap();
        assert!(!record.deploy_success);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let h = Harness::new();
        h.api.add_module("puppetlabs-apt", &["2.3.0"]);
        let mut envs = vec![h.environment("production", "p1", "mod 'puppetlabs/apt', '2.3.0'\n")];
        let options = RunOptions {
            dry_run: true,
            quiet: true,
            ..Default::default()
        };

        let context = h.run(&mut envs, &options).unwrap();
        assert!(context.needs_sync().unwrap());
        assert!(!h.temp.path().join("envs/production").exists());

        h.run(&mut envs, &quiet()).unwrap();
        let context = h.run(&mut envs, &options).unwrap();
        assert!(!context.needs_sync().unwrap());
    }

    #[test]
    fn test_control_update_keeps_module_dirs() {
        let h = Harness::new();
        h.api.add_module("puppetlabs-apt", &["2.3.0"]);
        let mut envs = vec![h.environment("production", "p1", "mod 'puppetlabs/apt', '2.3.0'\n")];
        h.run(&mut envs, &quiet()).unwrap();
        let env = h.temp.path().join("envs/production");
        fs::write(env.join("stray.txt"), "x").unwrap();

        let mut envs = vec![h.environment("production", "p2", "mod 'puppetlabs/apt', '2.3.0'\n")];
        let context = h.run(&mut envs, &quiet()).unwrap();

        assert!(!env.join("stray.txt").exists());
        assert_eq!(read_commit_marker(&env).as_deref(), Some("p2"));
        assert_eq!(context.stats().unwrap().modules_unchanged, 1);
        assert_eq!(h.api.downloads.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_outside_module_dirs() {
        let temp = TempDir::new().unwrap();
        let env = temp.path();
        for dir in ["modules/a", "site/modules/b", "manifests"] {
            fs::create_dir_all(env.join(dir)).unwrap();
        }
        fs::write(env.join(DEPLOY_RECORD), "{}").unwrap();
        fs::write(env.join("environment.conf"), "").unwrap();

        clear_outside_module_dirs(env, &["modules".to_string(), "site/modules".to_string()])
            .unwrap();
        assert!(env.join("modules/a").exists());
        assert!(env.join("site/modules/b").exists());
        assert!(env.join(DEPLOY_RECORD).exists());
        assert!(!env.join("manifests").exists());
        assert!(!env.join("environment.conf").exists());
    }

    #[test]
    fn test_installed_version() {
        let temp = TempDir::new().unwrap();
        assert_eq!(installed_version(temp.path()), None);
        fs::write(temp.path().join("metadata.json"), r#"{"version":"1.2.3"}"#).unwrap();
        assert_eq!(installed_version(temp.path()).as_deref(), Some("1.2.3"));
    }
}
