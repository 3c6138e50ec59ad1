//! Orchestrator for complete runs
//!
//! This module coordinates all phases to provide a clean API for the two
//! kinds of run: [`run`] deploys every configured source, [`install`] deploys
//! a single manifest into a module directory with no control repository.

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};

use super::discovery::Discovery;
use super::materialize::Materializer;
use super::purge::Purger;
use super::resolve::Resolution;
use super::{aggregate, discovery, materialize, resolve, Environment, RunOptions};
use crate::cache::{ForgeCache, ForgeCacheOptions};
use crate::config::Config;
use crate::context::{SyncContext, SyncStats};
use crate::error::Result;
use crate::forge::{ForgeApi, HttpForgeApi};
use crate::manifest::{parse_file, ParseOptions};
use crate::repository::{GitOperations, RepositoryManager};

/// The Git and Forge backends of a run.
pub struct Engine {
    pub repos: RepositoryManager,
    pub forge: ForgeCache,
}

impl Engine {
    /// Engine using the system `git` and the HTTP registry client.
    pub fn new(config: &Config) -> Self {
        let repos = RepositoryManager::new(config.cachedir.clone(), config.retry_git_commands);
        let forge = ForgeCache::new(
            &config.cachedir,
            Box::new(HttpForgeApi::new(config.timeout())),
            forge_options(config),
        );
        Self { repos, forge }
    }

    /// Engine with custom backends.
    pub fn with_backends(
        config: &Config,
        git_ops: Box<dyn GitOperations>,
        forge_api: Box<dyn ForgeApi>,
    ) -> Self {
        Self {
            repos: RepositoryManager::with_operations(
                git_ops,
                config.cachedir.clone(),
                config.retry_git_commands,
            ),
            forge: ForgeCache::new(&config.cachedir, forge_api, forge_options(config)),
        }
    }
}

fn forge_options(config: &Config) -> ForgeCacheOptions {
    ForgeCacheOptions {
        base_url: config.forge.baseurl.clone(),
        cache_ttl: config.forge_cache_ttl(),
        use_cache_fallback: config.use_cache_fallback,
        check_checksums: config.check_forge_checksums,
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub stats: SyncStats,
    /// Environment names in deployment order.
    pub environments: Vec<String>,
    pub deprecations: Vec<String>,
    /// Dry run only: something would have changed.
    pub needs_sync: bool,
}

/// Deploy every configured source.
pub fn run(config: &Config, options: &RunOptions, engine: &Engine) -> Result<SyncReport> {
    let started = Instant::now();
    let context = SyncContext::new(options.verbose);

    // Phase 1: Discovery
    let Discovery {
        mut environments,
        synced_sources,
    } = discovery::execute(config, &engine.repos, options, &context)?;

    deploy(
        &mut environments,
        &synced_sources,
        config,
        options,
        engine,
        &context,
    )?;

    let report = finish(&environments, &context)?;
    info!(
        "Synced {} environments in {:.1}s",
        report.stats.environments_synced,
        started.elapsed().as_secs_f64()
    );
    Ok(report)
}

/// What [`install`] deploys.
#[derive(Debug, Clone)]
pub struct InstallTarget {
    pub puppetfile: PathBuf,
    /// Replaces every `moduledir` directive; relative to the manifest's
    /// directory.
    pub module_dir: Option<PathBuf>,
    /// Branch `:control_branch` references resolve to.
    pub control_branch: String,
}

/// Deploy the modules of one manifest next to it.
pub fn install(
    target: &InstallTarget,
    config: &Config,
    options: &RunOptions,
    engine: &Engine,
) -> Result<SyncReport> {
    let context = SyncContext::new(options.verbose);
    let base = target
        .puppetfile
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let parse_options = ParseOptions {
        source: "puppetfile".to_string(),
        branch: target.control_branch.clone(),
        module_dir_override: target
            .module_dir
            .as_ref()
            .map(|d| d.to_string_lossy().into_owned()),
        ..Default::default()
    };
    let manifest = parse_file(&target.puppetfile, &parse_options)?;

    let mut environments = vec![Environment {
        source: "puppetfile".to_string(),
        branch: target.control_branch.clone(),
        name: base.display().to_string(),
        dir: base,
        control: None,
        manifest,
        warn_if_branch_is_missing: false,
    }];

    deploy(&mut environments, &[], config, options, engine, &context)?;
    finish(&environments, &context)
}

/// Phases 2 to 5.
fn deploy(
    environments: &mut [Environment],
    synced_sources: &[String],
    config: &Config,
    options: &RunOptions,
    engine: &Engine,
    context: &SyncContext,
) -> Result<()> {
    // Phase 2: Aggregation
    let work = aggregate::execute(environments, config, options, context)?;

    // Phase 3: Resolution
    let resolution: Resolution = resolve::execute(
        &work,
        &engine.repos,
        &engine.forge,
        config.maxworker,
        options,
        context,
    )?;

    // Phase 4: Materialization
    let materializer = Materializer {
        repos: &engine.repos,
        forge: &engine.forge,
        resolution: &resolution,
        config,
        options,
        context,
    };
    materialize::execute(environments, &materializer)?;

    // Phase 5: Purging
    Purger {
        config,
        options,
        context,
    }
    .execute(environments, synced_sources)?;
    Ok(())
}

fn finish(environments: &[Environment], context: &SyncContext) -> Result<SyncReport> {
    let deprecations = context.take_deprecations()?;
    for message in &deprecations {
        warn!("{}", message);
    }
    Ok(SyncReport {
        stats: context.stats()?,
        environments: environments.iter().map(|e| e.name.clone()).collect(),
        deprecations,
        needs_sync: context.needs_sync()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::mock::MockForgeApi;
    use crate::config::{InvalidBranches, PrefixSetting, PurgeLevel, SourceConfig};
    use crate::repository::mock::MockGitOperations;
    use std::fs;
    use tempfile::TempDir;

    const CONTROL: &str = "https://git.example.com/control.git";

    fn config(temp: &TempDir) -> Config {
        let mut config = Config {
            cachedir: temp.path().join("cache"),
            purge_levels: vec![PurgeLevel::Deployment, PurgeLevel::Puppetfile],
            ..Default::default()
        };
        config.sources.insert(
            "main".to_string(),
            SourceConfig {
                remote: CONTROL.to_string(),
                basedir: temp.path().join("envs"),
                prefix: PrefixSetting::default(),
                private_key: None,
                force_forge_versions: false,
                warn_if_branch_is_missing: false,
                exit_if_unreachable: false,
                filter_regex: None,
                invalid_branches: InvalidBranches::Error,
            },
        );
        config
    }

    fn quiet() -> RunOptions {
        RunOptions {
            quiet: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_run_and_purge() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let git = MockGitOperations::default();
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-apt", &["2.3.0"]);
        api.add_module("puppetlabs-old", &["1.0.0"]);
        api.deprecated
            .lock()
            .unwrap()
            .insert("puppetlabs-old".to_string(), "2022-01-01".to_string());
        git.add_tree(
            CONTROL,
            "production",
            "p1",
            &[("Puppetfile", "mod 'puppetlabs/apt', '2.3.0'\nmod 'puppetlabs/old', :latest\n")],
        );
        let engine = Engine::with_backends(&config, Box::new(git.clone()), Box::new(api.clone()));

        let envs = temp.path().join("envs");
        fs::create_dir_all(envs.join("deleted_branch")).unwrap();
        fs::create_dir_all(envs.join("production/modules/leftover")).unwrap();

        let report = run(&config, &quiet(), &engine).unwrap();

        assert_eq!(report.environments, vec!["production"]);
        assert_eq!(report.stats.environments_synced, 1);
        assert_eq!(report.deprecations.len(), 1);
        assert!(!report.needs_sync);
        assert!(envs.join("production/modules/apt/metadata.json").exists());
        assert!(envs.join("production/modules/old/metadata.json").exists());
        assert!(!envs.join("production/modules/leftover").exists());
        assert!(!envs.join("deleted_branch").exists());
        assert_eq!(report.stats.paths_purged, 2);

        let dry = RunOptions {
            dry_run: true,
            quiet: true,
            ..Default::default()
        };
        let report = run(&config, &dry, &engine).unwrap();
        assert!(!report.needs_sync);

        git.add_tree(
            CONTROL,
            "production",
            "p2",
            &[("Puppetfile", "mod 'puppetlabs/apt', '2.3.0'\n")],
        );
        let report = run(&config, &dry, &engine).unwrap();
        assert!(report.needs_sync);
        assert!(envs.join("production/modules/old").exists());
    }

    #[test]
    fn test_environment_purge_keeps_install_path_modules() {
        const SITE: &str = "https://git.example.com/site.git";
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.purge_levels = vec![PurgeLevel::Environment];
        let git = MockGitOperations::default();
        git.add_tree(
            CONTROL,
            "production",
            "p1",
            &[
                (
                    "Puppetfile",
                    "mod 'site', :git => 'https://git.example.com/site.git', :branch => 'main', :install_path => 'external'\n",
                ),
                ("manifests/site.pp", "node default {}\n"),
            ],
        );
        git.add_tree(SITE, "main", "s1", &[("manifests/init.pp", "class site {}\n")]);
        let engine = Engine::with_backends(
            &config,
            Box::new(git),
            Box::new(MockForgeApi::default()),
        );
        let env = temp.path().join("envs/production");

        run(&config, &quiet(), &engine).unwrap();
        assert!(env.join("external/site/manifests/init.pp").exists());

        fs::write(env.join("stray.txt"), "x").unwrap();
        let report = run(&config, &quiet(), &engine).unwrap();

        assert!(env.join("external/site/manifests/init.pp").exists());
        assert!(env.join("manifests/site.pp").exists());
        assert!(!env.join("stray.txt").exists());
        assert_eq!(report.stats.paths_purged, 1);
    }

    #[test]
    fn test_install_into_module_dir() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            cachedir: temp.path().join("cache"),
            ..Default::default()
        };
        let api = MockForgeApi::default();
        api.add_module("puppetlabs-apt", &["2.3.0"]);
        let engine = Engine::with_backends(
            &config,
            Box::new(MockGitOperations::default()),
            Box::new(api),
        );

        let project = temp.path().join("project");
        fs::create_dir_all(project.join("vendor/stale")).unwrap();
        let puppetfile = project.join("Puppetfile");
        fs::write(&puppetfile, "mod 'puppetlabs/apt', '2.3.0'\n").unwrap();

        let target = InstallTarget {
            puppetfile,
            module_dir: Some(PathBuf::from("vendor")),
            control_branch: "main".to_string(),
        };
        let report = install(&target, &config, &quiet(), &engine).unwrap();

        assert_eq!(report.stats.modules_updated, 1);
        assert!(project.join("vendor/apt/metadata.json").exists());
        assert!(!project.join("vendor/stale").exists());
        assert!(!project.join(crate::deploy::DEPLOY_RECORD).exists());
    }
}
