//! Shared test utilities for integration and E2E tests.
//!
//! Add `mod common;` to a test file, then use the helpers:
//!
//! ```rust,ignore
//! mod common;
//! use common::prelude::*;
//!
//! #[test]
//! fn test_example() {
//!     let fixture = TestFixture::new().with_file("Puppetfile", manifests::FORGE_ONLY);
//!     fixture.command().arg("validate").assert().success();
//! }
//! ```

use assert_fs::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Re-export commonly used test dependencies for convenience.
pub mod prelude {
    #[allow(unused_imports)]
    pub use assert_cmd::cargo::cargo_bin_cmd;
    pub use assert_fs::prelude::*;
    #[allow(unused_imports)]
    pub use assert_fs::TempDir;
    pub use predicates::prelude::*;

    #[allow(unused_imports)]
    pub use super::manifests;
    #[allow(unused_imports)]
    pub use super::{git_available, GitRemote};
    pub use super::TestFixture;
}

/// Puppetfile snippets for testing.
#[allow(dead_code)]
pub mod manifests {
    /// Forge modules only.
    pub const FORGE_ONLY: &str = r#"forge 'https://forgeapi.puppet.com'

mod 'puppetlabs/stdlib', '9.4.1'
mod 'puppetlabs-apt', :latest
"#;

    /// Git modules with multi-line attributes.
    pub const GIT_MODULES: &str = r#"moduledir 'modules'

mod 'site',
  :git    => 'https://git.example.com/site.git',
  :branch => :control_branch,
  :default_branch => 'main'

mod 'profile', :local => true
"#;

    /// A line no declaration matches.
    pub const UNKNOWN_LINE: &str = r#"mod 'puppetlabs/stdlib', '9.4.1'
this line means nothing
"#;

    /// A trailing comma with no attribute after it.
    pub const DANGLING_COMMA: &str = r#"mod 'site',
  :git => 'https://git.example.com/site.git',
"#;
}

/// Whether a usable `git` binary is installed.
///
/// Tests that need real repositories return early when it is not.
#[allow(dead_code)]
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// A working repository used as a `file://` remote.
#[allow(dead_code)]
pub struct GitRemote {
    dir: PathBuf,
}

#[allow(dead_code)]
impl GitRemote {
    /// Create a repository at `dir` with one commit on `main`.
    pub fn init(dir: &Path, files: &[(&str, &str)]) -> Self {
        std::fs::create_dir_all(dir).expect("Failed to create remote directory");
        let remote = Self {
            dir: dir.to_path_buf(),
        };
        remote.git(&["init", "--quiet", "--initial-branch=main"]);
        remote.commit(files, "initial");
        remote
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.dir.display())
    }

    /// Write `files` and commit them on the current branch.
    pub fn commit(&self, files: &[(&str, &str)], message: &str) {
        for (path, content) in files {
            let full = self.dir.join(path);
            std::fs::create_dir_all(full.parent().expect("file has a parent"))
                .expect("Failed to create directory");
            std::fs::write(full, content).expect("Failed to write file");
        }
        self.git(&["add", "--all"]);
        self.git(&["commit", "--quiet", "--allow-empty", "-m", message]);
    }

    /// Create `branch` from the current branch and switch to it.
    pub fn branch(&self, branch: &str) {
        self.git(&["checkout", "--quiet", "-b", branch]);
    }

    pub fn checkout(&self, branch: &str) {
        self.git(&["checkout", "--quiet", branch]);
    }

    pub fn delete_branch(&self, branch: &str) {
        self.git(&["branch", "--quiet", "-D", branch]);
    }

    pub fn git(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .status()
            .expect("Failed to run git");
        assert!(status.success(), "git {:?} failed", args);
    }
}

/// A test fixture that provides a temporary directory with optional files.
pub struct TestFixture {
    temp_dir: assert_fs::TempDir,
}

impl TestFixture {
    /// Create a new test fixture with an empty temporary directory.
    pub fn new() -> Self {
        Self {
            temp_dir: assert_fs::TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Add a `modsync.yaml` configuration file with the given content.
    #[allow(dead_code)]
    pub fn with_config(self, content: &str) -> Self {
        self.with_file("modsync.yaml", content)
    }

    /// Add a file with the given path and content.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.temp_dir
            .child(path)
            .write_str(content)
            .expect("Failed to write file");
        self
    }

    /// Get the path to the temporary directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Get the path to the config file.
    #[allow(dead_code)]
    pub fn config_path(&self) -> PathBuf {
        self.temp_dir.path().join("modsync.yaml")
    }

    /// Create a child path in the temp directory.
    #[allow(dead_code)]
    pub fn child(&self, path: &str) -> assert_fs::fixture::ChildPath {
        self.temp_dir.child(path)
    }

    /// Create a command configured to run in this fixture's directory, with
    /// the environment cleared of variables that change its behaviour.
    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modsync");
        cmd.current_dir(self.path())
            .env_remove("MODSYNC_CONFIG")
            .env_remove("MODSYNC_CACHE")
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1");
        cmd
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_creates_temp_dir() {
        let fixture = TestFixture::new();
        assert!(fixture.path().exists());
    }

    #[test]
    fn test_fixture_with_config() {
        let fixture = TestFixture::new().with_config("cachedir: /tmp/cache\n");
        assert!(fixture.config_path().exists());
    }

    #[test]
    fn test_fixture_with_nested_file() {
        let fixture = TestFixture::new().with_file("project/Puppetfile", manifests::FORGE_ONLY);
        assert!(fixture.path().join("project/Puppetfile").exists());
    }
}
