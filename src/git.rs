//! Thin wrappers around the system `git` binary.
//!
//! Every remote is kept as a bare mirror; trees are exported from the mirror
//! with `git archive` and never checked out. Running the system command means
//! credential helpers, `~/.ssh/config` and `~/.gitconfig` all apply as they
//! would for the operator.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use log::{debug, warn};

use crate::error::{Error, Result};

/// Credentials for one Git invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitAuth {
    pub private_key: Option<PathBuf>,
    /// Load the key through `ssh-agent` even for public-looking remotes.
    pub use_ssh_agent: bool,
}

impl GitAuth {
    pub fn with_key(private_key: Option<PathBuf>) -> Self {
        Self {
            private_key,
            use_ssh_agent: false,
        }
    }
}

/// Whether `url` can be fetched without credentials (http(s), git:// or a
/// local path).
pub fn is_public_remote(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https" | "git" | "file"),
        // scp-like `git@host:path` does not parse as a URL
        Err(_) => !url.contains('@') && !url.contains(':'),
    }
}

fn needs_agent(url: &str, auth: &GitAuth) -> bool {
    auth.private_key.is_some() && (auth.use_ssh_agent || !is_public_remote(url))
}

/// Quote `arg` for a POSIX shell.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Build the git invocation, wrapped by `ssh-agent` when the remote needs the
/// key loaded for the duration of this one command.
fn git_command(args: &[OsString], url: &str, auth: &GitAuth) -> Command {
    match (&auth.private_key, needs_agent(url, auth)) {
        (Some(key), true) => {
            let git = args
                .iter()
                .map(|a| shell_quote(&a.to_string_lossy()))
                .collect::<Vec<_>>()
                .join(" ");
            let script = format!(
                "ssh-add {} >/dev/null 2>&1 && exec git {}",
                shell_quote(&key.to_string_lossy()),
                git
            );
            let mut command = Command::new("ssh-agent");
            command.args(["sh", "-c"]).arg(script);
            command
        }
        _ => {
            let mut command = Command::new("git");
            command.args(args);
            command
        }
    }
}

fn describe(args: &[OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn auth_hint(stderr: &str) -> String {
    if stderr.contains("Authentication failed")
        || stderr.contains("Permission denied")
        || stderr.contains("Could not read from remote repository")
    {
        format!(
            "{}\nAuthentication failed. Make sure the configured private_key has access \
             to the repository.",
            stderr.trim()
        )
    } else {
        stderr.trim().to_string()
    }
}

fn run(args: Vec<OsString>, url: &str, auth: &GitAuth) -> Result<Output> {
    let display = describe(&args);
    debug!("Running git {}", display);
    let output = git_command(&args, url, auth)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::GitCommand {
            command: display.clone(),
            url: url.to_string(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::GitCommand {
            command: display,
            url: url.to_string(),
            stderr: auth_hint(&String::from_utf8_lossy(&output.stderr)),
        });
    }
    Ok(output)
}

fn git_dir_args(mirror: &Path, rest: &[&str]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--git-dir".into(), mirror.as_os_str().to_owned()];
    args.extend(rest.iter().map(OsString::from));
    args
}

/// Whether `path` looks like a bare repository.
pub fn is_mirror(path: &Path) -> bool {
    path.join("HEAD").is_file() && path.join("objects").is_dir()
}

/// Create a bare mirror of `url` at `mirror`.
pub fn clone_mirror(url: &str, mirror: &Path, auth: &GitAuth) -> Result<()> {
    if let Some(parent) = mirror.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;
    }
    let args: Vec<OsString> = vec![
        "clone".into(),
        "--mirror".into(),
        url.into(),
        mirror.as_os_str().to_owned(),
    ];
    run(args, url, auth).map(|_| ())
}

/// Fetch all refs of an existing mirror, pruning deleted ones.
pub fn update_mirror(url: &str, mirror: &Path, auth: &GitAuth) -> Result<()> {
    run(git_dir_args(mirror, &["remote", "update", "--prune"]), url, auth).map(|_| ())
}

/// Bring the mirror of `url` up to date, cloning it if absent.
///
/// With `retry`, a failed update deletes the mirror and clones it once more.
/// Failure surfaces as [`Error::GitUnreachable`].
pub fn sync_mirror(url: &str, mirror: &Path, auth: &GitAuth, retry: bool) -> Result<()> {
    let unreachable = |e: Error| Error::GitUnreachable {
        url: url.to_string(),
        tree: "*".to_string(),
        message: e.to_string(),
    };

    if !is_mirror(mirror) {
        if mirror.exists() {
            fs::remove_dir_all(mirror).map_err(|e| Error::filesystem(mirror, e))?;
        }
        return clone_mirror(url, mirror, auth).map_err(unreachable);
    }

    match update_mirror(url, mirror, auth) {
        Ok(()) => Ok(()),
        Err(e) if retry => {
            warn!("Updating {} failed, re-cloning: {}", url, e);
            fs::remove_dir_all(mirror).map_err(|e| Error::filesystem(mirror, e))?;
            clone_mirror(url, mirror, auth).map_err(unreachable)
        }
        Err(e) => Err(unreachable(e)),
    }
}

/// Resolve `tree` to a commit hash. `Ok(None)` if the mirror has no such
/// tree.
pub fn resolve_commit(mirror: &Path, tree: &str) -> Result<Option<String>> {
    let spec = format!("{}^{{commit}}", tree);
    let args = git_dir_args(mirror, &["rev-parse", "--verify", "--quiet", &spec]);
    let display = describe(&args);
    let output = Command::new("git")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::GitCommand {
            command: display,
            url: mirror.display().to_string(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Ok(None);
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(if commit.is_empty() { None } else { Some(commit) })
}

/// Stream `git archive --format=tar <commit>` into `consume`.
///
/// Whatever `consume` leaves unread is drained before waiting on git so the
/// child never blocks on a full pipe.
pub fn archive(
    mirror: &Path,
    commit: &str,
    consume: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
) -> Result<()> {
    let args = git_dir_args(mirror, &["archive", "--format=tar", commit]);
    let display = describe(&args);
    let command_error = |stderr: String| Error::GitCommand {
        command: display.clone(),
        url: mirror.display().to_string(),
        stderr,
    };

    let mut child = Command::new("git")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| command_error(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| command_error("stdout not captured".to_string()))?;
    let consumed = consume(&mut stdout);
    io::copy(&mut stdout, &mut io::sink())?;
    drop(stdout);

    let output = child.wait_with_output()?;
    consumed?;
    if !output.status.success() {
        return Err(command_error(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Branch names (`refs/heads/*`) of a mirror.
pub fn list_branches(mirror: &Path) -> Result<Vec<String>> {
    let args = git_dir_args(
        mirror,
        &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
    );
    let output = run(args, &mirror.display().to_string(), &GitAuth::default())?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Every path (files and directories) in the tree of `commit`.
pub fn list_tree(mirror: &Path, commit: &str) -> Result<Vec<String>> {
    let args = git_dir_args(mirror, &["ls-tree", "-r", "-t", "--name-only", commit]);
    let output = run(args, &mirror.display().to_string(), &GitAuth::default())?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}

/// Contents of `path` at `commit`, or `None` when the file does not exist.
pub fn read_file(mirror: &Path, commit: &str, path: &str) -> Result<Option<String>> {
    let object = format!("{}:{}", commit, path);
    let args = git_dir_args(mirror, &["cat-file", "-e", &object]);
    let exists = Command::new("git")
        .args(&args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| Error::GitCommand {
            command: describe(&args),
            url: mirror.display().to_string(),
            stderr: e.to_string(),
        })?
        .success();
    if !exists {
        return Ok(None);
    }

    let args = git_dir_args(mirror, &["cat-file", "blob", &object]);
    let output = run(args, &mirror.display().to_string(), &GitAuth::default())?;
    Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
}
