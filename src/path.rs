//! Path manipulation utilities for modsync

use std::path::{Component, Path};

use crate::error::{Error, Result};
use glob::Pattern;

/// Match a path against a glob pattern
pub fn glob_match(pattern: &str, path: &str) -> Result<bool> {
    let pattern = Pattern::new(pattern).map_err(Error::Glob)?;
    Ok(pattern.matches(path))
}

/// Encode a remote URL into a single filesystem-safe directory name
///
/// Used for the bare mirror directories under `{cache}/modules` and
/// `{cache}/environments`.
pub fn encode_url_path(url: &str) -> String {
    url.chars()
        .map(|c| match c {
            '/' => '-',
            '\\' => '-',
            ':' => '_',
            '*' => '_',
            '?' => '_',
            '"' => '_',
            '<' => '_',
            '>' => '_',
            '|' => '_',
            c if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect()
}

/// Whether `relative` (a path relative to a module root) is excluded by any
/// blacklist entry.
///
/// An entry excludes a path when it is a component-wise prefix of it
/// (`spec/fixtures` excludes `spec/fixtures/a.pp`) or when it is a glob that
/// matches the whole relative path. Leading `/` and `./` on entries are
/// ignored.
pub fn is_blacklisted(relative: &Path, blacklist: &[String]) -> bool {
    if blacklist.is_empty() {
        return false;
    }
    let relative_str = relative.to_string_lossy();
    blacklist.iter().any(|entry| {
        let entry = entry.trim_start_matches("./").trim_start_matches('/');
        if entry.is_empty() {
            return false;
        }
        if relative.starts_with(entry) {
            return true;
        }
        Pattern::new(entry)
            .map(|p| p.matches(&relative_str))
            .unwrap_or(false)
    })
}

/// Whether a branch name can be used as an environment directory name
/// verbatim.
pub fn is_valid_environment_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn normalize_environment_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Whether a path taken from an archive or a manifest stays inside the
/// directory it is joined onto.
pub fn is_contained(relative: &Path) -> bool {
    !relative.as_os_str().is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
