//! On-disk tree operations used to place cached modules into environments.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::trace;
use walkdir::WalkDir;

use crate::config::MaterializeMode;
use crate::error::{Error, Result};
use crate::path::is_blacklisted;

/// Populate `target` from `source`, returning the number of files placed.
///
/// Directories are recreated, regular files hardlinked or copied per
/// `mode`, symlinks recreated with the same target. An existing entry that
/// differs is replaced. Paths matching `blacklist` (relative to `source`)
/// are skipped along with everything below them.
pub fn link_tree(
    source: &Path,
    target: &Path,
    mode: MaterializeMode,
    blacklist: &[String],
) -> Result<usize> {
    fs::create_dir_all(target).map_err(|e| Error::filesystem(target, e))?;
    if mode == MaterializeMode::Hardlink {
        check_same_device(source, target)?;
    }

    let mut placed = 0;
    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(source) {
            Ok(relative) => !is_blacklisted(relative, blacklist),
            Err(_) => false,
        });

    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::filesystem(entry.path(), e))?;
        let destination = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if destination
                .symlink_metadata()
                .is_ok_and(|m| !m.file_type().is_dir())
            {
                remove_path(&destination)?;
            }
            fs::create_dir_all(&destination).map_err(|e| Error::filesystem(&destination, e))?;
            continue;
        }

        if destination.symlink_metadata().is_ok() {
            remove_path(&destination)?;
        }

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| Error::filesystem(entry.path(), e))?;
            std::os::unix::fs::symlink(&link, &destination)
                .map_err(|e| Error::filesystem(&destination, e))?;
        } else {
            match mode {
                MaterializeMode::Hardlink => fs::hard_link(entry.path(), &destination)
                    .map_err(|e| Error::filesystem(&destination, e))?,
                MaterializeMode::Copy => {
                    fs::copy(entry.path(), &destination)
                        .map_err(|e| Error::filesystem(&destination, e))?;
                }
            }
        }
        trace!("Placed {}", destination.display());
        placed += 1;
    }
    Ok(placed)
}

/// Replace `target` with a fresh copy of `source`.
pub fn replace_tree(
    source: &Path,
    target: &Path,
    mode: MaterializeMode,
    blacklist: &[String],
) -> Result<usize> {
    if target.symlink_metadata().is_ok() {
        remove_path(target)?;
    }
    link_tree(source, target, mode, blacklist)
}

fn check_same_device(source: &Path, target: &Path) -> Result<()> {
    let source_dev = fs::metadata(source)
        .map_err(|e| Error::filesystem(source, e))?
        .dev();
    let target_dev = fs::metadata(target)
        .map_err(|e| Error::filesystem(target, e))?
        .dev();
    if source_dev != target_dev {
        return Err(Error::DeviceMismatch {
            cache: source.to_path_buf(),
            target: target.to_path_buf(),
        });
    }
    Ok(())
}

/// Remove a file, symlink or directory tree.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = path
        .symlink_metadata()
        .map_err(|e| Error::filesystem(path, e))?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .map_err(|e| Error::filesystem(path, e))
}
