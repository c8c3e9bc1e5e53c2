use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Copies `source_root` into `destination_root`, replacing whatever was
/// there. Symlinks are recreated rather than followed.
pub fn copy_dir_recursive(source_root: &Path, destination_root: &Path) -> Result<()> {
    if !source_root.is_dir() {
        anyhow::bail!(
            "source location is not a directory: {}",
            source_root.display()
        );
    }

    remove_path_if_exists(destination_root)?;
    fs::create_dir_all(destination_root).with_context(|| {
        format!(
            "failed creating destination directory {}",
            destination_root.display()
        )
    })?;

    let mut queue: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
    queue.push_back((source_root.to_path_buf(), destination_root.to_path_buf()));

    while let Some((from_dir, to_dir)) = queue.pop_front() {
        for entry in fs::read_dir(&from_dir)
            .with_context(|| format!("failed reading source directory {}", from_dir.display()))?
        {
            let entry = entry
                .with_context(|| format!("failed reading entry in {}", from_dir.display()))?;
            let from_path = entry.path();
            let to_path = to_dir.join(entry.file_name());
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed reading file type of {}", from_path.display()))?;
            if file_type.is_symlink() {
                copy_symlink(&from_path, &to_path)?;
            } else if file_type.is_dir() {
                fs::create_dir_all(&to_path)
                    .with_context(|| format!("failed creating directory {}", to_path.display()))?;
                queue.push_back((from_path, to_path));
            } else if file_type.is_file() {
                fs::copy(&from_path, &to_path).with_context(|| {
                    format!(
                        "failed copying file from {} to {}",
                        from_path.display(),
                        to_path.display()
                    )
                })?;
            }
        }
    }

    Ok(())
}

/// Copies a single file or a whole directory tree.
pub(crate) fn copy_path(source: &Path, destination: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(source)
        .with_context(|| format!("failed reading metadata of {}", source.display()))?;
    if metadata.file_type().is_symlink() {
        remove_path_if_exists(destination)?;
        return copy_symlink(source, destination);
    }
    if metadata.is_dir() {
        return copy_dir_recursive(source, destination);
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating directory {}", parent.display()))?;
    }
    fs::copy(source, destination).with_context(|| {
        format!(
            "failed copying file from {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    Ok(())
}

pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()));
        }
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed removing directory {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("failed removing {}", path.display()))
    }
}

/// Sorted top-level entry names of `dir`.
pub(crate) fn top_level_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed reading directory {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed reading entry in {}", dir.display()))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(unix)]
fn copy_symlink(source: &Path, destination: &Path) -> Result<()> {
    let target = fs::read_link(source)
        .with_context(|| format!("failed reading symlink {}", source.display()))?;
    std::os::unix::fs::symlink(&target, destination).with_context(|| {
        format!(
            "failed creating symlink {} -> {}",
            destination.display(),
            target.display()
        )
    })
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, destination: &Path) -> Result<()> {
    if source.is_dir() {
        copy_dir_recursive(source, destination)
    } else {
        fs::copy(source, destination)
            .map(|_| ())
            .with_context(|| format!("failed copying {}", source.display()))
    }
}
