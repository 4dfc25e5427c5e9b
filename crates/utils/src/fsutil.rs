//! Filesystem copy helpers shared by the hook and the image migrator.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::{Context, Result};

/// Copy a single non-directory path.  If `src` is a symbolic link,
/// the link itself is recreated at `dest` rather than its target.
/// An existing non-directory at `dest` is replaced.
pub fn copy_preserving_symlink(src: &Path, dest: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).with_context(|| format!("Querying {}", src.display()))?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src).with_context(|| format!("Reading {}", src.display()))?;
        match fs::symlink_metadata(dest) {
            Ok(m) if !m.is_dir() => fs::remove_file(dest)?,
            Ok(_) => anyhow::bail!("Refusing to replace directory {} with a symlink", dest.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        symlink(&target, dest)
            .with_context(|| format!("Creating symlink {}", dest.display()))?;
    } else {
        fs::copy(src, dest)
            .with_context(|| format!("Copying {} to {}", src.display(), dest.display()))?;
    }
    Ok(())
}

/// Recursively copy the directory `src` to `dest`, merging into any
/// existing tree at `dest`.  Symbolic links are copied as links and
/// never followed.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Walking {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("Walked path outside of source")?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Creating {}", target.display()))?;
        } else {
            copy_preserving_symlink(entry.path(), &target)?;
        }
    }
    Ok(())
}
