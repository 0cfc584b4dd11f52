use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub files: u64,
    pub bytes: u64,
}

/// Copies `src` into `dst`, preserving the directory structure. Symlinks are skipped.
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<CopySummary> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || copy_dir_blocking(&src, &dst)).await?
}

fn copy_dir_blocking(src: &Path, dst: &Path) -> Result<CopySummary> {
    let mut summary = CopySummary::default();
    std::fs::create_dir_all(dst).with_context(|| format!("create directory {}", dst.display()))?;

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target: PathBuf = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("create directory {}", target.display()))?;
        } else if file_type.is_file() {
            let copied = std::fs::copy(entry.path(), &target).with_context(|| {
                format!("copy {} to {}", entry.path().display(), target.display())
            })?;
            summary.files += 1;
            summary.bytes += copied;
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }

    Ok(summary)
}

/// Removes a directory tree, logging instead of failing.
pub async fn remove_dir_best_effort(path: &Path) -> bool {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove directory");
            false
        }
    }
}

/// Deletes a file. `Ok(false)` when it was already gone.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
