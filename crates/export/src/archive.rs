use std::fs::{self, File};
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

/// Packs every file under `src_dir` into a zstd-compressed tar at `dest`, using the
/// highest compression level, and returns the archive size in bytes.
///
/// The stream is written to `<dest>.partial` and renamed into place only once the
/// encoder has finished, so a failed run never leaves a truncated archive at `dest`.
pub async fn write_archive(src_dir: &Path, dest: &Path) -> Result<u64> {
    let src_dir = src_dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_archive_blocking(&src_dir, &dest)).await?
}

fn write_archive_blocking(src_dir: &Path, dest: &Path) -> Result<u64> {
    let partial = partial_path(dest);
    if let Err(e) = pack(src_dir, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    fs::rename(&partial, dest)
        .with_context(|| format!("move archive into place at {}", dest.display()))?;
    let size = fs::metadata(dest)
        .with_context(|| format!("stat archive {}", dest.display()))?
        .len();
    debug!(archive = %dest.display(), size, "archive written");
    Ok(size)
}

fn pack(src_dir: &Path, out: &Path) -> Result<()> {
    let level = *zstd::compression_level_range().end();
    let file = File::create(out).with_context(|| format!("create archive {}", out.display()))?;
    let encoder = zstd::Encoder::new(BufWriter::new(file), level).context("init zstd encoder")?;
    let mut builder = tar::Builder::new(encoder);

    for entry in WalkDir::new(src_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", src_dir.display()))?;
        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(src_dir)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        // tar entries always use '/' separators
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if file_type.is_dir() {
            // kept so empty directories survive a restore
            builder
                .append_dir(&name, entry.path())
                .with_context(|| format!("add directory {name} to archive"))?;
        } else {
            builder
                .append_path_with_name(entry.path(), &name)
                .with_context(|| format!("add {name} to archive"))?;
        }
    }

    let encoder = builder.into_inner().context("finish tar stream")?;
    let writer = encoder.finish().context("finish zstd stream")?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("flush archive")?;
    file.sync_all().context("sync archive")?;
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Unpacks an archive into `dest`, creating it if needed.
pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        fs::create_dir_all(&dest).with_context(|| format!("create {}", dest.display()))?;
        let mut tar = open_archive(&archive)?;
        tar.unpack(&dest)
            .with_context(|| format!("unpack {} into {}", archive.display(), dest.display()))
    })
    .await?
}

/// File entry names in archive order; directory entries are left out. Reading every
/// entry also validates the stream.
pub async fn list_entries(archive: &Path) -> Result<Vec<String>> {
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let mut tar = open_archive(&archive)?;
        let mut names = Vec::new();
        for entry in tar.entries().context("read archive entries")? {
            let mut entry = entry.context("read archive entry")?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            names.push(entry.path()?.to_string_lossy().into_owned());
            std::io::copy(&mut entry, &mut std::io::sink()).context("read archive entry body")?;
        }
        Ok(names)
    })
    .await?
}

/// Contents of a single entry, if present.
pub async fn read_entry(archive: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let archive = archive.to_path_buf();
    let name = name.to_owned();
    tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
        let mut tar = open_archive(&archive)?;
        for entry in tar.entries().context("read archive entries")? {
            let mut entry = entry.context("read archive entry")?;
            if entry.path()?.to_string_lossy() == name {
                let mut buf = Vec::new();
                entry
                    .read_to_end(&mut buf)
                    .with_context(|| format!("read {name} from archive"))?;
                return Ok(Some(buf));
            }
        }
        Ok(None)
    })
    .await?
}

fn open_archive(path: &Path) -> Result<tar::Archive<zstd::Decoder<'static, std::io::BufReader<File>>>> {
    let file = File::open(path).with_context(|| format!("open archive {}", path.display()))?;
    let decoder = zstd::Decoder::new(file).context("init zstd decoder")?;
    Ok(tar::Archive::new(decoder))
}
