use anyhow::{Context, Result, bail};
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWrite, BufWriter};
use tokio::task;
use tracing::debug;
use walkdir::WalkDir;

use crate::zip::{FileHeader, ZipWriter};

/// Bytes read from a source file per write into the archive
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Write `source` and everything below it into a new archive at `archive`.
///
/// Entry names are relative to the parent of `source`, so the source
/// directory itself becomes the top-level entry.
pub async fn create(archive: &Path, source: &Path) -> Result<()> {
    let file = fs::File::create(archive)
        .await
        .with_context(|| format!("create {}", archive.display()))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));

    let root = source_root(source).await?;
    let base = root.parent().unwrap_or(root.as_path()).to_path_buf();
    debug!(root = %root.display(), base = %base.display(), "walking source tree");

    // walkdir is synchronous; list the tree off the runtime, then archive in order
    let walk_root = root.clone();
    let items = task::spawn_blocking(move || {
        WalkDir::new(walk_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .collect::<Vec<_>>()
    })
    .await?;

    for item in items {
        let item = item?;
        let rel = item.path().strip_prefix(&base)?;
        let Some(mut name) = archive_name(rel)? else {
            continue;
        };

        let is_dir = item.file_type().is_dir();
        // Links are archived as the file they point to
        let metadata = fs::metadata(item.path())
            .await
            .with_context(|| format!("stat {}", item.path().display()))?;
        let mode = file_mode(&metadata, is_dir);
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if is_dir {
            name.push('/');
            println!("{}", name);
            writer
                .create_entry(FileHeader::directory(name, mode, modified))
                .await?;
            continue;
        }

        println!("{}", name);
        writer
            .create_entry(FileHeader::file(name, mode, modified))
            .await?;
        copy_into(&mut writer, item.path()).await?;
    }

    writer.finish().await?;
    Ok(())
}

/// Absolute path of the source with its last component kept as given.
///
/// Only the parent is resolved, so a symlinked source keeps its own name.
async fn source_root(source: &Path) -> Result<PathBuf> {
    let stat_error = || format!("stat {}", source.display());
    let root = match source.file_name() {
        Some(name) => {
            let parent = match source.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            fs::canonicalize(parent)
                .await
                .with_context(stat_error)?
                .join(name)
        }
        // `.`, `..` or a filesystem root
        None => fs::canonicalize(source).await.with_context(stat_error)?,
    };
    fs::metadata(&root).await.with_context(stat_error)?;
    Ok(root)
}

async fn copy_into<W: AsyncWrite + Unpin>(writer: &mut ZipWriter<W>, path: &Path) -> Result<()> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            return Ok(());
        }
        writer.write(&buf[..n]).await?;
    }
}

/// Join the components of a relative path with `/`.
///
/// Returns `None` for the empty path.
fn archive_name(rel: &Path) -> Result<Option<String>> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => bail!("{}: path is not valid UTF-8", rel.display()),
            },
            Component::CurDir => {}
            _ => bail!("{}: unexpected path component", rel.display()),
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.join("/")))
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata, _is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata, is_dir: bool) -> u32 {
    use crate::zip::{S_IFDIR, S_IFREG};
    if is_dir {
        S_IFDIR | 0o755
    } else if metadata.permissions().readonly() {
        S_IFREG | 0o444
    } else {
        S_IFREG | 0o644
    }
}
