use anyhow::{Context, Result, bail};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use crate::io::LocalFileReader;
use crate::zip::ZipExtractor;

/// Recreate every entry of `archive` below `target`, which must already exist.
pub async fn extract(archive: &Path, target: &Path) -> Result<()> {
    let extractor = ZipExtractor::new(Arc::new(LocalFileReader::new(archive)?));

    for entry in extractor.list_files().await? {
        println!("{}", entry.file_name);
        let path = entry_path(target, &entry.file_name)?;

        if entry.is_directory {
            let mut builder = fs::DirBuilder::new();
            #[cfg(unix)]
            builder.mode(entry.mode());
            builder
                .create(&path)
                .await
                .with_context(|| format!("mkdir {}", path.display()))?;
            continue;
        }

        extractor.extract_to_file(&entry, &path).await?;
    }
    Ok(())
}

/// Map an archive name onto the host filesystem below `target`.
///
/// Names that would land outside `target` are rejected.
fn entry_path(target: &Path, name: &str) -> Result<PathBuf> {
    if name.starts_with('/') {
        bail!("{}: insecure path", name);
    }

    let mut path = target.to_path_buf();
    for part in name.split('/').filter(|p| !p.is_empty() && *p != ".") {
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            _ => bail!("{}: insecure path", name),
        }
    }
    Ok(path)
}
