use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::io::LocalFileReader;
use crate::zip::ZipExtractor;

/// Print the stored name of every entry, in central directory order.
pub async fn list(archive: &Path) -> Result<()> {
    let extractor = ZipExtractor::new(Arc::new(LocalFileReader::new(archive)?));
    for entry in extractor.list_files().await? {
        println!("{}", entry.file_name);
    }
    Ok(())
}
