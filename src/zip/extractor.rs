use flate2::Crc;
use flate2::write::DeflateDecoder;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::trace;

use crate::io::ReadAt;
use anyhow::{Context, Result, bail};

use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

/// Compressed bytes fetched from the archive per read
const CHUNK_SIZE: usize = 64 * 1024;

/// ZIP file extractor
pub struct ZipExtractor<R: ReadAt> {
    parser: ZipParser<R>,
}

/// Destination of decoded bytes, tracking what went through it.
struct Sink<'a, W> {
    out: &'a mut W,
    crc: Crc,
    written: u64,
    limit: u64,
}

impl<W: AsyncWrite + Unpin> Sink<'_, W> {
    async fn put(&mut self, data: &[u8], name: &str) -> Result<()> {
        self.written += data.len() as u64;
        if self.written > self.limit {
            bail!("{}: size mismatch", name);
        }
        self.crc.update(data);
        self.out.write_all(data).await?;
        Ok(())
    }
}

impl<R: ReadAt> ZipExtractor<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            parser: ZipParser::new(reader),
        }
    }

    /// List all entries in the archive
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        self.parser.list_files().await
    }

    /// Decode an entry's content into `out`, returning the number of bytes written.
    ///
    /// The decoded length and CRC-32 are checked against the central directory;
    /// a mismatch fails after the bytes have been written.
    pub async fn extract_to_writer<W: AsyncWrite + Unpin>(
        &self,
        entry: &ZipFileEntry,
        out: &mut W,
    ) -> Result<u64> {
        let name = entry.file_name.as_str();
        if entry.is_encrypted() {
            bail!("{}: encrypted entries are not supported", name);
        }

        let mut decoder = match entry.compression_method {
            CompressionMethod::Stored => None,
            CompressionMethod::Deflate => Some(DeflateDecoder::new(Vec::new())),
            CompressionMethod::Unknown(code) => {
                bail!("{}: unsupported compression method {}", name, code)
            }
        };

        let mut offset = self.parser.get_data_offset(entry).await?;
        let mut remaining = entry.compressed_size;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sink = Sink {
            out,
            crc: Crc::new(),
            written: 0,
            limit: entry.uncompressed_size,
        };

        while remaining > 0 {
            let n = remaining.min(CHUNK_SIZE as u64) as usize;
            self.parser
                .reader()
                .read_exact_at(offset, &mut buf[..n])
                .await?;
            offset += n as u64;
            remaining -= n as u64;

            match decoder.as_mut() {
                Some(decoder) => {
                    decoder
                        .write_all(&buf[..n])
                        .with_context(|| format!("{}: invalid deflate data", name))?;
                    let decoded = std::mem::take(decoder.get_mut());
                    sink.put(&decoded, name).await?;
                }
                None => sink.put(&buf[..n], name).await?,
            }
        }

        if let Some(decoder) = decoder {
            let tail = decoder
                .finish()
                .with_context(|| format!("{}: invalid deflate data", name))?;
            sink.put(&tail, name).await?;
        }

        trace!(name, written = sink.written, "entry decoded");
        if sink.written != entry.uncompressed_size {
            bail!("{}: size mismatch", name);
        }
        if sink.crc.sum() != entry.crc32 {
            bail!("{}: checksum error", name);
        }
        Ok(sink.written)
    }

    /// Extract an entry to `output_path`, creating or truncating the file
    /// with the entry's permission bits. Parent directories must exist.
    pub async fn extract_to_file(&self, entry: &ZipFileEntry, output_path: &Path) -> Result<u64> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(entry.mode());

        let file = options
            .open(output_path)
            .await
            .with_context(|| format!("open {}", output_path.display()))?;

        let mut out = BufWriter::new(file);
        let written = self.extract_to_writer(entry, &mut out).await?;
        out.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalFileReader;
    use crate::zip::{FileHeader, ZipWriter};
    use std::path::PathBuf;
    use std::time::UNIX_EPOCH;

    const TEXT: &[u8] = b"the quick brown fox jumps over the lazy dog\n";

    async fn write_archive(path: &Path, method: CompressionMethod) {
        let file = fs::File::create(path).await.unwrap();
        let mut writer = ZipWriter::new(file);
        let mut header = FileHeader::file("fox.txt", 0o100640, UNIX_EPOCH);
        header.method = method;
        writer.create_entry(header).await.unwrap();
        for _ in 0..5000 {
            writer.write(TEXT).await.unwrap();
        }
        writer.finish().await.unwrap();
    }

    fn extractor(path: &Path) -> ZipExtractor<LocalFileReader> {
        ZipExtractor::new(Arc::new(LocalFileReader::new(path).unwrap()))
    }

    fn expected() -> Vec<u8> {
        TEXT.repeat(5000)
    }

    // Offset of the central directory record of a single-entry archive.
    fn central_directory(data: &[u8]) -> usize {
        data.windows(4).rposition(|w| w == b"PK\x01\x02").unwrap()
    }

    #[tokio::test]
    async fn decodes_deflate_and_stored_entries() {
        let dir = tempfile::tempdir().unwrap();
        for method in [CompressionMethod::Deflate, CompressionMethod::Stored] {
            let path = dir.path().join("fox.zip");
            write_archive(&path, method).await;

            let extractor = extractor(&path);
            let entries = extractor.list_files().await.unwrap();
            assert_eq!(entries[0].compression_method, method);

            let mut out = Vec::new();
            let n = extractor
                .extract_to_writer(&entries[0], &mut out)
                .await
                .unwrap();
            assert_eq!(n, expected().len() as u64);
            assert_eq!(out, expected());
        }
    }

    #[tokio::test]
    async fn checksum_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fox.zip");
        write_archive(&path, CompressionMethod::Deflate).await;

        let mut data = std::fs::read(&path).unwrap();
        let cd = central_directory(&data);
        data[cd + 16] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let extractor = extractor(&path);
        let entries = extractor.list_files().await.unwrap();
        let err = extractor
            .extract_to_writer(&entries[0], &mut Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "fox.txt: checksum error");
    }

    #[tokio::test]
    async fn unknown_methods_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fox.zip");
        write_archive(&path, CompressionMethod::Stored).await;

        let mut data = std::fs::read(&path).unwrap();
        let cd = central_directory(&data);
        data[cd + 10..cd + 12].copy_from_slice(&12u16.to_le_bytes());
        std::fs::write(&path, &data).unwrap();

        let extractor = extractor(&path);
        let entries = extractor.list_files().await.unwrap();
        let err = extractor
            .extract_to_writer(&entries[0], &mut Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "fox.txt: unsupported compression method 12");
    }

    #[tokio::test]
    async fn extract_to_file_requires_the_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fox.zip");
        write_archive(&path, CompressionMethod::Deflate).await;

        let extractor = extractor(&path);
        let entries = extractor.list_files().await.unwrap();

        let missing: PathBuf = dir.path().join("missing").join("fox.txt");
        assert!(extractor.extract_to_file(&entries[0], &missing).await.is_err());

        let target = dir.path().join("fox.txt");
        extractor.extract_to_file(&entries[0], &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), expected());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            // umask may only clear bits
            assert_eq!(mode & !0o640 & 0o777, 0);
            assert_eq!(mode & 0o600, 0o600);
        }
    }
}
