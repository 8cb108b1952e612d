//! Streaming ZIP archive writer.
//!
//! Entries are written front to back without seeking: every file entry
//! gets a local header with zero sizes, its compressed data, and a data
//! descriptor carrying the CRC-32 and sizes. The central directory is
//! accumulated in memory and emitted by [`ZipWriter::finish`].

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::Crc;
use flate2::write::DeflateEncoder;
use std::io::Write;
use std::time::SystemTime;
use tokio::io::AsyncWrite;
use tracing::{debug, trace};

use anyhow::{Result, bail};

use super::structures::*;

/// Metadata for an entry about to be written.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Archive path, `/`-separated; directories end with `/`
    pub name: String,
    /// Unix `st_mode`, file type bits included
    pub mode: u32,
    pub modified: SystemTime,
    pub method: CompressionMethod,
}

impl FileHeader {
    /// A file entry compressed with DEFLATE.
    pub fn file(name: impl Into<String>, mode: u32, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            mode,
            modified,
            method: CompressionMethod::Deflate,
        }
    }

    /// A directory entry. Directories never carry data, so they are stored.
    pub fn directory(name: impl Into<String>, mode: u32, modified: SystemTime) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        Self {
            name,
            mode,
            modified,
            method: CompressionMethod::Stored,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.name.ends_with('/')
    }

    fn unix_mode(&self) -> u32 {
        if self.mode & S_IFMT != 0 {
            self.mode
        } else if self.is_directory() {
            self.mode | S_IFDIR
        } else {
            self.mode | S_IFREG
        }
    }

    fn external_attrs(&self) -> u32 {
        let mode = self.unix_mode();
        let mut attrs = mode << 16;
        if self.is_directory() {
            attrs |= MSDOS_DIR;
        }
        if mode & 0o200 == 0 {
            attrs |= MSDOS_READONLY;
        }
        attrs
    }
}

/// Central directory record kept until the archive is finished.
struct CentralRecord {
    header: FileHeader,
    flags: u16,
    dos_time: DosDateTime,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    lfh_offset: u64,
}

impl CentralRecord {
    fn needs_zip64(&self) -> bool {
        self.compressed_size >= U32_MAX
            || self.uncompressed_size >= U32_MAX
            || self.lfh_offset >= U32_MAX
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut zip64 = Vec::new();
        let uncompressed_size = if self.uncompressed_size >= U32_MAX {
            zip64.write_u64::<LittleEndian>(self.uncompressed_size)?;
            U32_MAX as u32
        } else {
            self.uncompressed_size as u32
        };
        let compressed_size = if self.compressed_size >= U32_MAX {
            zip64.write_u64::<LittleEndian>(self.compressed_size)?;
            U32_MAX as u32
        } else {
            self.compressed_size as u32
        };
        let lfh_offset = if self.lfh_offset >= U32_MAX {
            zip64.write_u64::<LittleEndian>(self.lfh_offset)?;
            U32_MAX as u32
        } else {
            self.lfh_offset as u32
        };

        let mut extra = Vec::new();
        if !zip64.is_empty() {
            extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
            extra.write_u16::<LittleEndian>(zip64.len() as u16)?;
            extra.extend_from_slice(&zip64);
        }
        write_timestamp_extra(&mut extra, self.header.modified)?;

        let version_needed = if self.needs_zip64() { VERSION_45 } else { VERSION_20 };
        let name = self.header.name.as_bytes();

        out.extend_from_slice(CDFH_SIGNATURE);
        out.write_u16::<LittleEndian>(version_made_by())?;
        out.write_u16::<LittleEndian>(version_needed)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.header.method.as_u16())?;
        out.write_u16::<LittleEndian>(self.dos_time.time)?;
        out.write_u16::<LittleEndian>(self.dos_time.date)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(compressed_size)?;
        out.write_u32::<LittleEndian>(uncompressed_size)?;
        out.write_u16::<LittleEndian>(name.len() as u16)?;
        out.write_u16::<LittleEndian>(extra.len() as u16)?;
        out.write_u16::<LittleEndian>(0)?; // comment length
        out.write_u16::<LittleEndian>(0)?; // disk number start
        out.write_u16::<LittleEndian>(0)?; // internal attributes
        out.write_u32::<LittleEndian>(self.header.external_attrs())?;
        out.write_u32::<LittleEndian>(lfh_offset)?;
        out.extend_from_slice(name);
        out.extend_from_slice(&extra);
        Ok(())
    }
}

/// Entry currently receiving data.
struct OpenEntry {
    encoder: Option<DeflateEncoder<Vec<u8>>>,
    crc: Crc,
    uncompressed_size: u64,
    data_start: u64,
    is_directory: bool,
}

/// Streaming ZIP writer over any async byte sink.
pub struct ZipWriter<W: AsyncWrite + Unpin> {
    inner: W,
    offset: u64,
    records: Vec<CentralRecord>,
    current: Option<OpenEntry>,
}

impl<W: AsyncWrite + Unpin> ZipWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            offset: 0,
            records: Vec::new(),
            current: None,
        }
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        // Qualified: Vec<u8> also gets byteorder's WriteBytesExt methods
        tokio::io::AsyncWriteExt::write_all(&mut self.inner, data).await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Start a new entry, closing the previous one.
    ///
    /// File content is supplied afterwards through [`ZipWriter::write`].
    pub async fn create_entry(&mut self, header: FileHeader) -> Result<()> {
        self.finish_entry().await?;

        if header.name.len() > u16::MAX as usize {
            bail!("entry name too long: {}", header.name);
        }
        if let CompressionMethod::Unknown(code) = header.method {
            bail!("unsupported compression method {}", code);
        }

        let is_directory = header.is_directory();
        if is_directory && header.method != CompressionMethod::Stored {
            bail!("directory entry {} must be stored", header.name);
        }

        let mut flags = 0;
        if !is_directory {
            flags |= FLAG_DATA_DESCRIPTOR;
        }
        if !header.name.is_ascii() {
            flags |= FLAG_UTF8;
        }

        let dos_time = DosDateTime::from_system_time(header.modified);
        let mut extra = Vec::new();
        write_timestamp_extra(&mut extra, header.modified)?;

        let name = header.name.as_bytes();
        let mut lfh = Vec::with_capacity(LFH_SIZE + name.len() + extra.len());
        lfh.extend_from_slice(LFH_SIGNATURE);
        lfh.write_u16::<LittleEndian>(VERSION_20)?;
        lfh.write_u16::<LittleEndian>(flags)?;
        lfh.write_u16::<LittleEndian>(header.method.as_u16())?;
        lfh.write_u16::<LittleEndian>(dos_time.time)?;
        lfh.write_u16::<LittleEndian>(dos_time.date)?;
        // CRC and sizes are zero here: directories have none, files use the data descriptor.
        lfh.write_u32::<LittleEndian>(0)?;
        lfh.write_u32::<LittleEndian>(0)?;
        lfh.write_u32::<LittleEndian>(0)?;
        lfh.write_u16::<LittleEndian>(name.len() as u16)?;
        lfh.write_u16::<LittleEndian>(extra.len() as u16)?;
        lfh.extend_from_slice(name);
        lfh.extend_from_slice(&extra);

        let lfh_offset = self.offset;
        debug!(name = %header.name, lfh_offset, "writing entry");
        self.write_raw(&lfh).await?;

        let encoder = (header.method == CompressionMethod::Deflate)
            .then(|| DeflateEncoder::new(Vec::new(), Compression::default()));

        self.records.push(CentralRecord {
            header,
            flags,
            dos_time,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            lfh_offset,
        });
        self.current = Some(OpenEntry {
            encoder,
            crc: Crc::new(),
            uncompressed_size: 0,
            data_start: self.offset,
            is_directory,
        });
        Ok(())
    }

    /// Append content to the entry opened by the last [`ZipWriter::create_entry`].
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let output = {
            let Some(entry) = self.current.as_mut() else {
                bail!("no archive entry is open");
            };
            if entry.is_directory {
                bail!("directory entries cannot hold data");
            }
            entry.crc.update(data);
            entry.uncompressed_size += data.len() as u64;
            match entry.encoder.as_mut() {
                Some(encoder) => {
                    encoder.write_all(data)?;
                    std::mem::take(encoder.get_mut())
                }
                None => data.to_vec(),
            }
        };
        if !output.is_empty() {
            self.write_raw(&output).await?;
        }
        Ok(())
    }

    /// Flush the open entry's compressor and write its data descriptor.
    async fn finish_entry(&mut self) -> Result<()> {
        let Some(entry) = self.current.take() else {
            return Ok(());
        };

        if let Some(encoder) = entry.encoder {
            let tail = encoder.finish()?;
            self.write_raw(&tail).await?;
        }

        let compressed_size = self.offset - entry.data_start;
        let crc32 = entry.crc.sum();
        let uncompressed_size = entry.uncompressed_size;

        let Some(record) = self.records.last_mut() else {
            bail!("archive entry without a record");
        };
        record.crc32 = crc32;
        record.compressed_size = compressed_size;
        record.uncompressed_size = uncompressed_size;
        trace!(
            name = %record.header.name,
            compressed_size,
            uncompressed_size,
            "entry finished"
        );

        if entry.is_directory {
            return Ok(());
        }

        let zip64 = compressed_size >= U32_MAX || uncompressed_size >= U32_MAX;
        let mut descriptor = Vec::with_capacity(24);
        descriptor.extend_from_slice(DATA_DESCRIPTOR_SIGNATURE);
        descriptor.write_u32::<LittleEndian>(crc32)?;
        if zip64 {
            descriptor.write_u64::<LittleEndian>(compressed_size)?;
            descriptor.write_u64::<LittleEndian>(uncompressed_size)?;
        } else {
            descriptor.write_u32::<LittleEndian>(compressed_size as u32)?;
            descriptor.write_u32::<LittleEndian>(uncompressed_size as u32)?;
        }
        self.write_raw(&descriptor).await
    }

    /// Close the last entry, write the central directory and end records,
    /// flush, and hand back the underlying sink.
    pub async fn finish(mut self) -> Result<W> {
        self.finish_entry().await?;

        let cd_offset = self.offset;
        let mut cd = Vec::new();
        for record in &self.records {
            record.write_to(&mut cd)?;
        }
        self.write_raw(&cd).await?;
        let cd_size = cd.len() as u64;
        let total_entries = self.records.len() as u64;

        let mut tail = Vec::new();
        let zip64 = total_entries >= U16_MAX || cd_size >= U32_MAX || cd_offset >= U32_MAX;
        if zip64 {
            let eocd64_offset = self.offset;
            Zip64EOCD {
                eocd64_size: (Zip64EOCD::MIN_SIZE - 12) as u64,
                version_made_by: version_made_by(),
                version_needed: VERSION_45,
                disk_number: 0,
                disk_with_cd: 0,
                disk_entries: total_entries,
                total_entries,
                cd_size,
                cd_offset,
            }
            .write_to(&mut tail)?;
            Zip64EOCDLocator {
                disk_with_eocd64: 0,
                eocd64_offset,
                total_disks: 1,
            }
            .write_to(&mut tail)?;
        }

        let entries16 = total_entries.min(U16_MAX) as u16;
        EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries16,
            total_entries: entries16,
            cd_size: cd_size.min(U32_MAX) as u32,
            cd_offset: cd_offset.min(U32_MAX) as u32,
            comment_len: 0,
        }
        .write_to(&mut tail)?;
        self.write_raw(&tail).await?;

        debug!(total_entries, cd_offset, cd_size, zip64, "archive finished");
        tokio::io::AsyncWriteExt::flush(&mut self.inner).await?;
        Ok(self.inner)
    }
}

fn version_made_by() -> u16 {
    (CREATOR_UNIX as u16) << 8 | VERSION_20
}

// Extended timestamp: flags byte (bit 0 = mtime present) and the mtime in Unix seconds.
fn write_timestamp_extra(extra: &mut Vec<u8>, modified: SystemTime) -> Result<()> {
    let secs = unix_seconds(modified);
    if let Ok(secs) = u32::try_from(secs) {
        extra.write_u16::<LittleEndian>(EXT_TIMESTAMP_EXTRA_ID)?;
        extra.write_u16::<LittleEndian>(5)?;
        extra.write_u8(1)?;
        extra.write_u32::<LittleEndian>(secs)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn u16_at(data: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([data[at], data[at + 1]])
    }

    fn u32_at(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
    }

    fn find(data: &[u8], needle: &[u8]) -> Vec<usize> {
        data.windows(needle.len())
            .enumerate()
            .filter(|(_, w)| *w == needle)
            .map(|(i, _)| i)
            .collect()
    }

    #[tokio::test]
    async fn directory_entries_are_stored_without_descriptor() {
        let mut writer = ZipWriter::new(Vec::new());
        writer
            .create_entry(FileHeader::directory("proj", 0o040755, UNIX_EPOCH))
            .await
            .unwrap();
        let data = writer.finish().await.unwrap();

        assert_eq!(&data[0..4], LFH_SIGNATURE);
        assert_eq!(u16_at(&data, 6), 0, "flags");
        assert_eq!(u16_at(&data, 8), 0, "method");
        assert_eq!(&data[30..35], b"proj/");
        assert!(find(&data, DATA_DESCRIPTOR_SIGNATURE).is_empty());

        let cd = find(&data, CDFH_SIGNATURE)[0];
        assert_eq!(u32_at(&data, cd + 38), (0o040755 << 16) | MSDOS_DIR);
    }

    #[tokio::test]
    async fn file_entries_end_with_a_data_descriptor() {
        let modified = UNIX_EPOCH + Duration::from_secs(1_709_210_096);
        let mut writer = ZipWriter::new(Vec::new());
        writer
            .create_entry(FileHeader::file("a.txt", 0o100444, modified))
            .await
            .unwrap();
        writer.write(b"hello").await.unwrap();
        let data = writer.finish().await.unwrap();

        assert_eq!(u16_at(&data, 6), FLAG_DATA_DESCRIPTOR);
        assert_eq!(u16_at(&data, 8), 8, "deflate");

        let mut crc = Crc::new();
        crc.update(b"hello");

        let dd = find(&data, DATA_DESCRIPTOR_SIGNATURE)[0];
        assert_eq!(u32_at(&data, dd + 4), crc.sum());
        assert_eq!(u32_at(&data, dd + 12), 5);

        let cd = find(&data, CDFH_SIGNATURE)[0];
        assert_eq!(u16_at(&data, cd + 4), 0x0314, "version made by");
        assert_eq!(u32_at(&data, cd + 16), crc.sum());
        assert_eq!(u32_at(&data, cd + 24), 5);
        assert_eq!(
            u32_at(&data, cd + 38),
            (0o100444 << 16) | MSDOS_READONLY,
            "read-only files carry the DOS bit"
        );

        let dos = DosDateTime::from_system_time(modified);
        assert_eq!(u16_at(&data, cd + 12), dos.time);
        assert_eq!(u16_at(&data, cd + 14), dos.date);
    }

    #[tokio::test]
    async fn non_ascii_names_set_the_utf8_flag() {
        let mut writer = ZipWriter::new(Vec::new());
        writer
            .create_entry(FileHeader::file("naïve.txt", 0o644, UNIX_EPOCH))
            .await
            .unwrap();
        let data = writer.finish().await.unwrap();
        assert_eq!(u16_at(&data, 6), FLAG_DATA_DESCRIPTOR | FLAG_UTF8);
    }

    #[tokio::test]
    async fn rejects_misuse() {
        let mut writer = ZipWriter::new(Vec::new());
        assert!(writer.write(b"orphan").await.is_err());

        writer
            .create_entry(FileHeader::directory("d/", 0o755, UNIX_EPOCH))
            .await
            .unwrap();
        let err = writer.write(b"x").await.unwrap_err();
        assert_eq!(err.to_string(), "directory entries cannot hold data");

        let mut header = FileHeader::file("x.bz2", 0o644, UNIX_EPOCH);
        header.method = CompressionMethod::Unknown(12);
        let err = writer.create_entry(header).await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported compression method 12");
    }

    #[tokio::test]
    async fn end_record_counts_entries() {
        let mut writer = ZipWriter::new(Vec::new());
        for name in ["a", "b", "c"] {
            writer
                .create_entry(FileHeader::file(name, 0o644, UNIX_EPOCH))
                .await
                .unwrap();
            writer.write(name.as_bytes()).await.unwrap();
        }
        let data = writer.finish().await.unwrap();

        let eocd = EndOfCentralDirectory::from_bytes(&data[data.len() - 22..]).unwrap();
        assert_eq!(eocd.total_entries, 3);
        assert!(!eocd.is_zip64());
        assert_eq!(
            eocd.cd_offset as usize + eocd.cd_size as usize,
            data.len() - EndOfCentralDirectory::SIZE
        );
        assert_eq!(find(&data, CDFH_SIGNATURE).len(), 3);
    }
}
