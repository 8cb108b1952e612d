//! # ziptool
//!
//! Create, list and extract ZIP archives.
//!
//! The archive codec lives in [`zip`]: a reader that starts from the End
//! of Central Directory record and a streaming writer that never seeks.
//! [`commands`] holds the three operations the binary dispatches to.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use ziptool::{LocalFileReader, ZipExtractor};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     ziptool::commands::create(Path::new("site.zip"), Path::new("public")).await?;
//!
//!     let reader = Arc::new(LocalFileReader::new(Path::new("site.zip"))?);
//!     let extractor = ZipExtractor::new(reader);
//!     for entry in extractor.list_files().await? {
//!         println!("{} {:o}", entry.file_name, entry.mode());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod io;
pub mod logging;
pub mod zip;

pub use cli::{Cli, Command};
pub use io::{LocalFileReader, ReadAt};
pub use zip::{FileHeader, ZipExtractor, ZipFileEntry, ZipWriter};
