use anyhow::{Result, anyhow};
use clap::Parser;
use std::path::PathBuf;

/// Usage text shown when no mode flag is given.
pub const USAGE: &str = "Usage:
    ziptool -l zipfile.zip         # Show listing of a zipfile
    ziptool -e zipfile.zip target  # Extract zipfile into target dir
    ziptool -c zipfile.zip src     # Create zipfile from source";

#[derive(Parser, Debug)]
#[command(name = "ziptool")]
#[command(version)]
#[command(about = "Create, list and extract ZIP archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  ziptool -c site.zip public      archive the public/ tree as site.zip\n  \
  ziptool -l site.zip             list the entries of site.zip\n  \
  ziptool -e site.zip /srv/www    recreate public/ under /srv/www")]
pub struct Cli {
    /// Create zipfile from source
    #[arg(short = 'c')]
    pub create: bool,

    /// Extract zipfile into target dir
    #[arg(short = 'e')]
    pub extract: bool,

    /// Show listing of a zipfile
    #[arg(short = 'l')]
    pub list: bool,

    /// Zipfile followed by the source or target, depending on the mode
    #[arg(value_name = "ARGS", value_parser = clap::value_parser!(PathBuf))]
    pub args: Vec<PathBuf>,
}

/// One fully resolved invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create { archive: PathBuf, source: PathBuf },
    Extract { archive: PathBuf, target: PathBuf },
    List { archive: PathBuf },
}

impl Cli {
    /// Resolve flags and positional arguments into a [`Command`].
    ///
    /// Returns `Ok(None)` when no mode flag was given. When several are set,
    /// create wins over extract, and extract over list.
    pub fn command(&self) -> Result<Option<Command>> {
        let command = if self.create {
            Command::Create {
                archive: self.arg(0, "zipfile")?,
                source: self.arg(1, "source")?,
            }
        } else if self.extract {
            Command::Extract {
                archive: self.arg(0, "zipfile")?,
                target: self.arg(1, "target")?,
            }
        } else if self.list {
            Command::List {
                archive: self.arg(0, "zipfile")?,
            }
        } else {
            return Ok(None);
        };
        Ok(Some(command))
    }

    fn arg(&self, index: usize, name: &str) -> Result<PathBuf> {
        self.args
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("missing {} argument", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ziptool").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn create_takes_archive_then_source() {
        let command = parse(&["-c", "out.zip", "proj"]).command().unwrap();
        assert_eq!(
            command,
            Some(Command::Create {
                archive: "out.zip".into(),
                source: "proj".into(),
            })
        );
    }

    #[test]
    fn extract_and_list() {
        assert_eq!(
            parse(&["-e", "in.zip", "out"]).command().unwrap(),
            Some(Command::Extract {
                archive: "in.zip".into(),
                target: "out".into(),
            })
        );
        assert_eq!(
            parse(&["-l", "in.zip"]).command().unwrap(),
            Some(Command::List {
                archive: "in.zip".into()
            })
        );
    }

    #[test]
    fn no_mode_means_usage() {
        assert_eq!(parse(&[]).command().unwrap(), None);

        // Positionals alone do not select a mode
        assert_eq!(parse(&["in.zip"]).command().unwrap(), None);
    }

    #[test]
    fn create_beats_extract_beats_list() {
        let command = parse(&["-l", "-e", "-c", "a.zip", "b"]).command().unwrap();
        assert!(matches!(command, Some(Command::Create { .. })));

        let command = parse(&["-le", "a.zip", "b"]).command().unwrap();
        assert!(matches!(command, Some(Command::Extract { .. })));
    }

    #[test]
    fn missing_positionals_are_errors() {
        let err = parse(&["-c", "out.zip"]).command().unwrap_err();
        assert_eq!(err.to_string(), "missing source argument");

        let err = parse(&["-l"]).command().unwrap_err();
        assert_eq!(err.to_string(), "missing zipfile argument");
    }

    #[cfg(unix)]
    #[test]
    fn paths_need_not_be_utf8() {
        use std::ffi::OsString;
        use std::os::unix::ffi::OsStringExt;

        let archive = OsString::from_vec(b"caf\xe9.zip".to_vec());
        let cli = Cli::try_parse_from([
            OsString::from("ziptool"),
            OsString::from("-l"),
            archive.clone(),
        ])
        .unwrap();
        assert_eq!(
            cli.command().unwrap(),
            Some(Command::List {
                archive: PathBuf::from(archive)
            })
        );
    }

    #[test]
    fn extra_positionals_are_ignored() {
        let command = parse(&["-l", "a.zip", "stray"]).command().unwrap();
        assert_eq!(
            command,
            Some(Command::List {
                archive: "a.zip".into()
            })
        );
    }
}
