//! The three operations behind the mode flags.
//!
//! Each one prints the archive path of every entry it handles to stdout and
//! stops at the first error. Nothing already written is rolled back.

mod create;
mod extract;
mod list;

pub use create::create;
pub use extract::extract;
pub use list::list;

use anyhow::Result;

use crate::cli::Command;

pub async fn run(command: &Command) -> Result<()> {
    match command {
        Command::Create { archive, source } => create(archive, source).await,
        Command::Extract { archive, target } => extract(archive, target).await,
        Command::List { archive } => list(archive).await,
    }
}
