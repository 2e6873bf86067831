//! Burrow CLI: incremental encrypted backups into content-addressed blobs.

use anyhow::Result;
use burrow::cli::{Cli, handle_backup};
use clap::Parser;
use std::time::Instant;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    handle_backup(&cli)?;

    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
