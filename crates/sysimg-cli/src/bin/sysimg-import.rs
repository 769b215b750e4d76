//! Publish new system images for every auto channel.

use anyhow::Result;
use clap::Parser;

use sysimg_cli::{ImportArgs, cmd, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ImportArgs::parse();
    init_logging(args.verbose);
    cmd::import::import(&args).await
}
