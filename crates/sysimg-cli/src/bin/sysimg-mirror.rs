//! Mirror one channel/device of a published tree.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use sysimg_cli::{MirrorArgs, cmd, init_logging};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = MirrorArgs::parse();
    init_logging(args.verbose);
    cmd::mirror::mirror(&args).await
}
