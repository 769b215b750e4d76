//! Create the signing-key hierarchy of an instance.

use anyhow::Result;
use clap::Parser;

use sysimg_cli::{KeygenArgs, cmd, init_logging};

fn main() -> Result<()> {
    let args = KeygenArgs::parse();
    init_logging(args.verbose);
    cmd::keygen::keygen(&args)
}
