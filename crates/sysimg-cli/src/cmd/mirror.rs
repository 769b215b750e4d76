//! `sysimg-mirror`

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sysimg_core::MirrorSync;
use sysimg_core::io::HttpFetcher;

use crate::{MirrorArgs, load_config};

/// Mirror one device. Exit 1 if the root is missing or any file failed.
///
/// # Errors
///
/// Returns an error if `--config` cannot be loaded or the remote
/// `channels.json` cannot be fetched or resolved.
pub async fn mirror(args: &MirrorArgs) -> Result<ExitCode> {
    if !args.root.is_dir() {
        eprintln!("error: mirror root {} does not exist", args.root.display());
        return Ok(ExitCode::FAILURE);
    }

    let config = args.config.as_ref().map(|p| load_config(Some(p))).transpose()?;
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(args.timeout))?);
    let workers = args.worker_count(config.as_ref());
    let sync = MirrorSync::new(fetcher, &args.url, &args.root, workers);
    let report = sync.sync_device(&args.channel, &args.device).await?;

    println!(
        "  fetched {}, up to date {}, failed {}",
        report.fetched.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for (path, reason) in &report.failed {
        println!("  failed {}: {reason}", path.display());
    }
    if report.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

