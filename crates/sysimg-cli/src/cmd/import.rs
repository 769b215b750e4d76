//! `sysimg-import`

use std::sync::Arc;

use anyhow::Result;
use sysimg_core::generators::GeneratorRegistry;
use sysimg_core::io::HttpFetcher;
use sysimg_core::{DeviceOutcome, ImportOrchestrator, Session};

use crate::{ImportArgs, load_config};

/// Run one import. A held publish lock is a successful no-op.
///
/// # Errors
///
/// Returns an error if the configuration, keys or tree cannot be loaded.
pub async fn import(args: &ImportArgs) -> Result<()> {
    let config = Arc::new(load_config(args.config.as_ref())?);
    let Some(session) = Session::begin(Arc::clone(&config))? else {
        println!("  another import is running, nothing to do");
        return Ok(());
    };

    let fetcher = Arc::new(HttpFetcher::new(config.fetch_timeout)?);
    let orchestrator = ImportOrchestrator::new(&session, GeneratorRegistry::with_builtins(), fetcher);
    let report = orchestrator.run().await;

    for device in &report.devices {
        println!("  {}/{}: {}", device.channel, device.device, device.outcome);
    }
    let failed = report
        .devices
        .iter()
        .filter(|d| matches!(d.outcome, DeviceOutcome::Failed(_)))
        .count();
    if failed > 0 {
        tracing::warn!("{failed} devices failed");
    }
    if !report.cleanup.removed_files.is_empty() {
        println!("  removed {} orphaned files", report.cleanup.removed_files.len());
    }
    Ok(())
}
