//! `sysimg-keygen`

use anyhow::{Context, Result};
use sysimg_core::keys::{BootstrapAction, BootstrapOutcome, KeyHierarchy};

use crate::{KeygenArgs, load_config};

fn report(outcome: &BootstrapOutcome) {
    let action = match outcome.action {
        BootstrapAction::Created => "created",
        BootstrapAction::Existing => "existing",
    };
    let role = match &outcome.device {
        Some(device) => format!("{} ({device})", outcome.role),
        None => outcome.role.to_string(),
    };
    println!(
        "  {action} {role}: {} ({})",
        outcome.identity, outcome.fingerprint
    );
}

/// Create every missing key. Existing keys are listed and left alone.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or a key cannot
/// be written.
pub fn keygen(args: &KeygenArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let root = &config.key_path;

    let outcomes = KeyHierarchy::bootstrap(root, &config.keys, &args.email, &args.prefix)
        .with_context(|| format!("failed to create keys in {}", root.display()))?;
    outcomes.iter().for_each(report);

    for device in &args.devices {
        let outcome =
            KeyHierarchy::create_device_key(root, &config.keys, device, &args.email, &args.prefix)
                .with_context(|| format!("failed to create device key for {device}"))?;
        report(&outcome);
    }
    Ok(())
}
