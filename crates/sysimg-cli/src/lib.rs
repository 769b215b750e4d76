//! Command-line front ends of the system-image publisher.
//!
//! - `sysimg-import`: run one import over every auto channel.
//! - `sysimg-mirror`: pull one channel/device from a publisher.
//! - `sysimg-keygen`: create the signing-key hierarchy.

/// Command implementations behind the binaries.
pub mod cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sysimg_core::Config;
use tracing_subscriber::EnvFilter;

/// Install the log subscriber. `RUST_LOG` wins; otherwise `-v` raises the
/// level from warn to info to debug.
pub fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load `path`, or the default config location.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is invalid.
pub fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let path = path.cloned().unwrap_or_else(Config::default_path);
    Config::load(&path).with_context(|| format!("failed to load config {}", path.display()))
}

/// Arguments of `sysimg-import`.
#[derive(Debug, Parser)]
#[command(name = "sysimg-import", version, about = "Generate and publish new system images")]
pub struct ImportArgs {
    /// Path to the configuration file
    #[arg(short, long, env = "SYSIMG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Arguments of `sysimg-mirror`.
#[derive(Debug, Parser)]
#[command(name = "sysimg-mirror", version, about = "Mirror one channel/device of a published tree")]
pub struct MirrorArgs {
    /// Local mirror root (must exist)
    pub root: PathBuf,

    /// Channel to mirror
    #[arg(long)]
    pub channel: String,

    /// Device to mirror
    #[arg(long)]
    pub device: String,

    /// Base URL of the publishing server
    #[arg(long, env = "SYSIMG_MIRROR_URL")]
    pub url: String,

    /// Concurrent downloads (default: `mirror_workers` of --config, else
    /// the number of CPUs)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Publisher configuration supplying defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Per-file fetch timeout in seconds
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl MirrorArgs {
    /// `--workers`, then the configured `mirror_workers`, then the CPU count.
    pub fn worker_count(&self, config: Option<&Config>) -> usize {
        self.workers
            .or_else(|| config.map(|c| c.mirror_workers))
            .unwrap_or_else(num_cpus::get)
            .max(1)
    }
}

/// Arguments of `sysimg-keygen`.
#[derive(Debug, Parser)]
#[command(name = "sysimg-keygen", version, about = "Create the image signing keys")]
pub struct KeygenArgs {
    /// Path to the configuration file
    #[arg(short, long, env = "SYSIMG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Contact address embedded in every key identity
    #[arg(long)]
    pub email: String,

    /// Identity prefix, e.g. "[ACME]"
    #[arg(long)]
    pub prefix: String,

    /// Also create a device-signing key for this device (repeatable)
    #[arg(long = "device")]
    pub devices: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        ImportArgs::command().debug_assert();
        MirrorArgs::command().debug_assert();
        KeygenArgs::command().debug_assert();
    }

    #[test]
    fn test_mirror_requires_channel_and_device() {
        assert!(MirrorArgs::try_parse_from(["sysimg-mirror", "/srv", "--url", "http://x"]).is_err());
        let args = MirrorArgs::try_parse_from([
            "sysimg-mirror",
            "/srv",
            "--channel",
            "stable",
            "--device",
            "mako",
            "--url",
            "http://x",
        ])
        .unwrap();
        assert_eq!(args.channel, "stable");
        assert_eq!(args.workers, None);
    }

    #[test]
    fn test_mirror_worker_defaults() {
        let parse = |extra: &[&str]| {
            let mut argv = vec!["sysimg-mirror", "/srv", "--channel", "stable", "--device", "mako"];
            argv.extend_from_slice(&["--url", "http://x"]);
            argv.extend_from_slice(extra);
            MirrorArgs::try_parse_from(argv).unwrap()
        };
        let config = Config::from_toml_str(
            "[global]\nmirror_workers = 3\n",
            std::path::Path::new("config.toml"),
            Some(std::path::Path::new("/srv/sysimg")),
        )
        .unwrap();

        assert_eq!(parse(&[]).worker_count(Some(&config)), 3);
        assert_eq!(parse(&["--workers", "7"]).worker_count(Some(&config)), 7);
        assert_eq!(parse(&[]).worker_count(None), num_cpus::get().max(1));
        assert_eq!(parse(&["--workers", "0"]).worker_count(None), 1);
    }

    #[test]
    fn test_import_verbosity_count() {
        let args = ImportArgs::try_parse_from(["sysimg-import", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }
}
