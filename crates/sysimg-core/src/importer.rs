//! The import run: plan, generate, publish and expire every auto channel.
//!
//! Channels and devices are processed one at a time against the session's
//! snapshot. A device whose generation fails in any way is skipped for this
//! run and never gets a partial image; other devices carry on.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use sysimg_schema::{ImageEntry, VersionDetail};
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfig, FileSpec};
use crate::generators::artifact::{is_undiffed, same_family};
use crate::generators::{
    Environment, GeneratorArgs, GeneratorContext, GeneratorError, GeneratorRegistry,
};
use crate::io::Fetcher;
use crate::mirror::trigger_push_mirrors;
use crate::planner::VersionPlanner;
use crate::session::Session;
use crate::tree::{CleanupReport, NewImage, normalize};

/// What happened to one device in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    /// A new full image (and any deltas) was published.
    Published {
        /// Version of the new full image.
        version: u64,
        /// Bases of the deltas published alongside it.
        deltas: Vec<u64>,
    },
    /// Nothing new was generated.
    Unchanged,
    /// A generator produced no artifact, failed or timed out.
    Canceled {
        /// File spec that canceled the image.
        file: String,
        /// Why.
        reason: String,
    },
    /// Planning or publishing failed.
    Failed(String),
}

impl std::fmt::Display for DeviceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Published { version, deltas } if deltas.is_empty() => {
                write!(f, "published {version}")
            }
            Self::Published { version, deltas } => {
                let bases: Vec<String> = deltas.iter().map(u64::to_string).collect();
                write!(f, "published {version} (deltas from {})", bases.join(", "))
            }
            Self::Unchanged => write!(f, "unchanged"),
            Self::Canceled { file, reason } => write!(f, "canceled at {file}: {reason}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Outcome of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    /// Channel name.
    pub channel: String,
    /// Device name.
    pub device: String,
    /// What happened.
    pub outcome: DeviceOutcome,
}

/// Summary of one import run.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Per-device outcomes, in processing order.
    pub devices: Vec<DeviceReport>,
    /// What the final garbage collection removed.
    pub cleanup: CleanupReport,
}

impl ImportReport {
    /// Devices that got a new image.
    pub fn published(&self) -> impl Iterator<Item = &DeviceReport> {
        self.devices
            .iter()
            .filter(|d| matches!(d.outcome, DeviceOutcome::Published { .. }))
    }
}

/// Specs honored for `device`, in declared order.
///
/// A `name,device` spec for this device replaces every generic `name` spec;
/// specs for other devices are ignored; the first spec per name wins.
pub fn files_for_device<'a>(files: &'a [FileSpec], device: &str) -> Vec<&'a FileSpec> {
    let overridden: BTreeSet<&str> = files
        .iter()
        .filter(|f| f.device_override() == Some(device))
        .map(FileSpec::base_name)
        .collect();
    let mut seen = BTreeSet::new();
    files
        .iter()
        .filter(|f| match f.device_override() {
            Some(target) => target == device,
            None => !overridden.contains(f.base_name()),
        })
        .filter(|f| seen.insert(f.base_name()))
        .collect()
}

/// Result of running the generators of one image.
enum Generated {
    Done {
        full: Vec<PathBuf>,
        deltas: Vec<Vec<PathBuf>>,
        env: Environment,
    },
    Canceled {
        file: String,
        reason: String,
        unchanged: bool,
    },
}

/// Builds and publishes the next image of every auto channel.
pub struct ImportOrchestrator<'a> {
    session: &'a Session,
    registry: GeneratorRegistry,
    ctx: GeneratorContext,
}

impl std::fmt::Debug for ImportOrchestrator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportOrchestrator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<'a> ImportOrchestrator<'a> {
    /// Orchestrator over the tree of `session`, fetching through `fetcher`.
    pub fn new(session: &'a Session, registry: GeneratorRegistry, fetcher: Arc<dyn Fetcher>) -> Self {
        let ctx = GeneratorContext::new(
            Arc::clone(session.config()),
            session.tree().clone(),
            fetcher,
        );
        Self {
            session,
            registry,
            ctx,
        }
    }

    /// Import every auto channel, sync aliases, collect garbage and trigger
    /// push mirrors.
    ///
    /// Per-device failures are reported in the returned [`ImportReport`];
    /// an unreadable tree only skips the final cleanup.
    pub async fn run(&self) -> ImportReport {
        let mut report = ImportReport::default();
        let config = self.session.config();
        let tree = self.session.tree();
        let snapshot = self.session.snapshot();

        for channel in config.auto_channels() {
            if !snapshot.contains(&channel.name) {
                warn!("channel {} is not published, skipping", channel.name);
                continue;
            }
            for device in snapshot.generation_targets(&channel.name) {
                let outcome = match self.import_device(channel, device).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!("{}/{device}: {err:#}", channel.name);
                        DeviceOutcome::Failed(format!("{err:#}"))
                    }
                };
                report.devices.push(DeviceReport {
                    channel: channel.name.clone(),
                    device: device.to_string(),
                    outcome,
                });
            }
            if let Err(err) = tree.sync_aliases(&channel.name) {
                warn!("failed to sync aliases of {}: {err}", channel.name);
            }
        }

        // A tree that cannot be fully read has no trustworthy live set: skip the sweep.
        match tree.cleanup_tree() {
            Ok(cleanup) => report.cleanup = cleanup,
            Err(err) => warn!("skipping cleanup, the tree could not be read: {err}"),
        }
        trigger_push_mirrors(config).await;
        report
    }

    /// Import one device of `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if planning or publishing fails. Generator problems
    /// are reported as [`DeviceOutcome::Canceled`].
    pub async fn import_device(&self, channel: &ChannelConfig, device_name: &str) -> Result<DeviceOutcome> {
        let tree = self.session.tree();
        let device = tree.get_device(&channel.name, device_name)?;
        let plan = VersionPlanner::new(tree).plan(channel, &device)?;
        debug!(
            "{}/{device_name}: next version {}, delta bases {:?}",
            channel.name,
            plan.next_version,
            plan.delta_bases.iter().map(|b| b.version).collect::<Vec<_>>()
        );

        let env = Environment {
            channel_name: channel.name.clone(),
            device_name: device_name.to_string(),
            device: device.clone(),
            version: plan.next_version,
            version_detail: VersionDetail::new(),
            new_files: Vec::new(),
        };
        let generated = self
            .generate(channel, env, plan.last_full.as_ref(), &plan.delta_bases)
            .await?;
        let (full, deltas, env) = match generated {
            Generated::Done { full, deltas, env } => (full, deltas, env),
            Generated::Canceled { unchanged: true, .. } => return Ok(DeviceOutcome::Unchanged),
            Generated::Canceled { file, reason, .. } => {
                info!("{}/{device_name}: image canceled at {file}: {reason}", channel.name);
                return Ok(DeviceOutcome::Canceled { file, reason });
            }
        };
        if env.new_files.is_empty() {
            debug!("{}/{device_name}: nothing new", channel.name);
            return Ok(DeviceOutcome::Unchanged);
        }

        let version = env.version;
        let mut images =
            vec![NewImage::full(version, full).with_version_detail(env.version_detail.clone())];
        for (base, files) in plan.delta_bases.iter().zip(deltas) {
            if !files.is_empty() {
                images.push(
                    NewImage::delta(base.version, version, files)
                        .with_version_detail(env.version_detail.clone()),
                );
            }
        }
        let published_deltas: Vec<u64> = images.iter().filter_map(|img| img.base).collect();
        device.create_images(&images)?;

        if channel.fullcount > 0 {
            tree.expire_images(&channel.name, device_name, channel.fullcount)?;
        }
        Ok(DeviceOutcome::Published {
            version,
            deltas: published_deltas,
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, GeneratorError>>,
    ) -> Result<T, GeneratorError> {
        let limit = self.ctx.config.generator_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| GeneratorError::Timeout(limit))?
    }

    async fn generate(
        &self,
        channel: &ChannelConfig,
        mut env: Environment,
        last_full: Option<&ImageEntry>,
        bases: &[ImageEntry],
    ) -> Result<Generated> {
        let tree = self.session.tree();
        let published: BTreeSet<&str> = last_full
            .map(|img| img.files.iter().map(|f| f.path.as_str()).collect())
            .unwrap_or_default();
        let mut full = Vec::new();
        let mut deltas: Vec<Vec<PathBuf>> = vec![Vec::new(); bases.len()];

        for spec in files_for_device(&channel.files, &env.device_name) {
            let cancel = |reason: String, unchanged: bool| Generated::Canceled {
                file: spec.name.clone(),
                reason,
                unchanged,
            };

            let generator = match self.registry.get(&spec.generator) {
                Ok(g) => g,
                Err(err) => return Ok(cancel(err.to_string(), false)),
            };
            let args = GeneratorArgs::from_spec(spec);
            let path = match self.bounded(generator.produce(&self.ctx, &args, &mut env)).await {
                Ok(Some(path)) => normalize(&path),
                // Nothing new so far and nothing on offer: the device is up to date.
                Ok(None) => return Ok(cancel("no artifact".into(), env.new_files.is_empty())),
                Err(err) => {
                    warn!("{}/{}: {}: {err}", env.channel_name, env.device_name, spec.name);
                    return Ok(cancel(err.to_string(), false));
                }
            };

            let url = tree.url_path(&path)?;
            if !published.contains(url.as_str()) {
                debug!("{}/{}: new file {url}", env.channel_name, env.device_name);
                env.new_files.push(path.clone());
            }
            full.push(path.clone());

            for (base, files) in bases.iter().zip(deltas.iter_mut()) {
                let base_file = base
                    .files
                    .iter()
                    .map(|f| normalize(&tree.abs_path(&f.path)))
                    .find(|p| same_family(p, &path));
                let Some(base_file) = base_file else {
                    files.push(path.clone());
                    continue;
                };
                if base_file == path && !is_undiffed(&path) {
                    continue;
                }
                let delta = generator.produce_delta(&self.ctx, &base_file, &path, &env.device_name);
                match self.bounded(delta).await {
                    Ok(Some(delta)) => files.push(delta),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            "{}/{}: delta of {} from {}: {err}",
                            env.channel_name,
                            env.device_name,
                            spec.name,
                            base.version
                        );
                        return Ok(cancel(format!("delta from {}: {err}", base.version), false));
                    }
                }
            }
        }
        Ok(Generated::Done { full, deltas, env })
    }
}
