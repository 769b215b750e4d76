//! Mirroring a published tree, and poking push mirrors after an import.
//!
//! A pull mirror run fetches `channels.json` and one device's `index.json`
//! from a remote publisher, downloads every file those manifests reference
//! through a bounded worker pool, and only then commits the manifests. A
//! file whose checksum does not match is discarded and reported; it never
//! blocks its siblings but it does keep the manifests uncommitted, so the
//! local mirror never advertises files it does not have.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures::stream::{self, StreamExt};
use sysimg_schema::{CHANNELS_FILE, ChannelsFile, DeviceIndex, SIGNATURE_SUFFIX, Sha256Digest};
use tracing::{debug, error, info, warn};

use crate::config::{Config, MirrorTrigger};
use crate::io::Fetcher;

/// One file to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Source URL.
    pub url: String,
    /// Local destination.
    pub dest: PathBuf,
    /// Expected digest, when the manifest carries one.
    pub checksum: Option<Sha256Digest>,
}

/// Summary of one mirror sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    /// Files downloaded.
    pub fetched: Vec<PathBuf>,
    /// Files already present with the right digest.
    pub skipped: Vec<PathBuf>,
    /// Files that could not be fetched, with the reason.
    pub failed: Vec<(PathBuf, String)>,
    /// Whether the device manifests were written.
    pub manifests_committed: bool,
}

impl MirrorReport {
    /// Whether every file arrived and the manifests were committed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.manifests_committed
    }
}

/// Manifest documents fetched for one device, written last.
#[derive(Debug, Clone)]
pub struct ManifestSet {
    documents: Vec<(PathBuf, Vec<u8>)>,
}

enum FileResult {
    Fetched(PathBuf),
    Skipped(PathBuf),
    Failed(PathBuf, String),
}

/// Mirrors one channel/device from a publisher.
pub struct MirrorSync {
    fetcher: Arc<dyn Fetcher>,
    base_url: String,
    root: PathBuf,
    workers: usize,
}

impl std::fmt::Debug for MirrorSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSync")
            .field("base_url", &self.base_url)
            .field("root", &self.root)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl MirrorSync {
    /// Sync from `base_url` into `root` with up to `workers` downloads at once.
    pub fn new(fetcher: Arc<dyn Fetcher>, base_url: &str, root: &Path, workers: usize) -> Self {
        Self {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
            root: root.to_path_buf(),
            workers: workers.max(1),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn local(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    async fn fetch_document(&self, path: &str, docs: &mut Vec<(PathBuf, Vec<u8>)>) -> Result<Vec<u8>> {
        let body = self
            .fetcher
            .fetch_bytes(&self.url(path))
            .await
            .with_context(|| format!("failed to fetch {path}"))?;
        let sig_path = format!("{path}{SIGNATURE_SUFFIX}");
        let sig = self
            .fetcher
            .fetch_bytes(&self.url(&sig_path))
            .await
            .with_context(|| format!("failed to fetch {sig_path}"))?;
        docs.push((self.local(&sig_path), sig));
        docs.push((self.local(path), body.clone()));
        Ok(body)
    }

    /// Fetch the manifests of `channel`/`device` and list the files they
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns an error if a manifest cannot be fetched or parsed, or the
    /// device is not published remotely.
    pub async fn plan_device(&self, channel: &str, device: &str) -> Result<(Vec<Record>, ManifestSet)> {
        let mut documents = Vec::new();
        let body = self.fetch_document(CHANNELS_FILE, &mut documents).await?;
        let channels: ChannelsFile =
            serde_json::from_slice(&body).context("malformed remote channels.json")?;

        let Some(resolved) = channels.resolve(channel, device) else {
            bail!("{channel}/{device} is not published at {}", self.base_url);
        };
        let Some(index_path) = resolved.index.clone() else {
            bail!("{}/{} has no index", resolved.channel, resolved.device);
        };
        if resolved.channel != channel || resolved.device != device {
            debug!("{channel}/{device} redirects to {}/{}", resolved.channel, resolved.device);
        }

        let mut records: BTreeMap<String, Option<Sha256Digest>> = BTreeMap::new();
        if let Some(keyring) = channels
            .device(&resolved.channel, &resolved.device)
            .and_then(|entry| entry.keyring.as_ref())
        {
            records.insert(keyring.path.clone(), None);
            records.insert(keyring.signature.clone(), None);
        }

        let body = self.fetch_document(&index_path, &mut documents).await?;
        let index: DeviceIndex =
            serde_json::from_slice(&body).with_context(|| format!("malformed remote {index_path}"))?;
        for file in index.images.iter().flat_map(|img| &img.files) {
            records.insert(file.path.clone(), Some(file.checksum.clone()));
            records.entry(file.signature.clone()).or_insert(None);
        }

        if let Some(path) = records.keys().find(|p| p.split('/').any(|c| c == "..")) {
            bail!("refusing to mirror {path} outside the root");
        }

        // channels.json goes last so clients never see an index before it exists.
        documents.rotate_left(2);
        let records = records
            .into_iter()
            .map(|(path, checksum)| Record {
                url: self.url(&path),
                dest: self.local(&path),
                checksum,
            })
            .collect();
        Ok((records, ManifestSet { documents }))
    }

    async fn sync_record(&self, record: Record) -> FileResult {
        let present = record.checksum.as_ref().is_some_and(|expected| {
            record.dest.exists()
                && Sha256Digest::of_file(&record.dest).is_ok_and(|actual| actual == *expected)
        });
        if present {
            return FileResult::Skipped(record.dest);
        }
        match self
            .fetcher
            .fetch_to(&record.url, &record.dest, record.checksum.as_ref())
            .await
        {
            Ok(_) => FileResult::Fetched(record.dest),
            Err(err) => {
                error!("failed to mirror {}: {err}", record.url);
                FileResult::Failed(record.dest, err.to_string())
            }
        }
    }

    /// Mirror `records` with at most `workers` downloads in flight.
    pub async fn sync_records(&self, records: Vec<Record>) -> MirrorReport {
        let mut report = MirrorReport::default();
        let mut results = stream::iter(records)
            .map(|record| self.sync_record(record))
            .buffer_unordered(self.workers);
        while let Some(result) = results.next().await {
            match result {
                FileResult::Fetched(path) => report.fetched.push(path),
                FileResult::Skipped(path) => report.skipped.push(path),
                FileResult::Failed(path, reason) => report.failed.push((path, reason)),
            }
        }
        report.fetched.sort();
        report.skipped.sort();
        report.failed.sort();
        report
    }

    /// Mirror one device and commit its manifests if every file made it.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifests cannot be fetched or written.
    /// Individual file failures are reported in [`MirrorReport::failed`].
    pub async fn sync_device(&self, channel: &str, device: &str) -> Result<MirrorReport> {
        let (records, manifests) = self.plan_device(channel, device).await?;
        info!(
            "mirroring {} files for {channel}/{device} from {}",
            records.len(),
            self.base_url
        );
        let mut report = self.sync_records(records).await;
        if report.failed.is_empty() {
            for (path, body) in &manifests.documents {
                write_atomic(path, body)?;
            }
            report.manifests_committed = true;
        } else {
            warn!(
                "{} files failed, leaving manifests of {channel}/{device} untouched",
                report.failed.len()
            );
        }
        Ok(report)
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = tempfile::Builder::new()
        .prefix(".manifest-")
        .tempfile_in(parent)?;
    std::fs::write(tmp.path(), body)?;
    tmp.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

async fn trigger(mirror: &MirrorTrigger, timeout: std::time::Duration) -> Result<()> {
    let mut command = tokio::process::Command::new("ssh");
    command
        .arg("-i")
        .arg(&mirror.ssh_key)
        .arg("-l")
        .arg(&mirror.ssh_user)
        .arg("-p")
        .arg(mirror.ssh_port.to_string())
        .arg(&mirror.ssh_host)
        .arg(&mirror.ssh_command)
        .kill_on_drop(true);
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {timeout:?}"))??;
    if !output.status.success() {
        bail!(
            "ssh exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Trigger every configured push mirror. Failures are logged only.
pub async fn trigger_push_mirrors(config: &Config) {
    for (name, mirror) in &config.mirrors {
        match trigger(mirror, config.fetch_timeout).await {
            Ok(()) => info!("triggered mirror {name}"),
            Err(err) => warn!("failed to trigger mirror {name}: {err:#}"),
        }
    }
}
