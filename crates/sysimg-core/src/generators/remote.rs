use std::path::PathBuf;

use async_trait::async_trait;
use sysimg_schema::{CHANNELS_FILE, ChannelsFile, DeviceIndex, Sha256Digest};

use super::artifact::{ArtifactMetadata, ensure_signed, filename_prefix};
use super::{Environment, Generator, GeneratorArgs, GeneratorContext, GeneratorError};

const NAME: &str = "remote-system-image";

/// File copied from the latest full image of a channel on another server.
///
/// Arguments are the server's base URL, the channel and the artifact
/// family. The download is verified against the remote index checksum and
/// re-signed with the local keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteSystemImageGenerator;

async fn fetch_json<T: serde::de::DeserializeOwned>(
    ctx: &GeneratorContext,
    url: &str,
) -> Result<T, GeneratorError> {
    let key = format!("{NAME}:{url}");
    let body = if let Some(cached) = ctx.cached(&key) {
        cached
    } else {
        let bytes = ctx.fetcher.fetch_bytes(url).await?;
        let body = String::from_utf8_lossy(&bytes).into_owned();
        ctx.remember(&key, &body);
        body
    };
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl Generator for RemoteSystemImageGenerator {
    async fn produce(
        &self,
        ctx: &GeneratorContext,
        args: &GeneratorArgs,
        env: &mut Environment,
    ) -> Result<Option<PathBuf>, GeneratorError> {
        args.check(NAME, 3, &["device"])?;
        let base = args.required(NAME, 0, "base URL")?.trim_end_matches('/');
        let channel = args.required(NAME, 1, "channel")?;
        let family = args.required(NAME, 2, "family")?;
        let device_name = args.option("device").unwrap_or(&env.device_name);

        let channels: ChannelsFile = fetch_json(ctx, &format!("{base}/{CHANNELS_FILE}")).await?;
        let Some(index_url) = channels
            .resolve(channel, device_name)
            .and_then(|resolved| resolved.index)
        else {
            tracing::debug!(base, channel, device = device_name, "device not on remote");
            return Ok(None);
        };
        let index: DeviceIndex = fetch_json(ctx, &format!("{base}{index_url}")).await?;
        let Some(latest) = index.latest_full() else {
            return Ok(None);
        };

        let Some(file) = latest.files.iter().find(|f| {
            let name = f.path.rsplit('/').next().unwrap_or(&f.path);
            filename_prefix(name) == family
        }) else {
            return Ok(None);
        };

        let name = file.path.rsplit('/').next().unwrap_or(&file.path);
        let pool = ctx.tree.pool_dir();
        std::fs::create_dir_all(&pool)?;
        let path = pool.join(name);
        if path.exists() {
            // Pool files may already be published elsewhere and are never rewritten.
            let local = Sha256Digest::of_file(&path)?;
            if local != file.checksum {
                return Err(GeneratorError::Failed(format!(
                    "{} already exists with checksum {local}, remote has {}",
                    path.display(),
                    file.checksum
                )));
            }
        } else {
            ctx.fetcher
                .fetch_to(&format!("{base}{}", file.path), &path, Some(&file.checksum))
                .await?;
            // An orphaned signature may be left over from an earlier copy.
            crate::io::remove_if_exists(&crate::keys::signature_path(&path))?;
        }

        ensure_signed(ctx, &env.device_name, &path)?;
        let mut meta = ArtifactMetadata::new(NAME).family(family);
        meta.source = Some(format!("{base}{}", file.path));
        if let Some(version) = latest.version_detail.get(family) {
            meta.version = Some(version.to_string());
            env.version_detail.push_pair(family, version);
        }
        meta.write_for(ctx, &env.device_name, &path)?;
        Ok(Some(path))
    }
}
