use std::path::PathBuf;

use async_trait::async_trait;

use super::artifact::{ArtifactMetadata, ensure_signed};
use super::{Environment, Generator, GeneratorArgs, GeneratorContext, GeneratorError};
use crate::tarball::{VersionTarball, version_tarball_name};

const NAME: &str = "version";

/// Per-device `version-<N>.tar.zst` carrying `channel.ini`.
///
/// Only produced when some other file of the image is new, so an import
/// with nothing changed yields no image.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionGenerator;

#[async_trait]
impl Generator for VersionGenerator {
    async fn produce(
        &self,
        ctx: &GeneratorContext,
        args: &GeneratorArgs,
        env: &mut Environment,
    ) -> Result<Option<PathBuf>, GeneratorError> {
        args.check(NAME, 0, &[])?;
        if env.new_files.is_empty() {
            return Ok(None);
        }

        env.version_detail.push_pair("version", env.version);

        let dir = env.device.dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(version_tarball_name(env.version));
        if !path.exists() {
            VersionTarball {
                channel: &env.channel_name,
                device: &env.device_name,
                version: env.version,
                channel_target: None,
                version_detail: Some(&env.version_detail),
            }
            .write(ctx.tree.endpoint(), &path)?;
            tracing::debug!(path = %path.display(), "wrote version tarball");
        }
        ensure_signed(ctx, &env.device_name, &path)?;
        ArtifactMetadata::new(NAME)
            .family(NAME)
            .version(env.version.to_string())
            .write_for(ctx, &env.device_name, &path)?;
        Ok(Some(path))
    }
}
