use std::path::PathBuf;

use async_trait::async_trait;

use super::artifact::{ArtifactMetadata, ensure_signed, family_of};
use super::{Environment, Generator, GeneratorArgs, GeneratorContext, GeneratorError};
use crate::tree::TreeError;

const NAME: &str = "system-image";

/// File reused from the latest full image of another local channel.
///
/// Arguments are the source channel and the artifact family; the `device`
/// option picks a different source device. Nothing is copied: the image
/// simply references the same pool file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemImageGenerator;

#[async_trait]
impl Generator for SystemImageGenerator {
    async fn produce(
        &self,
        ctx: &GeneratorContext,
        args: &GeneratorArgs,
        env: &mut Environment,
    ) -> Result<Option<PathBuf>, GeneratorError> {
        args.check(NAME, 2, &["device"])?;
        let channel = args.required(NAME, 0, "source channel")?;
        let family = args.required(NAME, 1, "family")?;
        let device_name = args.option("device").unwrap_or(&env.device_name);

        let source = match ctx.tree.get_device(channel, device_name) {
            Ok(device) => device,
            Err(TreeError::MissingChannel(_) | TreeError::MissingDevice { .. }) => {
                tracing::debug!(channel, device = device_name, "no source device");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let index = source.index()?;
        let Some(latest) = index.latest_full() else {
            return Ok(None);
        };

        for file in &latest.files {
            let path = ctx.tree.abs_path(&file.path);
            if family_of(&path) != family {
                continue;
            }
            if !path.exists() {
                return Err(GeneratorError::Failed(format!(
                    "{} is listed in {channel}/{device_name} but missing",
                    file.path
                )));
            }
            ensure_signed(ctx, &env.device_name, &path)?;
            if let Some(version) = ArtifactMetadata::load(&path).and_then(|m| m.version) {
                env.version_detail.push_pair(family, version);
            }
            return Ok(Some(path));
        }
        Ok(None)
    }
}
