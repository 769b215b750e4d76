use std::path::PathBuf;

use async_trait::async_trait;
use sysimg_schema::Sha256Digest;

use super::artifact::{ArtifactMetadata, ensure_signed};
use super::{Environment, Generator, GeneratorArgs, GeneratorContext, GeneratorError};
use crate::keys::KeyRole;
use crate::tarball::write_keyring_tarball;

const NAME: &str = "keyring";

/// Public keyring of one key role, named after its content hash.
///
/// `device-signing` resolves to the key of the device being imported. Like
/// the version tarball it is only produced alongside other new files.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringGenerator;

fn parse_role(role: &str) -> Result<KeyRole, GeneratorError> {
    serde_json::from_value(serde_json::Value::String(role.to_string())).map_err(|_| {
        GeneratorError::InvalidArguments {
            generator: NAME.into(),
            reason: format!("unknown key role '{role}'"),
        }
    })
}

#[async_trait]
impl Generator for KeyringGenerator {
    async fn produce(
        &self,
        ctx: &GeneratorContext,
        args: &GeneratorArgs,
        env: &mut Environment,
    ) -> Result<Option<PathBuf>, GeneratorError> {
        args.check(NAME, 1, &[])?;
        let role = parse_role(args.required(NAME, 0, "key role")?)?;
        if env.new_files.is_empty() {
            return Ok(None);
        }

        let keys = ctx.tree.keys();
        let key = match role {
            KeyRole::DeviceSigning => keys.device_key(&env.device_name),
            other => keys.key(other),
        };
        let Some(key) = key else {
            tracing::debug!(%role, device = %env.device_name, "no key for keyring");
            return Ok(None);
        };

        let pool = ctx.tree.pool_dir();
        std::fs::create_dir_all(&pool)?;
        let staging = tempfile::Builder::new()
            .prefix(".keyring-")
            .tempfile_in(&pool)?;
        write_keyring_tarball(&key.meta, staging.path())?;
        let digest = Sha256Digest::of_file(staging.path())?;
        let path = pool.join(format!("keyring-{}.tar.zst", &digest.as_str()[..16]));
        if path.exists() {
            drop(staging);
        } else {
            staging.persist(&path).map_err(|e| e.error)?;
        }

        ensure_signed(ctx, &env.device_name, &path)?;
        ArtifactMetadata::new(NAME)
            .family(NAME)
            .version(role.to_string())
            .write_for(ctx, &env.device_name, &path)?;
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::tests::{context, environment};
    use crate::tarball;
    use crate::tree::tests::fixture;

    fn changed_env(f: &crate::tree::tests::Fixture) -> Environment {
        let mut env = environment(f, 1);
        env.new_files.push(f.tree.pool_dir().join("ubuntu-1.tar.xz"));
        env
    }

    fn role(name: &str) -> GeneratorArgs {
        GeneratorArgs {
            positional: vec![name.into()],
            ..GeneratorArgs::default()
        }
    }

    #[tokio::test]
    async fn test_keyring_skipped_without_new_files() {
        let f = fixture();
        let ctx = context(&f);
        let mut env = environment(&f, 1);
        let out = KeyringGenerator
            .produce(&ctx, &role("image-master"), &mut env)
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_keyring_is_content_addressed() {
        let f = fixture();
        let ctx = context(&f);
        let mut env = changed_env(&f);

        let first = KeyringGenerator
            .produce(&ctx, &role("image-master"), &mut env)
            .await
            .unwrap()
            .unwrap();
        let second = KeyringGenerator
            .produce(&ctx, &role("image-master"), &mut env)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with(f.tree.pool_dir()));
        assert!(crate::keys::signature_path(&first).exists());

        let json = tarball::read_entry(&first, "keyring.json").unwrap().unwrap();
        let meta: crate::keys::KeyringMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta.role, KeyRole::ImageMaster);

        let other = KeyringGenerator
            .produce(&ctx, &role("blacklist"), &mut env)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_keyring_missing_device_key() {
        let f = fixture();
        let ctx = context(&f);
        let mut env = changed_env(&f);
        let out = KeyringGenerator
            .produce(&ctx, &role("device-signing"), &mut env)
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_keyring_unknown_role() {
        let f = fixture();
        let ctx = context(&f);
        let mut env = environment(&f, 1);
        let err = KeyringGenerator
            .produce(&ctx, &role("gpg"), &mut env)
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::InvalidArguments { .. }));
    }
}
