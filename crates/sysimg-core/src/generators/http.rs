use std::path::PathBuf;

use async_trait::async_trait;

use super::artifact::{ArtifactMetadata, ensure_signed};
use super::{Environment, Generator, GeneratorArgs, GeneratorContext, GeneratorError};

const NAME: &str = "http";

/// File downloaded from a URL.
///
/// `name` is required and becomes the family and the version-detail key.
/// With `monitor`, the body of that URL is the upstream version and the
/// download is skipped when `pool/<name>-<version>` already exists; without
/// it the file is always fetched and versioned by its checksum.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpGenerator;

/// `ubuntu.tar.xz` → `tar.xz`, `boot.img` → `img`.
fn extension_of(url: &str) -> &str {
    let name = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or(url);
    if let Some(idx) = name.find(".tar") {
        return &name[idx + 1..];
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => "bin",
    }
}

fn valid_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '~'))
}

async fn monitored_version(ctx: &GeneratorContext, monitor: &str) -> Result<String, GeneratorError> {
    let key = format!("{NAME}-monitor:{monitor}");
    if let Some(version) = ctx.cached(&key) {
        return Ok(version);
    }
    let body = ctx.fetcher.fetch_bytes(monitor).await?;
    let version = String::from_utf8_lossy(&body).trim().to_string();
    if !valid_version(&version) {
        return Err(GeneratorError::Failed(format!(
            "monitor {monitor} returned an unusable version '{version}'"
        )));
    }
    ctx.remember(&key, &version);
    Ok(version)
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn produce(
        &self,
        ctx: &GeneratorContext,
        args: &GeneratorArgs,
        env: &mut Environment,
    ) -> Result<Option<PathBuf>, GeneratorError> {
        args.check(NAME, 1, &["name", "monitor"])?;
        let url = args.required(NAME, 0, "URL")?;
        let name = args
            .option("name")
            .filter(|n| !n.is_empty() && !n.contains('/'))
            .ok_or_else(|| GeneratorError::InvalidArguments {
                generator: NAME.into(),
                reason: "missing or invalid 'name' option".into(),
            })?;
        let ext = extension_of(url);

        let pool = ctx.tree.pool_dir();
        std::fs::create_dir_all(&pool)?;

        let (version, path) = if let Some(monitor) = args.option("monitor") {
            let version = monitored_version(ctx, monitor).await?;
            let path = pool.join(format!("{name}-{version}.{ext}"));
            if !path.exists() {
                ctx.fetcher.fetch_to(url, &path, None).await?;
            }
            (version, path)
        } else {
            let staging = pool.join(format!(".{name}.download"));
            let digest = ctx.fetcher.fetch_to(url, &staging, None).await?;
            let version = digest.as_str()[..16].to_string();
            let path = pool.join(format!("{name}-{version}.{ext}"));
            if path.exists() {
                std::fs::remove_file(&staging)?;
            } else {
                std::fs::rename(&staging, &path)?;
            }
            (version, path)
        };

        ensure_signed(ctx, &env.device_name, &path)?;
        ArtifactMetadata::new(NAME)
            .family(name)
            .version(version.clone())
            .write_for(ctx, &env.device_name, &path)?;
        env.version_detail.push_pair(name, &version);
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::generators::tests::{context, environment};
    use crate::tree::tests::fixture;

    fn args(url: String, options: &[(&str, String)]) -> GeneratorArgs {
        GeneratorArgs {
            positional: vec![url],
            options: options
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("http://x/ubuntu.tar.xz"), "tar.xz");
        assert_eq!(extension_of("http://x/a/boot.img?dl=1"), "img");
        assert_eq!(extension_of("http://x/latest"), "bin");
    }

    #[tokio::test]
    async fn test_http_with_monitor() {
        let mut server = mockito::Server::new_async().await;
        let monitor = server
            .mock("GET", "/version")
            .with_body("20240101\n")
            .expect(1)
            .create_async()
            .await;
        let file = server
            .mock("GET", "/rootfs.tar.xz")
            .with_body("rootfs")
            .expect(1)
            .create_async()
            .await;

        let f = fixture();
        let ctx = context(&f);
        let a = args(
            format!("{}/rootfs.tar.xz", server.url()),
            &[
                ("name", "ubuntu".into()),
                ("monitor", format!("{}/version", server.url())),
            ],
        );

        let mut env = environment(&f, 1);
        let path = HttpGenerator.produce(&ctx, &a, &mut env).await.unwrap().unwrap();
        assert_eq!(path, f.tree.pool_dir().join("ubuntu-20240101.tar.xz"));
        assert_eq!(std::fs::read(&path).unwrap(), b"rootfs");
        assert_eq!(env.version_detail.get("ubuntu"), Some("20240101"));

        // Second device in the same run: cached monitor, file already there.
        let mut env = environment(&f, 1);
        let again = HttpGenerator.produce(&ctx, &a, &mut env).await.unwrap().unwrap();
        assert_eq!(again, path);

        monitor.assert_async().await;
        file.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_checksum_versioned() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/boot.img")
            .with_body("kernel")
            .expect(2)
            .create_async()
            .await;

        let f = fixture();
        let ctx = context(&f);
        let a = args(format!("{}/boot.img", server.url()), &[("name", "boot".into())]);

        let mut env = environment(&f, 1);
        let first = HttpGenerator.produce(&ctx, &a, &mut env).await.unwrap().unwrap();
        let mut env = environment(&f, 1);
        let second = HttpGenerator.produce(&ctx, &a, &mut env).await.unwrap().unwrap();
        assert_eq!(first, second);
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("boot-") && name.ends_with(".img"));
        assert!(!f.tree.pool_dir().join(".boot.download").exists());
    }

    #[tokio::test]
    async fn test_http_requires_name() {
        let f = fixture();
        let ctx = context(&f);
        let mut env = environment(&f, 1);
        let a = args("http://localhost/x.tar.xz".into(), &[]);
        assert!(matches!(
            HttpGenerator.produce(&ctx, &a, &mut env).await,
            Err(GeneratorError::InvalidArguments { .. })
        ));
    }
}
