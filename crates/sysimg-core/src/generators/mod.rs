//! Pluggable file producers.
//!
//! A channel's `files` list names a generator per logical file. For every
//! device being imported the orchestrator calls [`Generator::produce`] with
//! the parsed arguments and a mutable [`Environment`]; the generator returns
//! the absolute path of a signed file inside the publish root, or `None`
//! when it has nothing to offer (which cancels that device's image).
//!
//! Built-in generators:
//!
//! | Name                  | Produces                                          |
//! |-----------------------|---------------------------------------------------|
//! | `version`             | `version-<N>.tar.zst` with `channel.ini`          |
//! | `keyring`             | public keyring archive for one key role           |
//! | `http`                | a file downloaded from a URL                      |
//! | `system-image`        | a file reused from another local channel          |
//! | `remote-system-image` | a file fetched from another publishing server     |

pub mod artifact;
pub mod delta;
mod http;
mod keyring;
mod remote;
mod system_image;
mod version;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sysimg_schema::VersionDetail;
use thiserror::Error;

pub use http::HttpGenerator;
pub use keyring::KeyringGenerator;
pub use remote::RemoteSystemImageGenerator;
pub use system_image::SystemImageGenerator;
pub use version::VersionGenerator;

use crate::config::{Config, FileSpec};
use crate::io::{FetchError, Fetcher};
use crate::keys::KeyError;
use crate::tree::{Device, Tree, TreeError};

/// Why a generator produced nothing usable.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// No generator is registered under this name.
    #[error("unknown generator '{0}'")]
    UnknownGenerator(String),

    /// The file spec does not fit the generator.
    #[error("{generator}: invalid arguments: {reason}")]
    InvalidArguments {
        /// Generator name.
        generator: String,
        /// What is wrong.
        reason: String,
    },

    /// The generator ran past the configured timeout.
    #[error("generator timed out after {0:?}")]
    Timeout(Duration),

    /// A download failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Signing failed.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The publish tree could not be read or written.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Local I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A document did not (de)serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other generator-specific failure.
    #[error("{0}")]
    Failed(String),
}

/// Positional arguments and options of one file spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorArgs {
    /// Positional arguments.
    pub positional: Vec<String>,
    /// Named options.
    pub options: BTreeMap<String, String>,
}

impl GeneratorArgs {
    /// Arguments of `spec`.
    pub fn from_spec(spec: &FileSpec) -> Self {
        Self {
            positional: spec.arguments.clone(),
            options: spec.options.clone(),
        }
    }

    /// Reject unknown options and surplus positional arguments.
    ///
    /// # Errors
    ///
    /// Returns [`GeneratorError::InvalidArguments`] naming the offender.
    pub fn check(
        &self,
        generator: &str,
        max_positional: usize,
        options: &[&str],
    ) -> Result<(), GeneratorError> {
        if self.positional.len() > max_positional {
            return Err(invalid(
                generator,
                format!(
                    "expected at most {max_positional} arguments, got {}",
                    self.positional.len()
                ),
            ));
        }
        if let Some(unknown) = self.options.keys().find(|k| !options.contains(&k.as_str())) {
            return Err(invalid(generator, format!("unknown option '{unknown}'")));
        }
        Ok(())
    }

    /// Required positional argument `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`GeneratorError::InvalidArguments`] if it is missing or empty.
    pub fn required(&self, generator: &str, idx: usize, what: &str) -> Result<&str, GeneratorError> {
        self.positional
            .get(idx)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid(generator, format!("missing {what}")))
    }

    /// Value of option `key`.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

fn invalid(generator: &str, reason: String) -> GeneratorError {
    GeneratorError::InvalidArguments {
        generator: generator.to_string(),
        reason,
    }
}

/// Per-device state threaded through every generator call of one image.
#[derive(Debug)]
pub struct Environment {
    /// Channel being imported.
    pub channel_name: String,
    /// Device being imported.
    pub device_name: String,
    /// Handle on the device index.
    pub device: Device,
    /// Version of the image under construction.
    pub version: u64,
    /// Generators append their component tags here.
    pub version_detail: VersionDetail,
    /// Files classified as new so far in this image.
    pub new_files: Vec<PathBuf>,
}

/// Shared services for one import run.
pub struct GeneratorContext {
    /// Resolved configuration.
    pub config: Arc<Config>,
    /// Publish tree.
    pub tree: Tree,
    /// Downloader shared by every generator.
    pub fetcher: Arc<dyn Fetcher>,
    cache: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for GeneratorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorContext")
            .field("publish", &self.tree.root())
            .finish_non_exhaustive()
    }
}

impl GeneratorContext {
    /// Context with an empty run cache.
    pub fn new(config: Arc<Config>, tree: Tree, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            tree,
            fetcher,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Value remembered for `key` during this run.
    pub fn cached(&self, key: &str) -> Option<String> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Remember `value` under `key` until the run ends.
    pub fn remember(&self, key: &str, value: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }
}

/// Producer of one kind of image file.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce this file for `env`, or `None` if there is nothing to publish.
    ///
    /// # Errors
    ///
    /// Any error cancels the image of this device.
    async fn produce(
        &self,
        ctx: &GeneratorContext,
        args: &GeneratorArgs,
        env: &mut Environment,
    ) -> Result<Option<PathBuf>, GeneratorError>;

    /// Delta of `new` against `base`; `None` means no delta is needed.
    ///
    /// # Errors
    ///
    /// Any error cancels the image of this device.
    async fn produce_delta(
        &self,
        ctx: &GeneratorContext,
        base: &Path,
        new: &Path,
        device: &str,
    ) -> Result<Option<PathBuf>, GeneratorError> {
        delta::zstd_delta(ctx, base, new, device).await
    }
}

/// Generators by name.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: BTreeMap<String, Arc<dyn Generator>>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("generators", &self.generators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GeneratorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in generator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("version", VersionGenerator);
        registry.register("keyring", KeyringGenerator);
        registry.register("http", HttpGenerator);
        registry.register("system-image", SystemImageGenerator);
        registry.register("remote-system-image", RemoteSystemImageGenerator);
        registry
    }

    /// Add or replace a generator.
    pub fn register(&mut self, name: impl Into<String>, generator: impl Generator + 'static) {
        self.generators.insert(name.into(), Arc::new(generator));
    }

    /// # Errors
    ///
    /// Returns [`GeneratorError::UnknownGenerator`] for unregistered names.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Generator>, GeneratorError> {
        self.generators
            .get(name)
            .cloned()
            .ok_or_else(|| GeneratorError::UnknownGenerator(name.to_string()))
    }

    /// Registered generator names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.generators.keys().map(String::as_str)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::io::HttpFetcher;
    use crate::tree::tests::Fixture;

    pub(crate) fn context(f: &Fixture) -> GeneratorContext {
        let config = Config::from_toml_str("", Path::new("test.toml"), Some(f.tmp.path())).unwrap();
        GeneratorContext::new(
            Arc::new(config),
            f.tree.clone(),
            Arc::new(HttpFetcher::new(Duration::from_secs(10)).unwrap()),
        )
    }

    pub(crate) fn environment(f: &Fixture, version: u64) -> Environment {
        if !f.tree.list_channels().unwrap().contains("stable") {
            f.tree.create_channel("stable").unwrap();
            f.tree.create_device("stable", "mako", None).unwrap();
        }
        Environment {
            channel_name: "stable".into(),
            device_name: "mako".into(),
            device: f.tree.get_device("stable", "mako").unwrap(),
            version,
            version_detail: VersionDetail::new(),
            new_files: vec![],
        }
    }

    #[test]
    fn test_registry_builtins() {
        let registry = GeneratorRegistry::with_builtins();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec!["http", "keyring", "remote-system-image", "system-image", "version"]
        );
        assert!(matches!(
            registry.get("cdimage-ubuntu"),
            Err(GeneratorError::UnknownGenerator(_))
        ));
    }

    #[test]
    fn test_args_check() {
        let args = GeneratorArgs {
            positional: vec!["a".into(), "b".into()],
            options: BTreeMap::from([("name".to_string(), "x".to_string())]),
        };
        assert!(args.check("http", 2, &["name"]).is_ok());
        assert!(args.check("http", 1, &["name"]).is_err());
        assert!(matches!(
            args.check("http", 2, &["monitor"]),
            Err(GeneratorError::InvalidArguments { .. })
        ));
        assert_eq!(args.required("http", 1, "b").unwrap(), "b");
        assert!(args.required("http", 2, "c").is_err());
        assert_eq!(args.option("name"), Some("x"));
    }

    #[test]
    fn test_context_cache() {
        let f = crate::tree::tests::fixture();
        let ctx = context(&f);
        assert_eq!(ctx.cached("k"), None);
        ctx.remember("k", "v");
        assert_eq!(ctx.cached("k").as_deref(), Some("v"));
    }
}
