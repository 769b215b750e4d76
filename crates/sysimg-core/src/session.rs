//! One exclusive publish session: the lock plus everything opened under it.

use std::sync::Arc;

use anyhow::{Context, Result};
use sysimg_schema::ChannelsFile;

use crate::config::Config;
use crate::keys::KeyHierarchy;
use crate::lock::PublishLock;
use crate::tarball::ServiceEndpoint;
use crate::tree::Tree;

/// Exclusive access to the publish tree for the lifetime of the value.
#[derive(Debug)]
pub struct Session {
    config: Arc<Config>,
    tree: Tree,
    snapshot: ChannelsFile,
    lock: PublishLock,
}

impl Session {
    /// Take the publish lock and open keys and tree.
    ///
    /// Returns `Ok(None)` when another run holds the lock; nothing is
    /// opened or modified in that case.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file, the keys or the tree cannot be
    /// opened.
    pub fn begin(config: Arc<Config>) -> Result<Option<Self>> {
        let Some(lock) = PublishLock::try_acquire(&config.lock_path())? else {
            return Ok(None);
        };
        let keys = KeyHierarchy::open(&config.key_path)
            .with_context(|| format!("failed to open keys in {}", config.key_path.display()))?;
        let tree = Tree::open(
            &config.publish_path,
            Arc::new(keys),
            ServiceEndpoint::from(config.as_ref()),
        )
        .with_context(|| format!("failed to open tree {}", config.publish_path.display()))?;
        let snapshot = tree.list_channels()?;
        Ok(Some(Self {
            config,
            tree,
            snapshot,
            lock,
        }))
    }

    /// Resolved configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Publish tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Channel topology as it was when the session began.
    pub fn snapshot(&self) -> &ChannelsFile {
        &self.snapshot
    }

    /// Re-read the topology after this session changed it.
    ///
    /// # Errors
    ///
    /// Returns an error if `channels.json` cannot be read.
    pub fn refresh(&mut self) -> Result<&ChannelsFile> {
        self.snapshot = self.tree.list_channels()?;
        Ok(&self.snapshot)
    }

    /// Lock held for the lifetime of the session.
    pub fn lock(&self) -> &PublishLock {
        &self.lock
    }
}
