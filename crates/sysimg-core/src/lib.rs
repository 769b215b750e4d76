//! Publishing engine for over-the-air system images.
//!
//! An import run holds a [`session::Session`] (the publish lock plus the
//! opened keys and tree), plans each device's next version with
//! [`planner::VersionPlanner`], drives the [`generators::GeneratorRegistry`]
//! and publishes through [`tree::Tree`]. [`mirror::MirrorSync`] consumes a
//! published tree from the outside.

pub mod config;
pub mod generators;
pub mod importer;
pub mod io;
pub mod keys;
pub mod lock;
pub mod mirror;
pub mod planner;
pub mod session;
pub mod tarball;
pub mod tree;

pub use config::Config;
pub use importer::{DeviceOutcome, ImportOrchestrator, ImportReport};
pub use mirror::{MirrorReport, MirrorSync};
pub use session::Session;

/// User Agent string for core operations
pub const USER_AGENT: &str = concat!("sysimg-core/", env!("CARGO_PKG_VERSION"));
