//! Filesystem and network helpers.

pub mod fetch;

use std::path::Path;

pub use fetch::{FetchError, Fetcher, HttpFetcher};

/// Remove a file, treating "already gone" as success.
///
/// # Errors
///
/// Returns any error other than `NotFound`.
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
