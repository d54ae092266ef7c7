use std::path::PathBuf;
use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::model::{DestinationDirectory, Device, SourcePath};

/// Derives destination directories under the storage root.
///
/// Layout: `<root>/<source>/<device>-<session stamp>`. The path is a pure
/// function of its inputs, so a retried run with the same stamp lands in the
/// same directory and can see what is already there.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn destination_for(&self, device: &Device, source: SourcePath, stamp: u64) -> DestinationDirectory {
        DestinationDirectory {
            path: self
                .root
                .join(source.segment())
                .join(format!("{}-{}", device.path_segment(), stamp)),
        }
    }

    /// Creates the directory and its parents. Safe to call repeatedly or
    /// from concurrent creators.
    pub async fn ensure(&self, destination: &DestinationDirectory) -> Result<()> {
        tokio::fs::create_dir_all(&destination.path)
            .await
            .map_err(|source| HarvestError::DestinationCreate {
                path: destination.path.clone(),
                source,
            })?;
        debug!(path = %destination.path.display(), "Destination ready");
        Ok(())
    }
}
