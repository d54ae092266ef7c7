//! Error types shared by every harvest stage.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::BridgeOp;

/// Errors that can occur while harvesting devices.
///
/// The variants map onto three severities:
/// - [`HarvestError::DeviceEnumeration`] aborts the whole run
/// - [`HarvestError::DestinationCreate`] aborts one (device, source path) pipeline
/// - everything raised for a single entry is recorded and the entry is skipped
#[derive(Error, Debug)]
pub enum HarvestError {
    /// The device listing command failed or produced no readable output
    #[error("Device enumeration failed: {0}")]
    DeviceEnumeration(String),

    /// A command's output file was not present when it was read
    #[error("Artifact missing: '{}'", .path.display())]
    ArtifactMissing { path: PathBuf },

    /// A command did not finish, or its output never appeared, in time
    #[error("Artifact '{}' not ready after {timeout_ms}ms", .path.display())]
    ArtifactTimeout { path: PathBuf, timeout_ms: u64 },

    /// The destination directory for a source path could not be created
    #[error("Failed to create destination '{}': {source}", .path.display())]
    DestinationCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bridge program could not be started
    #[error("Failed to launch '{program}' for {op}: {source}")]
    Launch {
        program: String,
        op: BridgeOp,
        #[source]
        source: std::io::Error,
    },

    /// The bridge program ran but exited unsuccessfully
    #[error("Bridge {op} exited with {}", exit_label(.code))]
    CommandFailed { op: BridgeOp, code: Option<i32> },

    /// Cooperative cancellation was requested
    #[error("Harvest cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    /// Whether the failure only affects the single operation that raised it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HarvestError::ArtifactMissing { .. }
                | HarvestError::ArtifactTimeout { .. }
                | HarvestError::CommandFailed { .. }
                | HarvestError::Launch { .. }
        )
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "signal".to_string(),
    }
}

/// Specialized Result type for harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;
