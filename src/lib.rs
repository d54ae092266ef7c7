pub mod config;
pub mod devices;
pub mod error;
pub mod harvest;
pub mod ipc;
pub mod launcher;
pub mod logging;
pub mod model;
pub mod traits;

// Re-export common types for convenience
pub use config::*;
pub use error::{HarvestError, Result};
pub use harvest::*;
pub use ipc::{ArtifactStore, TempArtifact};
pub use launcher::*;
pub use model::*;
pub use traits::*;
