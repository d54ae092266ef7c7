//! Harvest module - per-device crawl orchestration.
//!
//! This module provides the building blocks driven by the orchestrator:
//! - **Diffing**: [`diff::diff`] filters a listing against a reference
//! - **Libraries**: [`library::classify`] and [`LibraryExpansionHandler`]
//! - **Layout**: collision-free destinations via [`StorageLayout`]
//! - **Sessions**: monotonic stamps and cooperative cancellation
//! - **Pipeline**: one (device, source path) pass via [`PathPipeline`]
//! - **Orchestrator**: the whole run via [`HarvestOrchestrator`]

pub mod diff;
pub mod layout;
pub mod library;
pub mod orchestrator;
pub mod pipeline;
pub mod session;

// Re-export commonly used types
pub use diff::diff;
pub use layout::StorageLayout;
pub use library::{classify, LibraryExpansionHandler};
pub use orchestrator::{DeviceState, HarvestOrchestrator};
pub use pipeline::{PathPipeline, Stage};
pub use session::{CancelFlag, SessionClock};
