//! Top-level harvest control.
//!
//! [`HarvestOrchestrator`] enumerates devices and, for each one, opens a
//! crawl session and runs a [`PathPipeline`] for every configured source
//! path, strictly one at a time. Per device the state machine is:
//!
//! ```text
//! Idle -> Enumerating -> Harvesting(source)... -> Done
//! ```
//!
//! Only device enumeration can fail the run as a whole; every other failure
//! is confined to its entry or its (device, source path) pair and surfaces in
//! the returned [`HarvestReport`].
//!
//! # Example
//!
//! ```ignore
//! use device_harvester::{HarvestConfig, HarvestOrchestrator, TokioSpawner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarvestConfig::default().with_storage_root("/data/crawls");
//!     let orchestrator = HarvestOrchestrator::new(config, TokioSpawner)?;
//!     let report = orchestrator.run().await?;
//!     println!("{} devices harvested", report.devices.len());
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HarvestConfig;
use crate::devices;
use crate::error::{HarvestError, Result};
use crate::harvest::layout::StorageLayout;
use crate::harvest::library::LibraryExpansionHandler;
use crate::harvest::pipeline::PathPipeline;
use crate::harvest::session::{CancelFlag, SessionClock};
use crate::ipc::ArtifactStore;
use crate::launcher::BridgeLauncher;
use crate::model::{Device, DeviceReport, HarvestReport, PathOutcome, SourcePath};
use crate::traits::ProcessSpawner;

/// Lifecycle of one device within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Enumerating,
    Harvesting(SourcePath),
    Done,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Idle => f.write_str("idle"),
            DeviceState::Enumerating => f.write_str("enumerating"),
            DeviceState::Harvesting(source) => write!(f, "harvesting({})", source),
            DeviceState::Done => f.write_str("done"),
        }
    }
}

pub struct HarvestOrchestrator<S: ProcessSpawner> {
    config: HarvestConfig,
    launcher: BridgeLauncher<S>,
    layout: StorageLayout,
    expander: LibraryExpansionHandler,
    clock: SessionClock,
    cancel: CancelFlag,
}

impl<S: ProcessSpawner> HarvestOrchestrator<S> {
    /// Builds an orchestrator from a validated configuration.
    ///
    /// # Errors
    ///
    /// [`HarvestError::Config`] if the configuration is inconsistent.
    pub fn new(config: HarvestConfig, spawner: S) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ArtifactStore::new(config.scratch_root.clone()));
        let launcher = BridgeLauncher::new(spawner, config.bridge.clone(), store)
            .with_timeout(config.command_timeout())
            .with_settle_timeout(config.artifact_settle());

        Ok(Self {
            layout: StorageLayout::new(config.storage_root.clone()),
            expander: LibraryExpansionHandler::new(config.child_threshold),
            clock: SessionClock::new(config.session_strategy),
            cancel: CancelFlag::new(),
            launcher,
            config,
        })
    }

    /// Shares an externally owned cancellation flag.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    fn transition(&self, device: Option<&Device>, from: DeviceState, to: DeviceState) {
        match device {
            Some(device) => debug!(%device, %from, %to, "Device state change"),
            None => debug!(%from, %to, "Run state change"),
        }
    }

    /// Harvests every attached device.
    ///
    /// # Errors
    ///
    /// - [`HarvestError::DeviceEnumeration`] if devices cannot be listed
    /// - [`HarvestError::Cancelled`] if cancelled before enumeration
    /// - [`HarvestError::Io`] if the scratch directory cannot be created
    pub async fn run(&self) -> Result<HarvestReport> {
        let start = Instant::now();
        let mut report = HarvestReport::default();

        self.launcher.store().prepare().await?;
        if self.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        self.transition(None, DeviceState::Idle, DeviceState::Enumerating);
        let devices = devices::enumerate(&self.launcher, self.clock.next_stamp()).await?;
        if devices.is_empty() {
            warn!("No ready devices found");
        }

        for device in &devices {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let device_report = self.harvest_device(device).await;
            let cancelled = device_report
                .paths
                .iter()
                .any(|p| p.outcome == PathOutcome::Cancelled);
            report.devices.push(device_report);
            if cancelled {
                report.cancelled = true;
                break;
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        self.log_summary(&report);
        Ok(report)
    }

    /// Runs every configured source path for one device, sequentially.
    pub async fn harvest_device(&self, device: &Device) -> DeviceReport {
        let session = self.clock.begin(device);
        info!(%device, session = session.stamp, "Crawl session started");

        let pipeline = PathPipeline {
            launcher: &self.launcher,
            layout: &self.layout,
            expander: self.expander,
            cancel: &self.cancel,
            remove_after_pull: self.config.remove_after_pull,
        };

        let mut report = DeviceReport {
            device: device.clone(),
            session: session.stamp,
            paths: Vec::with_capacity(self.config.source_paths.len()),
        };

        let mut state = DeviceState::Enumerating;
        for &source in &self.config.source_paths {
            let next = DeviceState::Harvesting(source);
            self.transition(Some(device), state, next);
            state = next;

            let path_report = pipeline.run(&session, source).await;
            let cancelled = path_report.outcome == PathOutcome::Cancelled;
            report.paths.push(path_report);
            if cancelled {
                break;
            }
        }

        self.transition(Some(device), state, DeviceState::Done);
        report
    }

    fn log_summary(&self, report: &HarvestReport) {
        for device in &report.devices {
            let pulled: usize = device.paths.iter().map(|p| p.pulled.len()).sum();
            let failures = device.failure_count();
            if failures == 0 {
                info!(device = %device.device, session = device.session, pulled, "Device harvested");
            } else {
                warn!(
                    device = %device.device,
                    session = device.session,
                    pulled,
                    failures,
                    "Device harvested with failures"
                );
            }
            for path in &device.paths {
                if let PathOutcome::Aborted(reason) = &path.outcome {
                    warn!(device = %device.device, source = %path.source, %reason, "Source path aborted");
                }
            }
        }
        info!(
            devices = report.devices.len(),
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Harvest run finished"
        );
    }
}
