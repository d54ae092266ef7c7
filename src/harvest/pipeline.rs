//! Per-(device, source path) harvest pipeline.
//!
//! This module provides [`PathPipeline`], which drains one source directory
//! of one device through sequential stages:
//! Listing → Diffing → Classifying → Pulling → Cleanup.
//!
//! Failure handling:
//! - a library candidate whose child listing fails is pulled as one unit
//! - any other failed expansion, or a failed pull, skips that entry only
//! - a failed primary listing or destination creation aborts this pipeline
//! - cancellation is checked between stages and between entries, never
//!   while a bridge command is in flight

use std::fmt;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::error::HarvestError;
use crate::harvest::diff::diff;
use crate::harvest::layout::StorageLayout;
use crate::harvest::library::LibraryExpansionHandler;
use crate::harvest::session::CancelFlag;
use crate::launcher::{BridgeLauncher, BridgeRequest};
use crate::model::{
    remote_join, CrawlSession, DestinationDirectory, EntryFailure, Expansion, Listing, PathOutcome,
    PathReport, SourcePath,
};
use crate::traits::ProcessSpawner;

// ============================================================================
// Stages
// ============================================================================

/// Stage of a running source-path pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Listing,
    Diffing,
    Classifying,
    Pulling,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Listing => "listing",
            Stage::Diffing => "diffing",
            Stage::Classifying => "classifying",
            Stage::Pulling => "pulling",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Drains one source path of one device.
///
/// Borrowed from the orchestrator for the duration of a single run; holds no
/// state of its own between runs.
pub struct PathPipeline<'a, S: ProcessSpawner> {
    pub(crate) launcher: &'a BridgeLauncher<S>,
    pub(crate) layout: &'a StorageLayout,
    pub(crate) expander: LibraryExpansionHandler,
    pub(crate) cancel: &'a CancelFlag,
    pub(crate) remove_after_pull: bool,
}

impl<'a, S: ProcessSpawner> PathPipeline<'a, S> {
    fn enter(&self, session: &CrawlSession, source: SourcePath, stage: Stage) {
        debug!(device = %session.device, %source, %stage, "Entering stage");
    }

    /// Runs every stage for `source` and reports what happened.
    ///
    /// Never fails: problems are recorded in the returned [`PathReport`].
    #[instrument(skip(self, session), fields(device = %session.device, session = session.stamp))]
    pub async fn run(&self, session: &CrawlSession, source: SourcePath) -> PathReport {
        let start = Instant::now();
        let mut report = PathReport::new(source);
        self.drain(session, source, &mut report).await;

        // ====================================================================
        // Stage 5: Cleanup
        // ====================================================================

        self.enter(session, source, Stage::Cleanup);
        let leftovers = self
            .launcher
            .store()
            .purge(&session.device.path_segment(), session.stamp)
            .await;
        if leftovers > 0 {
            debug!(leftovers, "Removed leftover artifacts");
        }

        report.stats.duration_ms = start.elapsed().as_millis() as u64;
        match &report.outcome {
            PathOutcome::Completed => info!(
                pulled = report.pulled.len(),
                failures = report.failures.len(),
                duration_ms = report.stats.duration_ms,
                "Source path completed"
            ),
            PathOutcome::Aborted(reason) => error!(%reason, "Source path aborted"),
            PathOutcome::Cancelled => warn!("Source path cancelled"),
        }
        report
    }

    async fn drain(&self, session: &CrawlSession, source: SourcePath, report: &mut PathReport) {
        if self.cancel.is_cancelled() {
            report.outcome = PathOutcome::Cancelled;
            return;
        }

        // ====================================================================
        // Stage 1: Listing
        // ====================================================================

        self.enter(session, source, Stage::Listing);
        let primary = match self
            .launcher
            .run(&BridgeRequest::list(session, source.remote()))
            .await
        {
            Ok(output) => Listing::parse(&output),
            Err(e) => {
                report.outcome = PathOutcome::Aborted(format!("listing failed: {}", e));
                return;
            }
        };

        let reference = match self
            .launcher
            .run(&BridgeRequest::reference(session, source.remote()))
            .await
        {
            Ok(output) => Listing::parse_reference(&output),
            Err(e) => {
                warn!(error = %e, "Reference listing unavailable, nothing excluded");
                Listing::default()
            }
        };
        report.stats.listed = primary.len();

        if self.cancel.is_cancelled() {
            report.outcome = PathOutcome::Cancelled;
            return;
        }

        // ====================================================================
        // Stage 2: Diffing
        // ====================================================================

        self.enter(session, source, Stage::Diffing);
        let pending = diff(&primary, &reference);
        report.stats.skipped_by_reference = primary.len() - pending.len();
        info!(
            listed = primary.len(),
            pending = pending.len(),
            "Listing diffed against reference"
        );

        if pending.is_empty() {
            return;
        }

        let destination = self
            .layout
            .destination_for(&session.device, source, session.stamp);
        if destination.is_populated().await {
            info!(path = %destination.path.display(), "Destination already populated, reusing");
        }
        if let Err(e) = self.layout.ensure(&destination).await {
            report.outcome = PathOutcome::Aborted(e.to_string());
            return;
        }
        report.destination = Some(destination.path.clone());

        // ====================================================================
        // Stages 3-4: Classifying and Pulling, per entry
        // ====================================================================

        for entry in &pending {
            if self.cancel.is_cancelled() {
                report.outcome = PathOutcome::Cancelled;
                return;
            }

            self.enter(session, source, Stage::Classifying);
            let expansion = match self.expander.resolve(self.launcher, session, source, entry).await {
                Ok(expansion) => expansion,
                // A candidate that cannot be listed is most likely a plain file
                // with a numeric stem; pull it as is.
                Err(e) if e.is_recoverable() => {
                    warn!(%entry, error = %e, "Library candidate not listable, pulling as one unit");
                    Expansion::Leaf
                }
                Err(e) => {
                    warn!(%entry, error = %e, "Skipping entry, expansion failed");
                    report.failures.push(EntryFailure {
                        entry: entry.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                report.outcome = PathOutcome::Cancelled;
                return;
            }

            self.enter(session, source, Stage::Pulling);
            self.pull_entry(session, source, entry, expansion, &destination, report)
                .await;
        }
    }

    async fn pull_entry(
        &self,
        session: &CrawlSession,
        source: SourcePath,
        entry: &str,
        expansion: Expansion,
        destination: &DestinationDirectory,
        report: &mut PathReport,
    ) {
        let remote = remote_join(source.remote(), entry);

        match expansion {
            Expansion::Leaf => {
                self.pull(session, &remote, destination.path(), report).await;
            }
            Expansion::Library {
                overflowed: true,
                children,
            } => {
                report.stats.libraries += 1;
                report.stats.overflowed_libraries += 1;
                info!(
                    %entry,
                    children = children.len(),
                    threshold = self.expander.threshold(),
                    "Library over threshold, pulling as one unit"
                );
                self.pull(session, &remote, destination.path(), report).await;
            }
            Expansion::Library { children, .. } if children.is_empty() => {
                debug!(%entry, "Library candidate has no children, pulling as one unit");
                self.pull(session, &remote, destination.path(), report).await;
            }
            Expansion::Library { children, .. } => {
                report.stats.libraries += 1;
                let library_dest = destination.path().join(entry);
                if let Err(e) = tokio::fs::create_dir_all(&library_dest).await {
                    let e = HarvestError::DestinationCreate {
                        path: library_dest,
                        source: e,
                    };
                    warn!(%entry, error = %e, "Skipping library");
                    report.failures.push(EntryFailure {
                        entry: entry.to_string(),
                        reason: e.to_string(),
                    });
                    return;
                }

                for child in &children {
                    if self.cancel.is_cancelled() {
                        report.outcome = PathOutcome::Cancelled;
                        return;
                    }
                    self.pull(session, &remote_join(&remote, child), &library_dest, report)
                        .await;
                }
            }
        }
    }

    /// Pulls one remote path, then removes it from the device if configured.
    async fn pull(&self, session: &CrawlSession, remote: &str, dest: &Path, report: &mut PathReport) {
        report.stats.pulls_issued += 1;

        if let Err(e) = self
            .launcher
            .run(&BridgeRequest::pull(session, remote, dest))
            .await
        {
            warn!(%remote, error = %e, "Pull failed");
            report.failures.push(EntryFailure {
                entry: remote.to_string(),
                reason: e.to_string(),
            });
            return;
        }
        report.pulled.push(remote.to_string());

        if self.remove_after_pull {
            if let Err(e) = self
                .launcher
                .run(&BridgeRequest::remove(session, remote))
                .await
            {
                warn!(%remote, error = %e, "Pulled but could not remove from device");
                report.failures.push(EntryFailure {
                    entry: remote.to_string(),
                    reason: format!("remove failed: {}", e),
                });
            }
        }
    }
}
