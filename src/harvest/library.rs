//! Library detection and one-level expansion.
//!
//! Some asset directories on a device are named as bare numeric ids of
//! bounded length and hold many small items. These "libraries" are listed
//! and their children pulled individually, unless they hold more than the
//! configured threshold, in which case the whole directory is pulled as a
//! single opaque unit. Expansion never descends more than one level.

use tracing::debug;

use crate::config::DEFAULT_CHILD_THRESHOLD;
use crate::error::Result;
use crate::launcher::{BridgeLauncher, BridgeRequest};
use crate::model::{remote_join, CrawlSession, EntryKind, Expansion, Listing, SourcePath};
use crate::traits::ProcessSpawner;

const MIN_LIBRARY_STEM: usize = 6;
const MAX_LIBRARY_STEM: usize = 7;

/// Classifies an entry name. Total over all strings.
///
/// The stem (everything before the first `.`) must be 6 or 7 characters
/// long and consist only of ASCII digits to count as a library candidate.
pub fn classify(entry: &str) -> EntryKind {
    let stem = entry.split('.').next().unwrap_or_default();
    let len = stem.chars().count();

    if (MIN_LIBRARY_STEM..=MAX_LIBRARY_STEM).contains(&len) && stem.chars().all(|c| c.is_ascii_digit()) {
        EntryKind::LibraryCandidate
    } else {
        EntryKind::File
    }
}

/// Lists library candidates and decides whether they overflow.
#[derive(Debug, Clone, Copy)]
pub struct LibraryExpansionHandler {
    threshold: usize,
}

impl Default for LibraryExpansionHandler {
    fn default() -> Self {
        Self::new(DEFAULT_CHILD_THRESHOLD)
    }
}

impl LibraryExpansionHandler {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Lists the immediate children of `entry` under `source` on the device.
    pub async fn expand<S: ProcessSpawner>(
        &self,
        launcher: &BridgeLauncher<S>,
        session: &CrawlSession,
        source: SourcePath,
        entry: &str,
    ) -> Result<Listing> {
        let remote = format!("{}/", remote_join(source.remote(), entry));
        let output = launcher.run(&BridgeRequest::list(session, &remote)).await?;
        let children = Listing::parse(&output);
        debug!(entry, children = children.len(), "Expanded library candidate");
        Ok(children)
    }

    /// Tags a child listing: more than `threshold` children overflows.
    pub fn settle(&self, children: Listing) -> Expansion {
        let overflowed = children.len() > self.threshold;
        Expansion::Library {
            children,
            overflowed,
        }
    }

    /// Classifies `entry` and expands it when it is a library candidate.
    pub async fn resolve<S: ProcessSpawner>(
        &self,
        launcher: &BridgeLauncher<S>,
        session: &CrawlSession,
        source: SourcePath,
        entry: &str,
    ) -> Result<Expansion> {
        match classify(entry) {
            EntryKind::File => Ok(Expansion::Leaf),
            EntryKind::LibraryCandidate => {
                let children = self.expand(launcher, session, source, entry).await?;
                Ok(self.settle(children))
            }
        }
    }
}
