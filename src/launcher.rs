use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::BridgeCommands;
use crate::error::{HarvestError, Result};
use crate::ipc::{ArtifactStore, TempArtifact};
use crate::model::{BridgeOp, CrawlSession};
use crate::traits::{BridgeInvocation, ProcessExit, ProcessHandle, ProcessSpawner};

/// Owner segment for artifacts that do not belong to a device session.
const HOST_OWNER: &str = "host";

/// One bridge operation to launch.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub op: BridgeOp,
    pub owner: String,
    pub stamp: u64,
    pub device: Option<String>,
    pub remote: Option<String>,
    pub dest: Option<PathBuf>,
}

impl BridgeRequest {
    pub fn devices(stamp: u64) -> Self {
        Self {
            op: BridgeOp::Devices,
            owner: HOST_OWNER.to_string(),
            stamp,
            device: None,
            remote: None,
            dest: None,
        }
    }

    fn for_session(op: BridgeOp, session: &CrawlSession, remote: &str) -> Self {
        Self {
            op,
            owner: session.device.path_segment(),
            stamp: session.stamp,
            device: Some(session.device.id.clone()),
            remote: Some(remote.to_string()),
            dest: None,
        }
    }

    pub fn list(session: &CrawlSession, remote: &str) -> Self {
        Self::for_session(BridgeOp::List, session, remote)
    }

    pub fn reference(session: &CrawlSession, remote: &str) -> Self {
        Self::for_session(BridgeOp::Reference, session, remote)
    }

    pub fn pull(session: &CrawlSession, remote: &str, dest: &Path) -> Self {
        let mut request = Self::for_session(BridgeOp::Pull, session, remote);
        request.dest = Some(dest.to_path_buf());
        request
    }

    pub fn remove(session: &CrawlSession, remote: &str) -> Self {
        Self::for_session(BridgeOp::Remove, session, remote)
    }
}

/// A launched command whose output has not been collected yet.
pub struct PendingCommand {
    op: BridgeOp,
    artifact: TempArtifact,
    handle: Box<dyn ProcessHandle>,
}

impl PendingCommand {
    pub fn artifact(&self) -> &TempArtifact {
        &self.artifact
    }
}

/// A command that exited, with its still-unread output.
#[derive(Debug)]
pub struct CompletedCommand {
    pub exit: ProcessExit,
    pub artifact: TempArtifact,
}

/// Launches bridge commands and synchronizes on their completion.
///
/// [`launch`](Self::launch) returns as soon as the process has started;
/// [`complete`](Self::complete) waits for it to exit (bounded by the command
/// timeout) and for its artifact to appear before anything reads it.
pub struct BridgeLauncher<S: ProcessSpawner> {
    spawner: S,
    commands: BridgeCommands,
    store: Arc<ArtifactStore>,
    command_timeout: Duration,
    settle_timeout: Duration,
}

impl<S: ProcessSpawner> BridgeLauncher<S> {
    pub fn new(spawner: S, commands: BridgeCommands, store: Arc<ArtifactStore>) -> Self {
        Self {
            spawner,
            commands,
            store,
            command_timeout: Duration::from_secs(300),
            settle_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub fn commands(&self) -> &BridgeCommands {
        &self.commands
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Renders the command line for `request` without starting it.
    pub fn invocation(&self, request: &BridgeRequest) -> BridgeInvocation {
        BridgeInvocation {
            op: request.op,
            program: self.commands.program.clone(),
            args: self.commands.render(
                request.op,
                request.device.as_deref(),
                request.remote.as_deref(),
                request.dest.as_deref(),
            ),
            device: request.device.clone(),
            remote: request.remote.clone(),
            dest: request.dest.clone(),
        }
    }

    /// Starts the command with its output directed to a fresh artifact.
    pub fn launch(&self, request: &BridgeRequest) -> Result<PendingCommand> {
        let invocation = self.invocation(request);
        let artifact = self.store.allocate(&request.owner, request.stamp, request.op);

        debug!(
            op = %request.op,
            args = ?invocation.args,
            artifact = %artifact.path().display(),
            "Launching bridge command"
        );

        let handle = self
            .spawner
            .spawn(&invocation, artifact.path())
            .map_err(|source| HarvestError::Launch {
                program: invocation.program.clone(),
                op: request.op,
                source,
            })?;

        Ok(PendingCommand {
            op: request.op,
            artifact,
            handle,
        })
    }

    /// Waits for a pending command to exit and its artifact to be present.
    ///
    /// On timeout the process is killed and its artifact discarded.
    pub async fn complete(&self, pending: PendingCommand) -> Result<CompletedCommand> {
        let PendingCommand {
            op,
            artifact,
            mut handle,
        } = pending;

        let exit = match timeout(self.command_timeout, handle.wait()).await {
            Ok(exit) => exit?,
            Err(_) => {
                warn!(%op, timeout_secs = self.command_timeout.as_secs(), "Bridge command timed out");
                if let Err(e) = handle.kill().await {
                    warn!(%op, error = %e, "Failed to kill timed-out bridge command");
                }
                return Err(HarvestError::ArtifactTimeout {
                    path: artifact.path().to_path_buf(),
                    timeout_ms: self.command_timeout.as_millis() as u64,
                });
            }
        };

        self.store
            .await_ready(artifact.path(), self.settle_timeout)
            .await?;

        Ok(CompletedCommand { exit, artifact })
    }

    /// Launches, waits, and reads the command's output.
    ///
    /// A non-zero exit becomes [`HarvestError::CommandFailed`]; the artifact
    /// is consumed either way.
    #[instrument(skip(self, request), fields(op = %request.op, device = ?request.device, remote = ?request.remote))]
    pub async fn run(&self, request: &BridgeRequest) -> Result<String> {
        let pending = self.launch(request)?;
        let CompletedCommand { exit, artifact } = self.complete(pending).await?;
        let output = self.store.consume(artifact).await?;

        if !exit.success() {
            return Err(HarvestError::CommandFailed {
                op: request.op,
                code: exit.code,
            });
        }
        Ok(output)
    }
}
