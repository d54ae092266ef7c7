use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::model::BridgeOp;

/// A fully rendered bridge command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInvocation {
    pub op: BridgeOp,
    pub program: String,
    pub args: Vec<String>,
    pub device: Option<String>,
    pub remote: Option<String>,
    pub dest: Option<PathBuf>,
}

/// Exit state of a finished bridge process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle on a spawned bridge process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Waits for the process to exit.
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;

    /// Forcibly stops the process.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Starts bridge processes with stdout redirected into `output`.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        invocation: &BridgeInvocation,
        output: &Path,
    ) -> std::io::Result<Box<dyn ProcessHandle>>;
}

/// Spawns real processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

struct TokioHandle(tokio::process::Child);

#[async_trait]
impl ProcessHandle for TokioHandle {
    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let status = self.0.wait().await?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }
}

impl ProcessSpawner for TokioSpawner {
    fn spawn(
        &self,
        invocation: &BridgeInvocation,
        output: &Path,
    ) -> std::io::Result<Box<dyn ProcessHandle>> {
        let stdout = std::fs::File::create(output)?;
        let child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(TokioHandle(child)))
    }
}
