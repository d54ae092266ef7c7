//! Run configuration.
//!
//! Everything the harvester needs is injected through [`HarvestConfig`];
//! there are no process-wide paths or thresholds. A config can be loaded
//! from JSON, where any omitted field takes its documented default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarvestError, Result};
use crate::model::{BridgeOp, SourcePath};

/// Child count above which a library is pulled as one opaque unit.
pub const DEFAULT_CHILD_THRESHOLD: usize = 999;

/// How session stamps are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    /// Milliseconds since the Unix epoch, bumped to stay strictly increasing
    #[default]
    UnixMillis,
    /// A plain counter starting at 1
    Counter,
}

/// Argument templates for the bridge tool.
///
/// `{device}`, `{path}` and `{dest}` are substituted per invocation; each
/// placeholder must be a whole argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeCommands {
    pub program: String,
    pub devices: Vec<String>,
    pub list: Vec<String>,
    pub reference: Vec<String>,
    pub pull: Vec<String>,
    pub remove: Vec<String>,
    /// Lines of the device table containing this are headers
    pub header_marker: String,
    /// Status field marking a device as usable
    pub ready_token: String,
}

impl Default for BridgeCommands {
    fn default() -> Self {
        fn args(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }

        Self {
            program: "adb".to_string(),
            devices: args(&["devices"]),
            list: args(&["-s", "{device}", "shell", "ls", "{path}"]),
            reference: args(&["-s", "{device}", "shell", "lsof", "{path}"]),
            pull: args(&["-s", "{device}", "pull", "{path}", "{dest}"]),
            remove: args(&["-s", "{device}", "shell", "rm", "-r", "{path}"]),
            header_marker: "List of devices".to_string(),
            ready_token: "device".to_string(),
        }
    }
}

impl BridgeCommands {
    pub fn template(&self, op: BridgeOp) -> &[String] {
        match op {
            BridgeOp::Devices => &self.devices,
            BridgeOp::List => &self.list,
            BridgeOp::Reference => &self.reference,
            BridgeOp::Pull => &self.pull,
            BridgeOp::Remove => &self.remove,
        }
    }

    /// Renders the argument vector for `op`. Missing values render as empty
    /// strings, which [`HarvestConfig::validate`] rules out for required slots.
    pub fn render(
        &self,
        op: BridgeOp,
        device: Option<&str>,
        path: Option<&str>,
        dest: Option<&Path>,
    ) -> Vec<String> {
        self.template(op)
            .iter()
            .map(|arg| match arg.as_str() {
                "{device}" => device.unwrap_or_default().to_string(),
                "{path}" => path.unwrap_or_default().to_string(),
                "{dest}" => dest.map(|d| d.display().to_string()).unwrap_or_default(),
                other => other.to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Root under which destination directories are created
    pub storage_root: PathBuf,

    /// Directory holding temporary command output
    pub scratch_root: PathBuf,

    /// Source paths harvested on every device, in order
    pub source_paths: Vec<SourcePath>,

    pub child_threshold: usize,

    pub session_strategy: SessionStrategy,

    pub bridge: BridgeCommands,

    /// Maximum time a single bridge command may run (seconds)
    pub command_timeout_secs: u64,

    /// How long to wait for an output file after its command exited (ms)
    pub artifact_settle_ms: u64,

    /// Delete each entry from the device once it has been pulled
    pub remove_after_pull: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("crawls"),
            scratch_root: std::env::temp_dir().join("device-harvester"),
            source_paths: SourcePath::ALL.to_vec(),
            child_threshold: DEFAULT_CHILD_THRESHOLD,
            session_strategy: SessionStrategy::default(),
            bridge: BridgeCommands::default(),
            command_timeout_secs: 300,
            artifact_settle_ms: 2_000,
            remove_after_pull: false,
        }
    }
}

impl HarvestConfig {
    /// Loads a JSON config file; omitted fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: HarvestConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn with_source_paths(mut self, paths: Vec<SourcePath>) -> Self {
        self.source_paths = paths;
        self
    }

    pub fn with_child_threshold(mut self, threshold: usize) -> Self {
        self.child_threshold = threshold;
        self
    }

    pub fn with_session_strategy(mut self, strategy: SessionStrategy) -> Self {
        self.session_strategy = strategy;
        self
    }

    pub fn with_bridge_program(mut self, program: impl Into<String>) -> Self {
        self.bridge.program = program.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_remove_after_pull(mut self, remove: bool) -> Self {
        self.remove_after_pull = remove;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn artifact_settle(&self) -> Duration {
        Duration::from_millis(self.artifact_settle_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bridge.program.trim().is_empty() {
            return Err(HarvestError::Config("bridge program is empty".into()));
        }
        if self.source_paths.is_empty() {
            return Err(HarvestError::Config("no source paths configured".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(HarvestError::Config("command timeout must be positive".into()));
        }
        if self.storage_root.as_os_str().is_empty() || self.scratch_root.as_os_str().is_empty() {
            return Err(HarvestError::Config("storage and scratch roots must be set".into()));
        }

        let required: [(BridgeOp, &[&str]); 4] = [
            (BridgeOp::List, &["{device}", "{path}"]),
            (BridgeOp::Reference, &["{device}", "{path}"]),
            (BridgeOp::Pull, &["{device}", "{path}", "{dest}"]),
            (BridgeOp::Remove, &["{device}", "{path}"]),
        ];
        for (op, placeholders) in required {
            let template = self.bridge.template(op);
            for placeholder in placeholders {
                if !template.iter().any(|a| a == placeholder) {
                    return Err(HarvestError::Config(format!(
                        "{} template is missing {}",
                        op, placeholder
                    )));
                }
            }
        }
        Ok(())
    }
}
