use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

use device_harvester::{
    BridgeInvocation, BridgeOp, CancelFlag, HarvestConfig, HarvestError, HarvestOrchestrator,
    PathOutcome, ProcessExit, ProcessHandle, ProcessSpawner, SessionStrategy, SourcePath,
};

// ============================================================================
// Scripted bridge
// ============================================================================

struct ExitedHandle(i32);

#[async_trait]
impl ProcessHandle for ExitedHandle {
    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        Ok(ProcessExit { code: Some(self.0) })
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Default, Clone)]
struct FakeDevice {
    /// remote directory -> entries; a missing key makes `ls` fail
    listings: HashMap<String, Vec<String>>,
    references: HashMap<String, Vec<String>>,
    failing_pulls: HashSet<String>,
}

impl FakeDevice {
    fn list(mut self, remote: &str, entries: &[&str]) -> Self {
        self.listings
            .insert(remote.to_string(), entries.iter().map(|s| s.to_string()).collect());
        self
    }

    fn list_n(mut self, remote: &str, n: usize) -> Self {
        self.listings
            .insert(remote.to_string(), (0..n).map(|i| format!("IMG_{:05}.jpg", i)).collect());
        self
    }

    fn reference(mut self, remote: &str, entries: &[&str]) -> Self {
        self.references
            .insert(remote.to_string(), entries.iter().map(|s| s.to_string()).collect());
        self
    }

    fn failing_pull(mut self, remote: &str) -> Self {
        self.failing_pulls.insert(remote.to_string());
        self
    }
}

#[derive(Default)]
struct FakeBridge {
    devices: Vec<(String, FakeDevice)>,
    broken_device_table: bool,
    cancel_on_first_pull: Option<CancelFlag>,
    calls: Arc<Mutex<Vec<BridgeInvocation>>>,
}

impl FakeBridge {
    fn device(mut self, id: &str, device: FakeDevice) -> Self {
        self.devices.push((id.to_string(), device));
        self
    }

    fn find(&self, id: Option<&String>) -> Option<&FakeDevice> {
        let id = id?;
        self.devices.iter().find(|(d, _)| d == id).map(|(_, dev)| dev)
    }

    fn respond(&self, inv: &BridgeInvocation) -> (String, i32) {
        let remote = inv.remote.clone().unwrap_or_default();
        match inv.op {
            BridgeOp::Devices if self.broken_device_table => (String::new(), 1),
            BridgeOp::Devices => {
                let mut table = String::from("List of devices attached\n");
                for (id, _) in &self.devices {
                    table.push_str(&format!("{}\tdevice\n", id));
                }
                table.push_str("STALE0001\toffline\n\n");
                (table, 0)
            }
            BridgeOp::List => match self.find(inv.device.as_ref()).and_then(|d| d.listings.get(&remote)) {
                Some(entries) => (entries.join("\r\n"), 0),
                None => (String::new(), 1),
            },
            BridgeOp::Reference => {
                let entries = self
                    .find(inv.device.as_ref())
                    .and_then(|d| d.references.get(&remote))
                    .cloned()
                    .unwrap_or_default();
                (entries.join("\n"), 0)
            }
            BridgeOp::Pull => {
                if let Some(flag) = &self.cancel_on_first_pull {
                    flag.cancel();
                }
                let failing = self
                    .find(inv.device.as_ref())
                    .map(|d| d.failing_pulls.contains(&remote))
                    .unwrap_or(false);
                if failing {
                    return ("adb: error: remote object does not exist".to_string(), 1);
                }
                let dest = inv.dest.clone().unwrap_or_default();
                let name = remote.rsplit('/').next().unwrap_or_default();
                std::fs::write(dest.join(name), b"payload").unwrap();
                (format!("{}: 1 file pulled", remote), 0)
            }
            BridgeOp::Remove => (String::new(), 0),
        }
    }

    fn calls(&self, op: BridgeOp) -> Vec<BridgeInvocation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }
}

/// Spawner handle shared with the test so calls can be inspected after a run.
#[derive(Clone)]
struct SharedBridge(Arc<FakeBridge>);

impl ProcessSpawner for SharedBridge {
    fn spawn(
        &self,
        invocation: &BridgeInvocation,
        output: &Path,
    ) -> std::io::Result<Box<dyn ProcessHandle>> {
        self.0.calls.lock().unwrap().push(invocation.clone());
        let (content, code) = self.0.respond(invocation);
        std::fs::write(output, content)?;
        Ok(Box::new(ExitedHandle(code)))
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Workspace {
    storage: TempDir,
    scratch: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            storage: tempdir().unwrap(),
            scratch: tempdir().unwrap(),
        }
    }

    fn config(&self) -> HarvestConfig {
        HarvestConfig::default()
            .with_storage_root(self.storage.path())
            .with_scratch_root(self.scratch.path())
            .with_source_paths(vec![SourcePath::Downloads])
            .with_session_strategy(SessionStrategy::Counter)
            .with_command_timeout(Duration::from_secs(5))
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path()).unwrap().next().is_none()
    }
}

fn pulled_set(report_pulled: &[String]) -> HashSet<&str> {
    report_pulled.iter().map(String::as_str).collect()
}

const DOWNLOADS: &str = "sdcard/Downloads/";
const LIBRARY: &str = "sdcard/Downloads/123456/";

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_two_devices_end_to_end() {
    let ws = Workspace::new();
    let bridge = Arc::new(
        FakeBridge::default()
            .device(
                "DEV1",
                FakeDevice::default()
                    .list(DOWNLOADS, &["a.txt", "123456", "b.txt"])
                    .reference(DOWNLOADS, &["a.txt"])
                    .list(LIBRARY, &["c1.jpg", "c2.jpg", "c3.jpg", "c4.jpg", "c5.jpg"]),
            )
            .device("DEV2", FakeDevice::default().list(DOWNLOADS, &[])),
    );

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.devices.len(), 2);
    assert!(!report.cancelled);
    assert!(!report.has_failures());

    let dev1 = &report.devices[0];
    assert_eq!(dev1.device.id, "DEV1");
    let downloads = &dev1.paths[0];
    assert_eq!(downloads.outcome, PathOutcome::Completed);
    assert_eq!(
        pulled_set(&downloads.pulled),
        HashSet::from([
            "sdcard/Downloads/123456/c1.jpg",
            "sdcard/Downloads/123456/c2.jpg",
            "sdcard/Downloads/123456/c3.jpg",
            "sdcard/Downloads/123456/c4.jpg",
            "sdcard/Downloads/123456/c5.jpg",
            "sdcard/Downloads/b.txt",
        ])
    );
    assert_eq!(downloads.stats.listed, 3);
    assert_eq!(downloads.stats.skipped_by_reference, 1);
    assert_eq!(downloads.stats.libraries, 1);
    assert_eq!(downloads.stats.overflowed_libraries, 0);

    // Library children land in their own subdirectory
    let dest = downloads.destination.clone().unwrap();
    assert!(dest.starts_with(ws.storage.path().join("downloads")));
    assert!(dest.join("b.txt").is_file());
    assert!(dest.join("123456").join("c3.jpg").is_file());
    assert!(!dest.join("a.txt").exists());

    // Nothing new on DEV2: no destination directory is created
    let dev2 = &report.devices[1];
    assert_eq!(dev2.device.id, "DEV2");
    assert!(dev2.paths[0].pulled.is_empty());
    assert!(dev2.paths[0].destination.is_none());
    assert_ne!(dev1.session, dev2.session);

    // The offline device is never touched
    assert!(bridge
        .calls(BridgeOp::List)
        .iter()
        .all(|c| c.device.as_deref() != Some("STALE0001")));

    assert!(ws.scratch_is_empty());
}

#[tokio::test]
async fn test_overflowing_library_is_pulled_once_as_unit() {
    let ws = Workspace::new();
    let bridge = Arc::new(FakeBridge::default().device(
        "DEV1",
        FakeDevice::default()
            .list(DOWNLOADS, &["123456"])
            .list_n(LIBRARY, 1000),
    ));

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    let pulls = bridge.calls(BridgeOp::Pull);
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].remote.as_deref(), Some("sdcard/Downloads/123456"));

    let path = &report.devices[0].paths[0];
    assert_eq!(path.stats.overflowed_libraries, 1);
    assert_eq!(path.pulled, vec!["sdcard/Downloads/123456".to_string()]);

    // One listing for the source path, one for the library; no deeper descent
    assert_eq!(bridge.calls(BridgeOp::List).len(), 2);
}

#[tokio::test]
async fn test_library_at_threshold_is_expanded() {
    let ws = Workspace::new();
    let bridge = Arc::new(FakeBridge::default().device(
        "DEV1",
        FakeDevice::default()
            .list(DOWNLOADS, &["123456"])
            .list_n(LIBRARY, 999),
    ));

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    let pulls = bridge.calls(BridgeOp::Pull);
    assert_eq!(pulls.len(), 999);
    assert!(pulls
        .iter()
        .all(|p| p.remote.as_deref() != Some("sdcard/Downloads/123456")));
    assert_eq!(report.devices[0].paths[0].stats.overflowed_libraries, 0);
}

#[tokio::test]
async fn test_custom_threshold_applies() {
    let ws = Workspace::new();
    let bridge = Arc::new(FakeBridge::default().device(
        "DEV1",
        FakeDevice::default()
            .list(DOWNLOADS, &["1234567"])
            .list_n("sdcard/Downloads/1234567/", 4),
    ));

    let config = ws.config().with_child_threshold(3);
    let orchestrator = HarvestOrchestrator::new(config, SharedBridge(bridge.clone())).unwrap();
    orchestrator.run().await.unwrap();

    let pulls = bridge.calls(BridgeOp::Pull);
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].remote.as_deref(), Some("sdcard/Downloads/1234567"));
}

#[tokio::test]
async fn test_device_enumeration_failure_aborts_run() {
    let ws = Workspace::new();
    let bridge = FakeBridge {
        broken_device_table: true,
        ..FakeBridge::default()
    };

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(Arc::new(bridge))).unwrap();
    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, HarvestError::DeviceEnumeration(_)));
}

#[tokio::test]
async fn test_listing_failure_aborts_only_that_pair() {
    let ws = Workspace::new();
    let bridge = Arc::new(
        FakeBridge::default()
            // DEV1 has no Downloads directory at all
            .device("DEV1", FakeDevice::default().list("sdcard/Documents/", &["notes.txt"]))
            .device("DEV2", FakeDevice::default().list(DOWNLOADS, &["b.txt"])),
    );

    let config = ws
        .config()
        .with_source_paths(vec![SourcePath::Downloads, SourcePath::Documents]);
    let orchestrator = HarvestOrchestrator::new(config, SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    let dev1 = &report.devices[0];
    assert!(matches!(dev1.paths[0].outcome, PathOutcome::Aborted(_)));
    assert_eq!(dev1.paths[1].outcome, PathOutcome::Completed);
    assert_eq!(dev1.paths[1].pulled, vec!["sdcard/Documents/notes.txt".to_string()]);
    assert_eq!(dev1.failure_count(), 1);

    let dev2 = &report.devices[1];
    assert_eq!(dev2.paths[0].pulled, vec!["sdcard/Downloads/b.txt".to_string()]);
    assert!(report.has_failures());
}

#[tokio::test]
async fn test_failed_pull_skips_entry_and_continues() {
    let ws = Workspace::new();
    let bridge = Arc::new(FakeBridge::default().device(
        "DEV1",
        FakeDevice::default()
            .list(DOWNLOADS, &["bad.bin", "good.txt"])
            .failing_pull("sdcard/Downloads/bad.bin"),
    ));

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    let path = &report.devices[0].paths[0];
    assert_eq!(path.outcome, PathOutcome::Completed);
    assert_eq!(path.pulled, vec!["sdcard/Downloads/good.txt".to_string()]);
    assert_eq!(path.failures.len(), 1);
    assert_eq!(path.failures[0].entry, "sdcard/Downloads/bad.bin");
}

#[tokio::test]
async fn test_unlistable_library_candidate_is_pulled_as_unit() {
    let ws = Workspace::new();
    // "654321" looks like a library but listing it fails
    let bridge = Arc::new(FakeBridge::default().device(
        "DEV1",
        FakeDevice::default().list(DOWNLOADS, &["654321", "c.txt"]),
    ));

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    let path = &report.devices[0].paths[0];
    assert_eq!(path.outcome, PathOutcome::Completed);
    assert!(path.failures.is_empty());
    assert_eq!(
        path.pulled,
        vec![
            "sdcard/Downloads/654321".to_string(),
            "sdcard/Downloads/c.txt".to_string(),
        ]
    );
    assert_eq!(path.stats.libraries, 0);
}

#[tokio::test]
async fn test_numeric_stem_file_is_harvested() {
    let ws = Workspace::new();
    let bridge = Arc::new(FakeBridge::default().device(
        "DEV1",
        FakeDevice::default().list(DOWNLOADS, &["1234567.mp4", "notes.txt"]),
    ));

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    // The candidate is probed as a directory once, then pulled as a file
    let lists = bridge.calls(BridgeOp::List);
    assert_eq!(lists.len(), 2);
    assert_eq!(lists[1].remote.as_deref(), Some("sdcard/Downloads/1234567.mp4/"));

    let path = &report.devices[0].paths[0];
    assert!(path.failures.is_empty());
    assert_eq!(
        pulled_set(&path.pulled),
        HashSet::from(["sdcard/Downloads/1234567.mp4", "sdcard/Downloads/notes.txt"])
    );
    let dest = path.destination.clone().unwrap();
    assert!(dest.join("1234567.mp4").is_file());
    assert!(!report.has_failures());
}

#[tokio::test]
async fn test_lsof_header_does_not_exclude_entries() {
    let ws = Workspace::new();
    let bridge = Arc::new(FakeBridge::default().device(
        "DEV1",
        FakeDevice::default()
            .list(DOWNLOADS, &["NAME", "x.txt", "my notes.txt", "notes.txt"])
            .reference(
                DOWNLOADS,
                &[
                    "COMMAND  PID  USER  FD  TYPE  NAME",
                    "app  123  u0_a1  12r  REG  /sdcard/Downloads/my notes.txt",
                ],
            ),
    ));

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    let path = &report.devices[0].paths[0];
    assert_eq!(path.stats.skipped_by_reference, 1);
    assert_eq!(
        pulled_set(&path.pulled),
        HashSet::from([
            "sdcard/Downloads/NAME",
            "sdcard/Downloads/x.txt",
            "sdcard/Downloads/notes.txt",
        ])
    );
}

#[tokio::test]
async fn test_remove_after_pull_only_for_successful_pulls() {
    let ws = Workspace::new();
    let bridge = Arc::new(FakeBridge::default().device(
        "DEV1",
        FakeDevice::default()
            .list(DOWNLOADS, &["keep.bin", "take.txt"])
            .failing_pull("sdcard/Downloads/keep.bin"),
    ));

    let config = ws.config().with_remove_after_pull(true);
    let orchestrator = HarvestOrchestrator::new(config, SharedBridge(bridge.clone())).unwrap();
    orchestrator.run().await.unwrap();

    let removes = bridge.calls(BridgeOp::Remove);
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0].remote.as_deref(), Some("sdcard/Downloads/take.txt"));
    assert_eq!(
        removes[0].args,
        vec!["-s", "DEV1", "shell", "rm", "-r", "sdcard/Downloads/take.txt"]
    );
}

#[tokio::test]
async fn test_destination_failure_aborts_pipeline() {
    let ws = Workspace::new();
    let blocker: PathBuf = ws.storage.path().join("not-a-dir");
    std::fs::write(&blocker, "file").unwrap();

    let bridge = Arc::new(
        FakeBridge::default().device("DEV1", FakeDevice::default().list(DOWNLOADS, &["b.txt"])),
    );

    let config = ws.config().with_storage_root(&blocker);
    let orchestrator = HarvestOrchestrator::new(config, SharedBridge(bridge.clone())).unwrap();
    let report = orchestrator.run().await.unwrap();

    assert!(matches!(
        report.devices[0].paths[0].outcome,
        PathOutcome::Aborted(_)
    ));
    assert!(bridge.calls(BridgeOp::Pull).is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let ws = Workspace::new();
    let bridge = Arc::new(FakeBridge::default().device("DEV1", FakeDevice::default()));

    let cancel = CancelFlag::new();
    cancel.cancel();
    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone()))
        .unwrap()
        .with_cancel(cancel);

    assert!(matches!(orchestrator.run().await, Err(HarvestError::Cancelled)));
    assert!(bridge.calls(BridgeOp::Devices).is_empty());
}

#[tokio::test]
async fn test_cancellation_stops_between_entries() {
    let ws = Workspace::new();
    let cancel = CancelFlag::new();
    let bridge = Arc::new(FakeBridge {
        cancel_on_first_pull: Some(cancel.clone()),
        ..FakeBridge::default()
            .device("DEV1", FakeDevice::default().list(DOWNLOADS, &["a.txt", "b.txt", "c.txt"]))
            .device("DEV2", FakeDevice::default().list(DOWNLOADS, &["d.txt"]))
    });

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge.clone()))
        .unwrap()
        .with_cancel(cancel);
    let report = orchestrator.run().await.unwrap();

    // The in-flight pull finishes; nothing after it starts
    assert!(report.cancelled);
    assert_eq!(report.devices.len(), 1);
    assert_eq!(report.devices[0].paths[0].outcome, PathOutcome::Cancelled);
    assert_eq!(report.devices[0].paths[0].pulled, vec!["sdcard/Downloads/a.txt".to_string()]);
    assert_eq!(bridge.calls(BridgeOp::Pull).len(), 1);
}

#[tokio::test]
async fn test_report_serializes() {
    let ws = Workspace::new();
    let bridge = Arc::new(
        FakeBridge::default().device("DEV1", FakeDevice::default().list(DOWNLOADS, &["x.txt"])),
    );

    let orchestrator = HarvestOrchestrator::new(ws.config(), SharedBridge(bridge)).unwrap();
    let report = orchestrator.run().await.unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["devices"][0]["device"]["id"], "DEV1");
    assert_eq!(json["devices"][0]["paths"][0]["source"], "downloads");
    assert_eq!(json["devices"][0]["paths"][0]["outcome"]["status"], "completed");
}
