//! Device enumeration through the bridge tool's device table.

use tracing::{debug, info};

use crate::error::{HarvestError, Result};
use crate::launcher::{BridgeLauncher, BridgeRequest};
use crate::model::Device;
use crate::traits::ProcessSpawner;

/// Parses the bridge tool's tabular device listing.
///
/// Header and blank lines are discarded. A line is a device only when one of
/// the fields after the first equals `ready_token`; the identifier is the
/// first whitespace-delimited field. Duplicates keep their first position.
pub fn parse_device_table(output: &str, header_marker: &str, ready_token: &str) -> Vec<Device> {
    let mut devices: Vec<Device> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.contains(header_marker) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(id) = fields.next() else { continue };
        if !fields.any(|f| f == ready_token) {
            debug!(line, "Ignoring device not in ready state");
            continue;
        }
        if !devices.iter().any(|d| d.id == id) {
            devices.push(Device::new(id));
        }
    }
    devices
}

/// Runs the device listing command and parses its output.
///
/// # Errors
///
/// Any failure is reported as [`HarvestError::DeviceEnumeration`], which
/// aborts the run.
pub async fn enumerate<S: ProcessSpawner>(
    launcher: &BridgeLauncher<S>,
    stamp: u64,
) -> Result<Vec<Device>> {
    let output = launcher
        .run(&BridgeRequest::devices(stamp))
        .await
        .map_err(|e| HarvestError::DeviceEnumeration(e.to_string()))?;

    let commands = launcher.commands();
    let devices = parse_device_table(&output, &commands.header_marker, &commands.ready_token);
    info!(count = devices.len(), "Enumerated devices");
    Ok(devices)
}
