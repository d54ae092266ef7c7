use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One attached device reachable through the bridge tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Filesystem-safe rendering of the id. Injective, so distinct ids never
    /// share a segment: anything outside `[A-Za-z0-9._-]` is written `%XX`.
    pub fn path_segment(&self) -> String {
        let mut out = String::with_capacity(self.id.len());
        for b in self.id.bytes() {
            match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
                _ => out.push_str(&format!("%{:02X}", b)),
            }
        }
        out
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A configured root directory to harvest on every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePath {
    Documents,
    Downloads,
    Media,
}

impl SourcePath {
    pub const ALL: [SourcePath; 3] = [SourcePath::Documents, SourcePath::Downloads, SourcePath::Media];

    /// Directory on the device, always ending in `/`.
    pub fn remote(&self) -> &'static str {
        match self {
            SourcePath::Documents => "sdcard/Documents/",
            SourcePath::Downloads => "sdcard/Downloads/",
            SourcePath::Media => "sdcard/DCIM/",
        }
    }

    /// Segment used for this source under the storage root.
    pub fn segment(&self) -> &'static str {
        match self {
            SourcePath::Documents => "documents",
            SourcePath::Downloads => "downloads",
            SourcePath::Media => "media",
        }
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

impl FromStr for SourcePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "documents" => Ok(SourcePath::Documents),
            "downloads" => Ok(SourcePath::Downloads),
            "media" => Ok(SourcePath::Media),
            other => Err(format!(
                "unknown source path '{}' (expected documents, downloads or media)",
                other
            )),
        }
    }
}

/// Joins a device-side directory and an entry name with exactly one `/`.
pub fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// One harvesting pass over one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlSession {
    pub device: Device,
    /// Unique per run, strictly increasing in creation order
    pub stamp: u64,
}

/// The logical operations issued against the bridge tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeOp {
    Devices,
    List,
    Reference,
    Pull,
    Remove,
}

impl BridgeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeOp::Devices => "devices",
            BridgeOp::List => "list",
            BridgeOp::Reference => "reference",
            BridgeOp::Pull => "pull",
            BridgeOp::Remove => "remove",
        }
    }
}

impl fmt::Display for BridgeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered entry names returned by a directory enumeration.
///
/// Never mutated in place; filtering produces a new listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Listing(Vec<String>);

impl Listing {
    pub fn new(entries: Vec<String>) -> Self {
        Self(entries)
    }

    /// Parses one entry per line, dropping blank lines and `\r`.
    pub fn parse(output: &str) -> Self {
        Self(
            output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Parses `lsof`-style output into entry names.
    ///
    /// The `COMMAND ...` header row is dropped. On a row that carries a path
    /// the name is the final segment of everything from the first `/`, so
    /// names with spaces survive. Plain one-name-per-line output passes
    /// through.
    pub fn parse_reference(output: &str) -> Self {
        Self(
            output
                .lines()
                .map(str::trim)
                .filter(|l| l.split_whitespace().next().is_some_and(|f| f != "COMMAND"))
                .filter_map(|l| {
                    let path = match l.find('/') {
                        Some(i) => l[i..].trim_end_matches('/'),
                        None => l,
                    };
                    path.rsplit('/').next()
                })
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|e| e == name)
    }
}

impl FromIterator<String> for Listing {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Listing {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Verdict of the library naming heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    File,
    LibraryCandidate,
}

/// Result of expanding a library candidate one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    Leaf,
    Library { children: Listing, overflowed: bool },
}

/// Final on-disk location for one (device, source path, session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DestinationDirectory {
    pub path: PathBuf,
}

impl DestinationDirectory {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when a previous run already left content here.
    pub async fn is_populated(&self) -> bool {
        match tokio::fs::read_dir(&self.path).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Run Reports
// ============================================================================

/// Outcome of one (device, source path) pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "reason")]
pub enum PathOutcome {
    Completed,
    Aborted(String),
    Cancelled,
}

/// An entry that was skipped, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct EntryFailure {
    pub entry: String,
    pub reason: String,
}

/// Timing and volume figures for one pipeline.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PathStats {
    pub listed: usize,
    pub skipped_by_reference: usize,
    pub libraries: usize,
    pub overflowed_libraries: usize,
    pub pulls_issued: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathReport {
    pub source: SourcePath,
    pub destination: Option<PathBuf>,
    /// Remote paths pulled successfully, in pull order
    pub pulled: Vec<String>,
    pub failures: Vec<EntryFailure>,
    pub outcome: PathOutcome,
    pub stats: PathStats,
}

impl PathReport {
    pub fn new(source: SourcePath) -> Self {
        Self {
            source,
            destination: None,
            pulled: Vec::new(),
            failures: Vec::new(),
            outcome: PathOutcome::Completed,
            stats: PathStats::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device: Device,
    pub session: u64,
    pub paths: Vec<PathReport>,
}

impl DeviceReport {
    /// Aborted pipelines plus skipped entries across all paths.
    pub fn failure_count(&self) -> usize {
        self.paths
            .iter()
            .map(|p| p.failures.len() + usize::from(matches!(p.outcome, PathOutcome::Aborted(_))))
            .sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestReport {
    pub devices: Vec<DeviceReport>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl HarvestReport {
    pub fn has_failures(&self) -> bool {
        self.devices.iter().any(|d| d.failure_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_segment_is_injective() {
        let a = Device::new("192.168.1.5:5555");
        let b = Device::new("192.168.1.5_5555");
        assert_eq!(a.path_segment(), "192.168.1.5%3A5555");
        assert_ne!(a.path_segment(), b.path_segment());
        assert_eq!(Device::new("emulator-5554").path_segment(), "emulator-5554");
    }

    #[test]
    fn test_listing_parse_drops_blank_lines() {
        let listing = Listing::parse("a.txt\r\n\r\n123456\r\nb.txt\n");
        assert_eq!(listing.entries(), &["a.txt", "123456", "b.txt"]);
    }

    #[test]
    fn test_reference_parse_takes_basename() {
        let out = "COMMAND PID USER FD TYPE NAME\n\
                   app 123 u0 12r REG /sdcard/Downloads/a.txt\n\
                   b.txt\n";
        let listing = Listing::parse_reference(out);
        assert!(listing.contains("a.txt"));
        assert!(listing.contains("b.txt"));
    }

    #[test]
    fn test_reference_parse_skips_header_and_keeps_spaces() {
        let out = "COMMAND     PID   USER   FD   TYPE  DEVICE  SIZE/OFF  NODE NAME\n\
                   app       123   u0_a1  12r  REG   253,0   4096      77   /sdcard/Downloads/my notes.txt\n\
                   player    456   u0_a2  3u   DIR   253,0   3452      78   /sdcard/Downloads/123456/\n";
        let listing = Listing::parse_reference(out);
        assert_eq!(listing.entries(), &["my notes.txt", "123456"]);
        assert!(!listing.contains("NAME"));
        assert!(!listing.contains("notes.txt"));
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("sdcard/DCIM/", "123456"), "sdcard/DCIM/123456");
        assert_eq!(remote_join("sdcard/DCIM", "x.jpg"), "sdcard/DCIM/x.jpg");
    }

    #[test]
    fn test_source_path_from_str() {
        assert_eq!("Media".parse::<SourcePath>(), Ok(SourcePath::Media));
        assert!("photos".parse::<SourcePath>().is_err());
    }

    #[test]
    fn test_source_path_serialization() {
        let json = serde_json::to_string(&SourcePath::Downloads).unwrap();
        assert_eq!(json, "\"downloads\"");
        let back: SourcePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SourcePath::Downloads);
    }
}
